//! Network quality monitoring and adaptive stream control.
//!
//! - [`classify`] grades one measurement window
//! - [`QualityMonitor`] turns transport counters into graded samples
//! - [`QualityController`] turns graded samples into fallback decisions

pub mod classify;
pub mod controller;
pub mod monitor;

pub use classify::{classify, NetworkQuality};
pub use controller::{
    FallbackPolicy, PublishState, QualityController, SubscribeChange, SubscribeLevel, VideoLayer,
};
pub use monitor::{LinkQuality, QualityMonitor, QualityRound, QualitySample};
