//! Network quality grading.
//!
//! Each input dimension is bucketed on its own and the worst bucket wins.
//! Because every bucket boundary is monotone in its input, raising loss,
//! RTT, or jitter can only keep or worsen the grade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal network quality grade. Ordering follows severity: `Unknown`
/// sorts first, `Down` last.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum NetworkQuality {
    #[default]
    Unknown = 0,
    Excellent = 1,
    Good = 2,
    Poor = 3,
    Bad = 4,
    VeryBad = 5,
    Down = 6,
}

impl NetworkQuality {
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, NetworkQuality::Unknown)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NetworkQuality::Unknown => "unknown",
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Bad => "bad",
            NetworkQuality::VeryBad => "very_bad",
            NetworkQuality::Down => "down",
        }
    }

    /// Worse of two grades, treating `Unknown` as "no opinion".
    #[must_use]
    pub fn worst_known(self, other: NetworkQuality) -> NetworkQuality {
        match (self.is_known(), other.is_known()) {
            (false, _) => other,
            (_, false) => self,
            _ => self.max(other),
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds (exclusive) for Excellent, Good, Poor, Bad, VeryBad.
const LOSS_BOUNDS: [f64; 5] = [0.01, 0.05, 0.10, 0.30, 0.60];
const RTT_BOUNDS_MS: [f64; 4] = [100.0, 200.0, 350.0, 600.0];
const JITTER_BOUNDS_MS: [f64; 4] = [30.0, 60.0, 100.0, 200.0];

const LADDER: [NetworkQuality; 6] = [
    NetworkQuality::Excellent,
    NetworkQuality::Good,
    NetworkQuality::Poor,
    NetworkQuality::Bad,
    NetworkQuality::VeryBad,
    NetworkQuality::Down,
];

/// Grade for one dimension: the first rung whose bound exceeds `value`,
/// else the rung just past the last bound.
fn bucket(value: f64, bounds: &[f64]) -> NetworkQuality {
    let rung = bounds
        .iter()
        .position(|bound| value < *bound)
        .unwrap_or(bounds.len());
    LADDER.get(rung).copied().unwrap_or(NetworkQuality::Down)
}

/// Classify one measurement window.
///
/// `loss_fraction` is in `[0, 1]`; values outside are clamped. Any NaN input
/// yields `Unknown`. RTT and jitter alone can drive the grade to `VeryBad`
/// but never to `Down`, which is reserved for near-total loss.
#[must_use]
pub fn classify(loss_fraction: f64, rtt_ms: f64, jitter_ms: f64) -> NetworkQuality {
    if loss_fraction.is_nan() || rtt_ms.is_nan() || jitter_ms.is_nan() {
        return NetworkQuality::Unknown;
    }

    let loss = bucket(loss_fraction.clamp(0.0, 1.0), &LOSS_BOUNDS);
    let rtt = bucket(rtt_ms.max(0.0), &RTT_BOUNDS_MS);
    let jitter = bucket(jitter_ms.max(0.0), &JITTER_BOUNDS_MS);

    loss.max(rtt).max(jitter)
}
