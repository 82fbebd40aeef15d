//! Secret types for protecting channel tokens from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Channel access
//! tokens are time-limited credentials; they travel through join requests,
//! renewals, and the "token will expire" notification, and every one of those
//! structs derives `Debug`. Holding tokens as [`SecretString`] means a stray
//! `{:?}` or tracing field prints `[REDACTED]` instead of the credential.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct JoinRequest {
//!     channel: String,
//!     token: Option<SecretString>,
//! }
//!
//! let req = JoinRequest {
//!     channel: "room1".to_string(),
//!     token: Some(SecretString::from("006abc")),
//! };
//!
//! let debug = format!("{req:?}");
//! assert!(!debug.contains("006abc"));
//!
//! // The transport is the only place that needs the raw value.
//! let raw: &str = req.token.as_ref().map(|t| t.expose_secret()).unwrap_or_default();
//! assert_eq!(raw, "006abc");
//! ```
//!
//! # Empty Tokens
//!
//! Channels without authentication join with no token. Callers frequently
//! express that as an empty string; [`normalize_token`] folds blank tokens
//! into `None` so the engine only ever sees one representation.

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Returns `None` for a missing or blank token, the token otherwise.
#[must_use]
pub fn normalize_token(token: Option<SecretString>) -> Option<SecretString> {
    token.filter(|t| !t.expose_secret().trim().is_empty())
}
