//! Session token lifecycle.
//!
//! Expiry arrives as a wall-clock epoch from the server and is converted to
//! a monotonic deadline once, so later checks are unaffected by clock jumps
//! and follow paused test time.

use chrono::{DateTime, Utc};
use common::secret::SecretString;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a periodic token check.
#[derive(Debug)]
pub enum TokenCheck {
    Nothing,
    /// The token expires within the warning lead. Reported once per token.
    WillExpire(SecretString),
    /// The deadline passed. Reported once per token.
    Expired,
}

#[derive(Debug, Default)]
pub struct TokenTracker {
    token: Option<SecretString>,
    deadline: Option<Instant>,
    warned: bool,
    expired: bool,
}

impl TokenTracker {
    #[must_use]
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Record the expiry the server reported for the current token.
    pub fn set_expiry(&mut self, expires_at: Option<DateTime<Utc>>, now: Instant) {
        self.deadline = expires_at.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            now + remaining
        });
    }

    /// Replace the token. Expiry is unknown until the server confirms it.
    pub fn renew(&mut self, token: SecretString) {
        self.token = Some(token);
        self.deadline = None;
        self.warned = false;
        self.expired = false;
    }

    /// Mark the token expired on the server's word.
    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    pub fn check(&mut self, now: Instant, lead: Duration) -> TokenCheck {
        let Some(deadline) = self.deadline else {
            return TokenCheck::Nothing;
        };
        if self.expired {
            return TokenCheck::Nothing;
        }
        if now >= deadline {
            self.expired = true;
            return TokenCheck::Expired;
        }
        if !self.warned && now + lead >= deadline {
            self.warned = true;
            if let Some(token) = &self.token {
                return TokenCheck::WillExpire(token.clone());
            }
        }
        TokenCheck::Nothing
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn token(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_expiry_never_fires() {
        let mut tracker = TokenTracker::new(Some(token("tok1")));
        tracker.set_expiry(None, Instant::now());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(matches!(
            tracker.check(Instant::now(), Duration::from_secs(30)),
            TokenCheck::Nothing
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warns_once_then_expires_once() {
        let mut tracker = TokenTracker::new(Some(token("tok1")));
        let lead = Duration::from_secs(30);
        tracker.set_expiry(
            Some(Utc::now() + chrono::Duration::seconds(60)),
            Instant::now(),
        );

        assert!(matches!(tracker.check(Instant::now(), lead), TokenCheck::Nothing));

        tokio::time::advance(Duration::from_secs(31)).await;
        match tracker.check(Instant::now(), lead) {
            TokenCheck::WillExpire(t) => assert_eq!(t.expose_secret(), "tok1"),
            other => panic!("expected warning, got {other:?}"),
        }
        assert!(matches!(tracker.check(Instant::now(), lead), TokenCheck::Nothing));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(tracker.check(Instant::now(), lead), TokenCheck::Expired));
        assert!(tracker.is_expired());
        assert!(matches!(tracker.check(Instant::now(), lead), TokenCheck::Nothing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_expiry_expires_immediately() {
        let mut tracker = TokenTracker::new(Some(token("old")));
        tracker.set_expiry(
            Some(Utc::now() - chrono::Duration::seconds(5)),
            Instant::now(),
        );
        assert!(matches!(
            tracker.check(Instant::now(), Duration::from_secs(30)),
            TokenCheck::Expired
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_rearms_warning() {
        let mut tracker = TokenTracker::new(Some(token("tok1")));
        let lead = Duration::from_secs(30);
        tracker.set_expiry(
            Some(Utc::now() + chrono::Duration::seconds(10)),
            Instant::now(),
        );
        assert!(matches!(tracker.check(Instant::now(), lead), TokenCheck::WillExpire(_)));

        tracker.renew(token("tok2"));
        assert_eq!(tracker.token().map(|t| t.expose_secret().to_string()).as_deref(), Some("tok2"));
        tracker.set_expiry(
            Some(Utc::now() + chrono::Duration::seconds(20)),
            Instant::now(),
        );
        match tracker.check(Instant::now(), lead) {
            TokenCheck::WillExpire(t) => assert_eq!(t.expose_secret(), "tok2"),
            other => panic!("expected warning, got {other:?}"),
        }
    }
}
