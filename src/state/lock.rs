//! Lock records and tokens for exclusive session access.
//!
//! A lock is held per [`BackendKey`]. Acquiring it yields a [`LockToken`]
//! that must accompany every snapshot write; a token whose lock has expired
//! or been taken over is stale and writes with it are rejected.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default lock time-to-live in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Longest lock time-to-live honoured, in seconds (one week).
pub const MAX_LOCK_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Identifies one snapshot and its lock: `(scope, environment)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    /// Project or stack group the snapshot belongs to.
    pub scope: String,
    /// Deployment environment.
    pub environment: String,
}

impl BackendKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(scope: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.environment)
    }
}

/// A stored lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Opaque token identifying this acquisition.
    pub token: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Time-to-live applied on acquire and renew, in seconds.
    pub ttl_secs: u64,
}

/// Proof of lock ownership handed to the lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    /// Key the lock was acquired on.
    pub key: BackendKey,
    /// Opaque token value.
    pub token: String,
    /// Holder identity.
    pub holder: String,
}

impl LockInfo {
    /// Creates a fresh lock record with a new token.
    #[must_use]
    pub fn new(holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl_secs = ttl.as_secs().clamp(1, MAX_LOCK_TTL_SECS);
        Self {
            token: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: expiry_after(now, ttl_secs),
            ttl_secs,
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = expiry_after(Utc::now(), self.ttl_secs);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Returns true if the token matches this lock and the lock is still live.
    #[must_use]
    pub fn is_held_by(&self, token: &LockToken) -> bool {
        self.token == token.token && !self.is_expired()
    }

    /// Builds the token handed to the holder.
    #[must_use]
    pub fn token_for(&self, key: &BackendKey) -> LockToken {
        LockToken {
            key: key.clone(),
            token: self.token.clone(),
            holder: self.holder.clone(),
        }
    }

    /// Contention error describing this lock.
    #[must_use]
    pub fn contention(&self, key: &BackendKey) -> crate::error::StateError {
        crate::error::StateError::LockContention {
            key: key.to_string(),
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
            expires_at: self.expires_at.to_rfc3339(),
        }
    }
}

/// `now` plus `ttl_secs`, capped at [`MAX_LOCK_TTL_SECS`].
fn expiry_after(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(ttl_secs.min(MAX_LOCK_TTL_SECS)).unwrap_or(0);
    TimeDelta::try_seconds(secs)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How long `acquire_lock` keeps retrying a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    /// Total time to keep retrying. Zero means a single attempt.
    pub window: Duration,
    /// Delay between attempts.
    pub interval: Duration,
}

impl LockRetry {
    /// A single attempt with no retry.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            window: Duration::ZERO,
            interval: Duration::from_millis(250),
        }
    }

    /// Retries for up to `window`.
    #[must_use]
    pub const fn within(window: Duration) -> Self {
        Self {
            window,
            interval: Duration::from_millis(250),
        }
    }
}

impl Default for LockRetry {
    fn default() -> Self {
        Self::none()
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder", Duration::from_secs(60));
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);

        let key = BackendKey::new("app", "dev");
        let token = lock.token_for(&key);
        assert!(lock.is_held_by(&token));
        assert_eq!(key.to_string(), "app/dev");
    }

    #[test]
    fn test_expired_lock_does_not_hold() {
        let mut lock = LockInfo::new("test-holder", Duration::from_secs(60));
        let token = lock.token_for(&BackendKey::new("app", "dev"));
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert!(!lock.is_held_by(&token));

        lock.refresh();
        assert!(lock.is_held_by(&token));
    }

    #[test]
    fn test_oversized_ttl_is_capped() {
        let mut lock = LockInfo::new("test-holder", Duration::from_secs(10_000_000_000_000));
        assert_eq!(lock.ttl_secs, MAX_LOCK_TTL_SECS);
        assert!(!lock.is_expired());
        assert!(lock.expires_at <= Utc::now() + TimeDelta::seconds(7 * 24 * 60 * 60));

        // A record written with a huge TTL still refreshes without overflowing.
        lock.ttl_secs = u64::MAX;
        lock.refresh();
        assert!(lock.expires_at <= Utc::now() + TimeDelta::seconds(7 * 24 * 60 * 60));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        // IDs should be unique
        assert_ne!(id1, id2);

        // IDs should contain the process ID
        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
