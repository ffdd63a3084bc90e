//! State backend trait definition.
//!
//! This module defines the common interface for snapshot storage and the
//! per-key exclusive lock that guards it.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::lock::{BackendKey, LockInfo, LockRetry, LockToken};
use super::types::Snapshot;
use crate::error::{Result, StateError, TerrastackError};

/// Trait for state storage backends.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Makes a single attempt to acquire the lock for `key`.
    ///
    /// An expired lock is taken over.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockContention`] if a live lock exists.
    async fn try_acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken>;

    /// Acquires the lock, retrying contention within [`StateBackend::lock_retry`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockContention`] once the retry window is exhausted.
    async fn acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        let retry = self.lock_retry();
        let deadline = Instant::now() + retry.window;
        loop {
            match self.try_acquire_lock(key, holder, ttl).await {
                Err(err) if is_contention(&err) && Instant::now() < deadline => {
                    debug!("State {key} is locked, retrying in {:?}", retry.interval);
                    tokio::time::sleep(retry.interval.min(deadline.saturating_duration_since(Instant::now()))).await;
                }
                result => return result,
            }
        }
    }

    /// Reads the snapshot for `key`. A missing snapshot is empty at version 0.
    async fn read_snapshot(&self, key: &BackendKey) -> Result<Snapshot>;

    /// Writes a snapshot on behalf of a lock holder.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleWrite`] if `token` is not the live lock for
    /// `key`, and [`StateError::VersionMismatch`] if `snapshot.version` does
    /// not exceed the stored version. The stored snapshot is left unchanged.
    async fn write_snapshot(&self, key: &BackendKey, token: &LockToken, snapshot: &Snapshot) -> Result<()>;

    /// Releases the lock. Releasing a lock that is not held by `token` is a no-op.
    async fn release_lock(&self, key: &BackendKey, token: &LockToken) -> Result<()>;

    /// Extends the lock's expiry by its time-to-live.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleWrite`] if the token no longer holds the lock.
    async fn renew_lock(&self, key: &BackendKey, token: &LockToken) -> Result<LockInfo>;

    /// Gets the current lock record, live or expired.
    async fn lock_info(&self, key: &BackendKey) -> Result<Option<LockInfo>>;

    /// Removes any lock on `key` regardless of holder. Returns true if one existed.
    async fn force_unlock(&self, key: &BackendKey) -> Result<bool>;

    /// Retry policy used by [`StateBackend::acquire_lock`].
    fn lock_retry(&self) -> LockRetry {
        LockRetry::none()
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Returns true if the error reports a live lock held by someone else.
#[must_use]
pub const fn is_contention(err: &TerrastackError) -> bool {
    matches!(err, TerrastackError::State(StateError::LockContention { .. }))
}

/// Builds the error for a write or renew presented with a superseded token.
#[must_use]
pub fn stale(key: &BackendKey, token: &LockToken) -> TerrastackError {
    StateError::StaleWrite {
        key: key.to_string(),
        token: token.token.clone(),
    }
    .into()
}

/// Rejects a write whose version does not advance past the stored one.
///
/// # Errors
///
/// Returns [`StateError::VersionMismatch`] when `incoming <= stored`.
pub fn check_version(stored: u64, incoming: u64) -> Result<()> {
    if incoming <= stored {
        return Err(StateError::VersionMismatch {
            expected: stored,
            found: incoming,
        }
        .into());
    }
    Ok(())
}

#[async_trait]
impl StateBackend for Box<dyn StateBackend> {
    async fn try_acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        (**self).try_acquire_lock(key, holder, ttl).await
    }

    async fn acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        (**self).acquire_lock(key, holder, ttl).await
    }

    async fn read_snapshot(&self, key: &BackendKey) -> Result<Snapshot> {
        (**self).read_snapshot(key).await
    }

    async fn write_snapshot(&self, key: &BackendKey, token: &LockToken, snapshot: &Snapshot) -> Result<()> {
        (**self).write_snapshot(key, token, snapshot).await
    }

    async fn release_lock(&self, key: &BackendKey, token: &LockToken) -> Result<()> {
        (**self).release_lock(key, token).await
    }

    async fn renew_lock(&self, key: &BackendKey, token: &LockToken) -> Result<LockInfo> {
        (**self).renew_lock(key, token).await
    }

    async fn lock_info(&self, key: &BackendKey) -> Result<Option<LockInfo>> {
        (**self).lock_info(key).await
    }

    async fn force_unlock(&self, key: &BackendKey) -> Result<bool> {
        (**self).force_unlock(key).await
    }

    fn lock_retry(&self) -> LockRetry {
        (**self).lock_retry()
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
