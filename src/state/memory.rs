//! In-process state backend.
//!
//! Clones share the same storage, so several sessions in one process can
//! contend for the same keys. Waiters on a contended lock are woken when the
//! lock is released instead of polling.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::backend::{check_version, is_contention, stale, StateBackend};
use super::lock::{BackendKey, LockInfo, LockRetry, LockToken};
use super::types::Snapshot;
use crate::error::{Result, StateError};

#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<Snapshot>,
    lock: Option<LockInfo>,
}

#[derive(Debug, Default)]
struct Shared {
    slots: Mutex<HashMap<BackendKey, Slot>>,
    released: Notify,
}

/// State backend keeping snapshots and locks in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateBackend {
    shared: Arc<Shared>,
    retry: LockRetry,
}

impl MemoryStateBackend {
    /// Creates an empty backend that fails contended acquisitions immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long contended acquisitions wait for a release.
    #[must_use]
    pub fn with_lock_retry(mut self, retry: LockRetry) -> Self {
        self.retry = retry;
        self
    }

    fn slots(&self) -> Result<MutexGuard<'_, HashMap<BackendKey, Slot>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| StateError::backend("memory", "state mutex poisoned").into())
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn try_acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        let mut slots = self.slots()?;
        let slot = slots.entry(key.clone()).or_default();

        if let Some(existing) = &slot.lock {
            if !existing.is_expired() {
                return Err(existing.contention(key).into());
            }
            debug!("Expired lock on {key} held by {}, taking over", existing.holder);
        }

        let lock = LockInfo::new(holder, ttl);
        let token = lock.token_for(key);
        slot.lock = Some(lock);
        drop(slots);

        info!("Acquired state lock on {key} for {holder}");
        Ok(token)
    }

    async fn acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        let deadline = Instant::now() + self.retry.window;
        loop {
            // Registered before the attempt so a release in between is not missed.
            let released = self.shared.released.notified();
            match self.try_acquire_lock(key, holder, ttl).await {
                Err(err) if is_contention(&err) && Instant::now() < deadline => {
                    let wait = self
                        .retry
                        .interval
                        .min(deadline.saturating_duration_since(Instant::now()));
                    // Timing out only means re-checking for expiry.
                    let _ = tokio::time::timeout(wait, released).await;
                }
                result => return result,
            }
        }
    }

    async fn read_snapshot(&self, key: &BackendKey) -> Result<Snapshot> {
        let slots = self.slots()?;
        Ok(slots
            .get(key)
            .and_then(|s| s.snapshot.clone())
            .unwrap_or_default())
    }

    async fn write_snapshot(&self, key: &BackendKey, token: &LockToken, snapshot: &Snapshot) -> Result<()> {
        let mut slots = self.slots()?;
        let slot = slots.entry(key.clone()).or_default();

        if !slot.lock.as_ref().is_some_and(|l| l.is_held_by(token)) {
            return Err(stale(key, token));
        }
        let stored = slot.snapshot.as_ref().map_or(0, |s| s.version);
        check_version(stored, snapshot.version)?;

        slot.snapshot = Some(snapshot.clone());
        debug!("Wrote snapshot v{} for {key}", snapshot.version);
        Ok(())
    }

    async fn release_lock(&self, key: &BackendKey, token: &LockToken) -> Result<()> {
        let released = {
            let mut slots = self.slots()?;
            match slots.get_mut(key) {
                Some(slot) if slot.lock.as_ref().is_some_and(|l| l.token == token.token) => {
                    slot.lock = None;
                    true
                }
                _ => false,
            }
        };

        if released {
            info!("Released state lock on {key}");
            self.shared.released.notify_waiters();
        } else {
            debug!("Lock on {key} is not held by token {}, nothing to release", token.token);
        }
        Ok(())
    }

    async fn renew_lock(&self, key: &BackendKey, token: &LockToken) -> Result<LockInfo> {
        let mut slots = self.slots()?;
        match slots.get_mut(key).and_then(|s| s.lock.as_mut()) {
            Some(lock) if lock.is_held_by(token) => {
                lock.refresh();
                Ok(lock.clone())
            }
            _ => Err(stale(key, token)),
        }
    }

    async fn lock_info(&self, key: &BackendKey) -> Result<Option<LockInfo>> {
        let slots = self.slots()?;
        Ok(slots.get(key).and_then(|s| s.lock.clone()))
    }

    async fn force_unlock(&self, key: &BackendKey) -> Result<bool> {
        let removed = {
            let mut slots = self.slots()?;
            slots.get_mut(key).and_then(|s| s.lock.take()).is_some()
        };
        if removed {
            info!("Force-unlocked {key}");
            self.shared.released.notify_waiters();
        }
        Ok(removed)
    }

    fn lock_retry(&self) -> LockRetry {
        self.retry
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerrastackError;

    const TTL: Duration = Duration::from_secs(60);

    fn key() -> BackendKey {
        BackendKey::new("app", "dev")
    }

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            version,
            ..Snapshot::empty()
        }
    }

    #[tokio::test]
    async fn test_read_missing_snapshot_is_empty() {
        let backend = MemoryStateBackend::new();
        let snapshot = backend.read_snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exactly_one_wins() {
        let backend = MemoryStateBackend::new();
        let (key_a, key_b) = (key(), key());
        let (a, b) = tokio::join!(
            backend.acquire_lock(&key_a, "holder-a", TTL),
            backend.acquire_lock(&key_b, "holder-b", TTL),
        );
        assert!(a.is_ok() ^ b.is_ok());
        let err = a.err().or(b.err()).unwrap();
        assert!(is_contention(&err));
    }

    #[tokio::test]
    async fn test_stale_token_write_rejected() {
        let backend = MemoryStateBackend::new();
        let first = backend.acquire_lock(&key(), "a", TTL).await.unwrap();
        backend.write_snapshot(&key(), &first, &snapshot(1)).await.unwrap();

        // Expire the first holder's lock and let someone else take over.
        {
            let mut slots = backend.slots().unwrap();
            let lock = slots.get_mut(&key()).unwrap().lock.as_mut().unwrap();
            lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        }
        let second = backend.acquire_lock(&key(), "b", TTL).await.unwrap();

        let result = backend.write_snapshot(&key(), &first, &snapshot(2)).await;
        assert!(matches!(result, Err(TerrastackError::State(StateError::StaleWrite { .. }))));
        assert_eq!(backend.read_snapshot(&key()).await.unwrap().version, 1);

        backend.write_snapshot(&key(), &second, &snapshot(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_version_must_advance() {
        let backend = MemoryStateBackend::new();
        let token = backend.acquire_lock(&key(), "a", TTL).await.unwrap();
        backend.write_snapshot(&key(), &token, &snapshot(3)).await.unwrap();

        let result = backend.write_snapshot(&key(), &token, &snapshot(3)).await;
        assert!(matches!(
            result,
            Err(TerrastackError::State(StateError::VersionMismatch { expected: 3, found: 3 }))
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_ignores_foreign_tokens() {
        let backend = MemoryStateBackend::new();
        let token = backend.acquire_lock(&key(), "a", TTL).await.unwrap();
        let foreign = LockToken {
            token: "other".into(),
            ..token.clone()
        };

        backend.release_lock(&key(), &foreign).await.unwrap();
        assert!(backend.lock_info(&key()).await.unwrap().is_some());

        backend.release_lock(&key(), &token).await.unwrap();
        backend.release_lock(&key(), &token).await.unwrap();
        assert!(backend.lock_info(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let backend = MemoryStateBackend::new().with_lock_retry(LockRetry::within(Duration::from_secs(5)));
        let held = backend.acquire_lock(&key(), "a", TTL).await.unwrap();

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.acquire_lock(&key(), "b", TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.release_lock(&key(), &held).await.unwrap();

        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.holder, "b");
    }

    #[tokio::test]
    async fn test_renew_and_force_unlock() {
        let backend = MemoryStateBackend::new();
        let token = tokio_test::assert_ok!(backend.acquire_lock(&key(), "a", TTL).await);
        let renewed = tokio_test::assert_ok!(backend.renew_lock(&key(), &token).await);
        assert_eq!(renewed.token, token.token);

        assert!(backend.force_unlock(&key()).await.unwrap());
        tokio_test::assert_err!(backend.renew_lock(&key(), &token).await);
        assert!(!backend.force_unlock(&key()).await.unwrap());
    }
}
