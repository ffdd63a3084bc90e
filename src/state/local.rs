//! Local file-based state backend.
//!
//! Each backend key gets its own directory under the base directory holding
//! `snapshot.json` and, while locked, `lock.json`. The lock file is hard-linked
//! into place and expired locks are renamed away before being replaced, so two
//! processes racing for the lock cannot both win.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StateError, TerrastackError};

use super::backend::{check_version, stale, StateBackend};
use super::lock::{BackendKey, LockInfo, LockRetry, LockToken};
use super::types::Snapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".terrastack";

/// Snapshot file name.
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Lock file name.
const LOCK_FILE: &str = "lock.json";

/// Local file-based state backend.
#[derive(Debug, Clone)]
pub struct LocalStateBackend {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Retry policy for contended locks.
    retry: LockRetry,
}

fn io_error(context: &str, e: &std::io::Error) -> TerrastackError {
    StateError::backend("local", format!("{context}: {e}")).into()
}

impl LocalStateBackend {
    /// Creates a backend rooted at `.terrastack` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TerrastackError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a backend with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            retry: LockRetry::none(),
        }
    }

    /// Sets the retry policy for contended locks.
    #[must_use]
    pub fn with_lock_retry(mut self, retry: LockRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Base directory of this backend.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn key_dir(&self, key: &BackendKey) -> PathBuf {
        self.base_dir.join(&key.scope).join(&key.environment)
    }

    fn snapshot_path(&self, key: &BackendKey) -> PathBuf {
        self.key_dir(key).join(SNAPSHOT_FILE)
    }

    fn lock_path(&self, key: &BackendKey) -> PathBuf {
        self.key_dir(key).join(LOCK_FILE)
    }

    /// Ensures the key directory exists.
    async fn ensure_dir(&self, key: &BackendKey) -> Result<()> {
        let dir = self.key_dir(key);
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error("Failed to create state directory", &e))?;
        }
        Ok(())
    }

    /// Reads the raw lock file if it exists.
    async fn read_lock_content(&self, key: &BackendKey) -> Result<Option<String>> {
        match fs::read_to_string(self.lock_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("Failed to read lock file", &e)),
        }
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self, key: &BackendKey) -> Result<Option<LockInfo>> {
        self.read_lock_content(key).await?.map(|c| parse_lock(&c)).transpose()
    }

    /// Creates the lock file, failing if one already exists.
    ///
    /// The record is written to a file named after its token and then
    /// hard-linked into place, so the lock file never exists half-written.
    async fn create_lock_file(&self, key: &BackendKey, lock_info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let pending = self.key_dir(key).join(format!("{LOCK_FILE}.{}.tmp", lock_info.token));
        Self::write_synced(&pending, &content).await?;

        let linked = fs::hard_link(&pending, self.lock_path(key)).await;
        if let Err(e) = fs::remove_file(&pending).await {
            debug!("Failed to remove {}: {e}", pending.display());
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            }
            .into()),
        }
    }

    /// Moves the expired lock `expired` out of the way for the acquisition
    /// identified by `token`.
    ///
    /// The lock file is renamed to a name unique to `token`, so when several
    /// sessions race to take over the same lock only one rename succeeds. If
    /// the file moved turns out to be a newer lock, it is linked back and the
    /// takeover fails with contention.
    async fn take_over(&self, key: &BackendKey, expired: &LockInfo, token: &str) -> Result<()> {
        let lock_path = self.lock_path(key);
        let moved_path = self.key_dir(key).join(format!("{LOCK_FILE}.{token}.stale"));

        match fs::rename(&lock_path, &moved_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.lost_race(key).await),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to move expired lock file: {e}"),
                }
                .into());
            }
        }

        let moved = fs::read_to_string(&moved_path)
            .await
            .ok()
            .and_then(|content| parse_lock(&content).ok());

        let outcome = match moved {
            Some(lock) if lock.token == expired.token => {
                debug!("Expired lock on {key} held by {}, taking over", lock.holder);
                Ok(())
            }
            moved => {
                if let Err(e) = fs::hard_link(&moved_path, &lock_path).await {
                    debug!("Could not restore lock file for {key}: {e}");
                }
                Err(moved.map_or_else(|| unknown_holder(key), |lock| lock.contention(key).into()))
            }
        };

        if let Err(e) = fs::remove_file(&moved_path).await {
            debug!("Failed to remove {}: {e}", moved_path.display());
        }
        outcome
    }

    /// Contention error after losing a create or takeover race.
    async fn lost_race(&self, key: &BackendKey) -> TerrastackError {
        match self.read_lock_file(key).await {
            Ok(Some(winner)) => winner.contention(key).into(),
            _ => unknown_holder(key),
        }
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self, key: &BackendKey) -> Result<bool> {
        match fs::remove_file(self.lock_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }

    /// Writes and syncs `content` to `path`.
    async fn write_synced(path: &Path, content: &str) -> Result<()> {
        let mut file = fs::File::create(path)
            .await
            .map_err(|e| io_error("Failed to create temp file", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| io_error("Failed to write temp file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("Failed to sync temp file", &e))
    }

    /// Writes `content` to `path` through a temporary file and an atomic rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        Self::write_synced(&temp_path, content).await?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| io_error("Failed to rename temp file", &e))
    }

    async fn held_lock(&self, key: &BackendKey, token: &LockToken) -> Result<LockInfo> {
        match self.read_lock_file(key).await? {
            Some(lock) if lock.is_held_by(token) => Ok(lock),
            _ => Err(stale(key, token)),
        }
    }
}

fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")).into())
}

fn unknown_holder(key: &BackendKey) -> TerrastackError {
    StateError::LockContention {
        key: key.to_string(),
        holder: String::from("unknown"),
        since: String::from("unknown"),
        expires_at: String::from("unknown"),
    }
    .into()
}

#[async_trait]
impl StateBackend for LocalStateBackend {
    async fn try_acquire_lock(&self, key: &BackendKey, holder: &str, ttl: Duration) -> Result<LockToken> {
        self.ensure_dir(key).await?;
        let lock_info = LockInfo::new(holder, ttl);

        if let Some(content) = self.read_lock_content(key).await? {
            // Locks are linked into place fully written, so an empty file is
            // one being created by a process that does not use this backend.
            if content.trim().is_empty() {
                return Err(unknown_holder(key));
            }
            let existing = parse_lock(&content)?;
            if !existing.is_expired() {
                return Err(existing.contention(key).into());
            }
            self.take_over(key, &existing, &lock_info.token).await?;
        }

        if !self.create_lock_file(key, &lock_info).await? {
            return Err(self.lost_race(key).await);
        }

        info!(
            "Acquired state lock on {key}: {} (expires in {}s)",
            lock_info.token, lock_info.ttl_secs
        );
        Ok(lock_info.token_for(key))
    }

    async fn read_snapshot(&self, key: &BackendKey) -> Result<Snapshot> {
        let path = self.snapshot_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Snapshot does not exist: {}", path.display());
                return Ok(Snapshot::empty());
            }
            Err(e) => return Err(io_error("Failed to read snapshot", &e)),
        };

        info!("Loading snapshot from: {}", path.display());
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse snapshot: {e}")))?;
        Ok(snapshot)
    }

    async fn write_snapshot(&self, key: &BackendKey, token: &LockToken, snapshot: &Snapshot) -> Result<()> {
        self.held_lock(key, token).await?;
        let stored = self.read_snapshot(key).await?;
        check_version(stored.version, snapshot.version)?;

        self.ensure_dir(key).await?;
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot: {e}")))?;

        let path = self.snapshot_path(key);
        info!("Saving snapshot v{} to: {}", snapshot.version, path.display());
        Self::write_atomic(&path, &content).await
    }

    async fn release_lock(&self, key: &BackendKey, token: &LockToken) -> Result<()> {
        if let Some(existing) = self.read_lock_file(key).await? {
            if existing.token == token.token {
                self.delete_lock_file(key).await?;
                info!("Released state lock on {key}: {}", token.token);
            } else {
                debug!("Lock token mismatch: expected {}, found {}", token.token, existing.token);
            }
        }
        Ok(())
    }

    async fn renew_lock(&self, key: &BackendKey, token: &LockToken) -> Result<LockInfo> {
        let mut lock = self.held_lock(key, token).await?;
        lock.refresh();

        let content = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&self.lock_path(key), &content).await?;

        debug!("Renewed lock on {key} until {}", lock.expires_at);
        Ok(lock)
    }

    async fn lock_info(&self, key: &BackendKey) -> Result<Option<LockInfo>> {
        self.read_lock_file(key).await
    }

    async fn force_unlock(&self, key: &BackendKey) -> Result<bool> {
        let removed = self.delete_lock_file(key).await?;
        if removed {
            info!("Force-unlocked {key}");
        }
        Ok(removed)
    }

    fn lock_retry(&self) -> LockRetry {
        self.retry
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    fn create_test_backend() -> (LocalStateBackend, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = LocalStateBackend::with_base_dir(temp_dir.path());
        (backend, temp_dir)
    }

    fn key() -> BackendKey {
        BackendKey::new("net", "dev")
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (backend, _temp) = create_test_backend();

        let token = backend.acquire_lock(&key(), "holder", TTL).await.expect("lock");
        let snapshot = Snapshot {
            version: 1,
            ..Snapshot::empty()
        };
        backend.write_snapshot(&key(), &token, &snapshot).await.expect("write");

        let loaded = backend.read_snapshot(&key()).await.expect("read");
        assert_eq!(loaded.version, 1);
        assert!(backend.base_dir().join("net/dev/snapshot.json").exists());
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let (backend, _temp) = create_test_backend();

        let snapshot = backend.read_snapshot(&key()).await.expect("Read should not fail");
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (backend, _temp) = create_test_backend();

        let token = backend
            .acquire_lock(&key(), "test-holder", TTL)
            .await
            .expect("Failed to acquire lock");
        assert!(backend.lock_info(&key()).await.unwrap().is_some());

        backend.release_lock(&key(), &token).await.expect("Failed to release lock");
        assert!(backend.lock_info(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (backend, _temp) = create_test_backend();

        let _lock1 = backend
            .acquire_lock(&key(), "holder-1", TTL)
            .await
            .expect("Failed to acquire first lock");

        let result = backend.acquire_lock(&key(), "holder-2", TTL).await;
        assert!(matches!(
            result,
            Err(TerrastackError::State(StateError::LockContention { ref holder, .. })) if holder == "holder-1"
        ));

        // Other keys are independent.
        backend
            .acquire_lock(&BackendKey::new("net", "prod"), "holder-2", TTL)
            .await
            .expect("independent key");
    }

    #[tokio::test]
    async fn test_write_without_lock_is_stale() {
        let (backend, _temp) = create_test_backend();
        let token = backend.acquire_lock(&key(), "a", TTL).await.unwrap();
        backend.release_lock(&key(), &token).await.unwrap();

        let result = backend
            .write_snapshot(&key(), &token, &Snapshot { version: 1, ..Snapshot::empty() })
            .await;
        assert!(matches!(result, Err(TerrastackError::State(StateError::StaleWrite { .. }))));
        assert_eq!(backend.read_snapshot(&key()).await.unwrap().version, 0);
    }

    /// Acquires the lock as `holder` and rewrites it as already expired.
    async fn expired_lock(backend: &LocalStateBackend, holder: &str) -> LockToken {
        let token = backend.acquire_lock(&key(), holder, TTL).await.unwrap();

        let mut lock = backend.lock_info(&key()).await.unwrap().unwrap();
        lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        LocalStateBackend::write_atomic(&backend.lock_path(&key()), &serde_json::to_string(&lock).unwrap())
            .await
            .unwrap();
        token
    }

    fn lock_dir_entries(backend: &LocalStateBackend) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(backend.key_dir(&key()))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (backend, _temp) = create_test_backend();
        let first = expired_lock(&backend, "a").await;

        let second = backend.acquire_lock(&key(), "b", TTL).await.unwrap();
        assert_ne!(first.token, second.token);
        assert!(backend.renew_lock(&key(), &first).await.is_err());
        assert!(backend.renew_lock(&key(), &second).await.is_ok());
        assert_eq!(lock_dir_entries(&backend), ["lock.json"]);
    }

    #[tokio::test]
    async fn test_takeover_after_newer_lock_keeps_winner() {
        let (backend, _temp) = create_test_backend();
        expired_lock(&backend, "old").await;

        // Session b sees the expired lock, then session a takes it over first.
        let seen_by_b = backend.read_lock_file(&key()).await.unwrap().unwrap();
        let a = backend.acquire_lock(&key(), "a", TTL).await.unwrap();

        let result = backend.take_over(&key(), &seen_by_b, "b-token").await;
        assert!(matches!(
            result,
            Err(TerrastackError::State(StateError::LockContention { ref holder, .. })) if holder == "a"
        ));

        let current = backend.lock_info(&key()).await.unwrap().unwrap();
        assert_eq!(current.token, a.token);
        assert!(backend.renew_lock(&key(), &a).await.is_ok());
        assert_eq!(lock_dir_entries(&backend), ["lock.json"]);
    }

    #[tokio::test]
    async fn test_takeover_of_vanished_lock_is_contention() {
        let (backend, _temp) = create_test_backend();
        let token = expired_lock(&backend, "old").await;
        let seen = backend.read_lock_file(&key()).await.unwrap().unwrap();
        backend.release_lock(&key(), &token).await.unwrap();

        let result = backend.take_over(&key(), &seen, "b-token").await;
        assert!(matches!(
            result,
            Err(TerrastackError::State(StateError::LockContention { .. }))
        ));
    }

    #[tokio::test]
    async fn test_half_written_lock_is_contention() {
        let (backend, _temp) = create_test_backend();
        backend.ensure_dir(&key()).await.unwrap();
        std::fs::write(backend.lock_path(&key()), "").unwrap();

        let result = backend.try_acquire_lock(&key(), "b", TTL).await;
        assert!(matches!(
            result,
            Err(TerrastackError::State(StateError::LockContention { ref holder, .. })) if holder == "unknown"
        ));
    }

    #[tokio::test]
    async fn test_lock_file_written_in_full() {
        let (backend, _temp) = create_test_backend();
        let token = backend.acquire_lock(&key(), "a", TTL).await.unwrap();

        assert_eq!(lock_dir_entries(&backend), ["lock.json"]);
        let stored = backend.read_lock_file(&key()).await.unwrap().unwrap();
        assert_eq!(stored.token, token.token);
        assert_eq!(stored.holder, "a");
    }
}
