//! State management for Terrastack sessions.
//!
//! This module provides snapshot storage keyed by `(scope, environment)`,
//! the per-key exclusive lock that guards it, and the memory, local file and
//! S3 backends.

mod backend;
mod local;
mod lock;
mod memory;
mod s3;
mod types;

pub use backend::{check_version, is_contention, StateBackend};
pub use local::{LocalStateBackend, STATE_DIR};
pub use lock::{generate_holder_id, BackendKey, LockInfo, LockRetry, LockToken, DEFAULT_LOCK_TTL_SECS, MAX_LOCK_TTL_SECS};
pub use memory::MemoryStateBackend;
pub use s3::S3StateBackend;
pub use types::{SessionHistoryEntry, Snapshot, SnapshotEntry, MAX_HISTORY, SNAPSHOT_FORMAT};
