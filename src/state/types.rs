//! Snapshot types: the recorded state of applied resources.
//!
//! A snapshot is what the planner diffs against. It records, per resource
//! address, the concrete attributes that were applied, their content hash,
//! the outputs the provider computed, and the resources it depended on at
//! apply time.

use crate::graph::ResourceAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current version of the snapshot format.
pub const SNAPSHOT_FORMAT: &str = "1.0";

/// Maximum number of history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The recorded result of the last applied session for one backend key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Snapshot format version.
    pub format: String,
    /// Monotonic version, incremented by every successful write.
    pub version: u64,
    /// Recorded resources by address.
    pub resources: BTreeMap<ResourceAddress, SnapshotEntry>,
    /// When the snapshot was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Recent sessions, oldest first.
    #[serde(default)]
    pub history: Vec<SessionHistoryEntry>,
}

/// The recorded state of one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Resource kind tag.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Concrete attributes as applied.
    pub attributes: BTreeMap<String, Value>,
    /// Content hash of type and attributes.
    pub content_hash: String,
    /// Outputs computed by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Resources this one depended on when applied.
    #[serde(default)]
    pub depends_on: Vec<ResourceAddress>,
    /// When this entry was last applied.
    pub applied_at: DateTime<Utc>,
}

/// Summary of one apply session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryEntry {
    /// When the session finished.
    pub timestamp: DateTime<Utc>,
    /// Lock holder that ran the session.
    pub holder: String,
    /// Snapshot version written by the session.
    pub version: u64,
    /// Operations that succeeded and changed something.
    pub changed: usize,
    /// Operations that failed.
    pub failed: usize,
    /// Operations cancelled or skipped.
    pub not_run: usize,
    /// Whether every operation succeeded.
    pub success: bool,
}

impl Snapshot {
    /// Creates an empty snapshot at version 0.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            format: SNAPSHOT_FORMAT.to_string(),
            version: 0,
            resources: BTreeMap::new(),
            last_updated: None,
            history: Vec::new(),
        }
    }

    /// Returns true if nothing has ever been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Number of recorded resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Gets a recorded resource.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&SnapshotEntry> {
        self.resources.get(address)
    }

    /// Looks up an output the provider computed for a resource.
    #[must_use]
    pub fn output(&self, address: &ResourceAddress, name: &str) -> Option<&Value> {
        self.resources.get(address).and_then(|e| e.outputs.get(name))
    }

    /// Records a resource, replacing any previous entry.
    pub fn upsert(&mut self, address: ResourceAddress, entry: SnapshotEntry) {
        self.resources.insert(address, entry);
    }

    /// Removes a resource.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<SnapshotEntry> {
        self.resources.remove(address)
    }

    /// Addresses that recorded a dependency on `address`.
    #[must_use]
    pub fn dependents_of(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.resources
            .iter()
            .filter(|(_, entry)| entry.depends_on.contains(address))
            .map(|(a, _)| a)
            .collect()
    }

    /// Derives the snapshot that follows this one, with the given history entry appended.
    #[must_use]
    pub fn next(&self, resources: BTreeMap<ResourceAddress, SnapshotEntry>, history: SessionHistoryEntry) -> Self {
        let mut entries = self.history.clone();
        entries.push(history);
        if entries.len() > MAX_HISTORY {
            let excess = entries.len() - MAX_HISTORY;
            entries.drain(0..excess);
        }
        Self {
            format: SNAPSHOT_FORMAT.to_string(),
            version: self.version + 1,
            resources,
            last_updated: Some(Utc::now()),
            history: entries,
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}
