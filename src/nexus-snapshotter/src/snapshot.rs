//! Value types describing snapshots and the mounts that realize them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Created by `prepare`, writable through its mounts, ends with
    /// `commit` or `remove`.
    Active,
    /// Read-only window over a committed parent chain.
    View,
    /// Immutable result of `commit`; only labels may change afterwards.
    Committed,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Active => write!(f, "active"),
            Kind::View => write!(f, "view"),
            Kind::Committed => write!(f, "committed"),
        }
    }
}

/// Client-visible snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Internal stable identifier; also the snapshot's directory name on disk.
    pub id: String,
    /// The key (for active/view snapshots) or name (for committed ones).
    pub name: String,
    /// Name of the committed parent, empty for base layers.
    pub parent: String,
    pub kind: Kind,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resource usage of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub size: u64,
    pub inodes: u64,
}

/// Resolved identity of a snapshot inside the store.
///
/// `parent_ids` lists the ancestor chain newest-first: index 0 is the
/// immediate parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub kind: Kind,
    pub parent_ids: Vec<String>,
}

/// A single mount description handed back to the runtime.
///
/// `options` mixes POSIX mount flags (`ro`, `loop`, `rbind`, ...) with
/// filesystem data options and, for template mounts, `{{ mount i }}` /
/// `{{ overlay i j }}` placeholders the mount manager resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub options: Vec<String>,
}

impl Mount {
    pub fn new(fs_type: impl Into<String>, source: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            source: source.into(),
            fs_type: fs_type.into(),
            options,
        }
    }
}

/// Filter for `walk`; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct WalkFilter {
    pub kind: Option<Kind>,
    pub parent: Option<String>,
    /// Label equality constraints; all must hold.
    pub labels: Vec<(String, String)>,
}

impl WalkFilter {
    pub fn matches(&self, info: &Info) -> bool {
        if let Some(kind) = self.kind {
            if info.kind != kind {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if &info.parent != parent {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| info.labels.get(k) == Some(v))
    }
}
