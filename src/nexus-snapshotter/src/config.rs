//! Snapshotter configuration.

use serde::Deserialize;

/// Configuration for a [`crate::Snapshotter`] instance.
///
/// `default_writable_size > 0` switches the snapshotter into block mode:
/// every active snapshot gets an ext4 loop image of that size as its
/// writable layer instead of a plain upper directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotterConfig {
    /// Extra options appended verbatim to overlayfs mounts
    /// (e.g. `index=off`, `metacopy=off`).
    pub ovl_options: Vec<String>,
    /// Enable fsverity on committed layer blobs.
    pub enable_fsverity: bool,
    /// Set the IMMUTABLE file attribute on committed layer blobs.
    pub set_immutable: bool,
    /// Size in bytes of the ext4 writable layer; 0 disables block mode.
    pub default_writable_size: u64,
    /// Merge layer metadata into a single fsmeta image once a chain grows
    /// beyond this many layers; 0 disables merging.
    pub fs_merge_threshold: u32,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            ovl_options: Vec::new(),
            enable_fsverity: false,
            set_immutable: false,
            default_writable_size: 0,
            fs_merge_threshold: 0,
        }
    }
}

impl SnapshotterConfig {
    pub fn with_ovl_options(mut self, options: Vec<String>) -> Self {
        self.ovl_options = options;
        self
    }

    pub fn with_fsverity(mut self) -> Self {
        self.enable_fsverity = true;
        self
    }

    pub fn with_immutable(mut self) -> Self {
        self.set_immutable = true;
        self
    }

    pub fn with_default_size(mut self, size: u64) -> Self {
        self.default_writable_size = size;
        self
    }

    pub fn with_fs_merge_threshold(mut self, threshold: u32) -> Self {
        self.fs_merge_threshold = threshold;
        self
    }

    pub fn block_mode(&self) -> bool {
        self.default_writable_size > 0
    }
}
