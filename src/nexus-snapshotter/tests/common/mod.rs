//! Shared helpers for integration tests.
//!
//! Tests that need nothing beyond the metadata lifecycle run the
//! snapshotter in block mode with extract-style keys: those paths touch no
//! external tools and no mounts, so they work unprivileged on any
//! filesystem. Tests that exercise mount planning in directory mode skip
//! themselves when the kernel does not register erofs, and tests driving
//! the real converter skip without mkfs.erofs — the same policy the tool
//! checks in similar projects use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nexus_snapshotter::{Snapshotter, SnapshotterConfig};

#[allow(dead_code)]
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[allow(dead_code)]
pub fn erofs_available() -> bool {
    nexus_snapshotter::preflight::erofs_registered()
}

#[allow(dead_code)]
pub fn mkfs_erofs_available() -> bool {
    erofs_common::mkfs_erofs_available()
}

#[allow(dead_code)]
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// A snapshotter whose metadata paths can be exercised without any
/// external tools (block mode skips the directory-mode compatibility
/// probes; extract keys skip writable-layer creation and mounting).
#[allow(dead_code)]
pub fn block_snapshotter(root: &Path) -> Snapshotter {
    Snapshotter::new(root, SnapshotterConfig::default().with_default_size(1 << 20))
        .expect("failed to create snapshotter")
}

/// A directory-mode snapshotter, or `None` when the host cannot run one
/// (no erofs in the kernel, or an unusable backing filesystem).
#[allow(dead_code)]
pub fn dir_snapshotter_with(root: &Path, config: SnapshotterConfig) -> Option<Snapshotter> {
    match Snapshotter::new(root, config) {
        Ok(s) => Some(s),
        Err(err) if err.is_skip_plugin() || err.is_failed_precondition() => {
            eprintln!("skipping: {err}");
            None
        }
        Err(err) => panic!("unexpected snapshotter error: {err}"),
    }
}

#[allow(dead_code)]
pub fn dir_snapshotter(root: &Path) -> Option<Snapshotter> {
    dir_snapshotter_with(root, SnapshotterConfig::default())
}

/// A key whose final segment marks it as an unpack snapshot.
#[allow(dead_code)]
pub fn extract_key(n: u64) -> String {
    format!("default/{n}/extract-{n}")
}

#[allow(dead_code)]
pub fn no_labels() -> HashMap<String, String> {
    HashMap::new()
}

/// Plants a layer blob at the conventional path, standing in for a
/// cooperating differ that wrote the blob during the pull. Commit then
/// uses it as-is instead of converting the upper directory.
#[allow(dead_code)]
pub async fn fabricate_blob(root: &Path, s: &Snapshotter, key: &str) -> PathBuf {
    let info = s.stat(key).await.expect("stat for blob fabrication");
    let path = root.join("snapshots").join(&info.id).join("layer.erofs");
    std::fs::write(&path, b"fake erofs image").expect("write fabricated blob");
    path
}

/// Prepare + fabricated blob + commit, for building committed chains
/// without external tools.
#[allow(dead_code)]
pub async fn commit_fake_layer(
    root: &Path,
    s: &Snapshotter,
    key: &str,
    name: &str,
    parent: &str,
) {
    s.prepare(key, parent, no_labels()).await.expect("prepare");
    fabricate_blob(root, s, key).await;
    s.commit(name, key, no_labels()).await.expect("commit");
}
