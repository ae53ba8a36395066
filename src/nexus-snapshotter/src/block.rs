//! Block-mode mount executor.
//!
//! For active snapshots in block mode the template plan is not handed to
//! the runtime: loop setup needs privileges the runtime should not be
//! burdened with, so the snapshotter stages the ext4, lower, and overlay
//! mounts itself under the snapshot directory and returns a single bind to
//! the merged tree. Every step checks the mount table first, so repeated
//! calls converge instead of stacking mounts.

use log::debug;
use std::fs;
use std::path::Path;

use crate::config::SnapshotterConfig;
use crate::error::{Error, Result};
use crate::mount::apply_mount;
use crate::mountinfo;
use crate::paths::{ensure_marker_file, Layout, EROFS_LAYER_MARKER};
use crate::planner::{collect_lower_mounts, Layer};
use crate::snapshot::{Mount, Snapshot};
use crate::tracker::MountTracker;

fn merged_bind(merged: &Path) -> Vec<Mount> {
    vec![Mount::new(
        "bind",
        merged.display().to_string(),
        vec!["rw".to_string(), "rbind".to_string()],
    )]
}

/// Stages the full mount stack for an active block-mode snapshot and
/// returns the single concrete mount the runtime applies.
pub(crate) fn active_mounts(
    layout: &Layout,
    config: &SnapshotterConfig,
    snap: &Snapshot,
    parents: &[Layer],
    tracker: &MountTracker,
) -> Result<Vec<Mount>> {
    let id = &snap.id;
    let upper_root = layout.upper_path(id);
    let rw = layout.rw_path(id);
    let upper = layout.block_upper_path(id);
    let work = layout.block_work_path(id);
    let merged = layout.merged_path(id);

    for dir in [&upper_root, &rw, &layout.lower_root(id), &merged] {
        fs::create_dir_all(dir)?;
    }

    // Fast path: the stack was fully assembled by an earlier call.
    if tracker.is_mounted(id) {
        return Ok(merged_bind(&merged));
    }

    if !mountinfo::is_mountpoint(&rw)? {
        let image = layout.writable_path(id);
        let writable = Mount::new(
            "ext4",
            image.display().to_string(),
            vec!["rw".to_string(), "loop".to_string()],
        );
        apply_mount(&writable, &rw).map_err(|cause| Error::BlockMount {
            source: image,
            target: rw.clone(),
            cause,
        })?;
        debug!("mounted writable layer at {}", rw.display());
    }

    fs::create_dir_all(&upper)?;
    fs::create_dir_all(&work)?;

    if mountinfo::is_mountpoint(&merged)? {
        tracker.set_mounted(id);
        return Ok(merged_bind(&merged));
    }

    // Markers let the differ tell managed layer roots apart from arbitrary
    // bind mounts.
    ensure_marker_file(&upper_root.join(EROFS_LAYER_MARKER))?;
    ensure_marker_file(&rw.join(EROFS_LAYER_MARKER))?;

    if parents.is_empty() {
        return Ok(vec![Mount::new(
            "bind",
            upper.display().to_string(),
            vec!["rw".to_string(), "rbind".to_string()],
        )]);
    }

    let lowers = collect_lower_mounts(layout, config, parents)?;
    let mut lower_dirs = Vec::with_capacity(lowers.len());
    for (index, lower) in lowers.iter().enumerate() {
        let target = layout.lower_target(id, index);
        fs::create_dir_all(&target)?;
        if !mountinfo::is_mountpoint(&target)? {
            apply_mount(lower, &target)?;
        }
        lower_dirs.push(target.display().to_string());
    }

    let mut options = vec![
        format!("lowerdir={}", lower_dirs.join(":")),
        format!("upperdir={}", upper.display()),
        format!("workdir={}", work.display()),
    ];
    options.extend(config.ovl_options.iter().cloned());
    let overlay = Mount::new("overlay", "overlay", options);
    apply_mount(&overlay, &merged)?;
    debug!("mounted overlay at {}", merged.display());

    tracker.set_mounted(id);
    Ok(merged_bind(&merged))
}
