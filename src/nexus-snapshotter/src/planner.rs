//! Mount plan composition.
//!
//! The planner is pure with respect to mounts: it reads snapshot state and
//! the filesystem but never calls `mount(2)`, returning the stack as data.
//! Concrete descriptions are used verbatim by the runtime; template
//! descriptions carry `{{ mount i }}` / `{{ overlay i j }}` placeholders
//! that the mount manager (or the block executor) resolves against earlier
//! entries in the list.

use std::collections::HashMap;
use std::path::Path;

use crate::config::SnapshotterConfig;
use crate::error::Result;
use crate::fsverity;
use crate::labels::{LABEL_EXTRACT, LABEL_FSMETA_READY, LABEL_VALUE_TRUE};
use crate::paths::Layout;
use crate::snapshot::{Info, Kind, Mount, Snapshot};

/// A parent layer as seen by the planner: its id and the labels of its
/// committed record (for blob path lookup), newest first.
#[derive(Debug, Clone)]
pub(crate) struct Layer {
    pub(crate) id: String,
    pub(crate) labels: HashMap<String, String>,
}

/// True when the snapshot was created for layer extraction. Determined by
/// the label stored with the record, which was set in the same transaction
/// that created it; there is no window in which the two disagree.
pub(crate) fn is_extract_snapshot(info: &Info) -> bool {
    info.labels.get(LABEL_EXTRACT).map(String::as_str) == Some(LABEL_VALUE_TRUE)
}

fn erofs_mount(blob: &Path) -> Mount {
    Mount::new(
        "erofs",
        blob.display().to_string(),
        vec!["ro".to_string(), "loop".to_string()],
    )
}

/// The writable-layer mount for an active snapshot in block mode. An image
/// already formatted during prepare mounts as plain ext4; otherwise the
/// lazy `mkfs/ext4` form asks the runtime's mount transformer to create it
/// on demand. The concrete form wins whenever both are viable.
fn writable_mount(layout: &Layout, config: &SnapshotterConfig, id: &str, rw_flag: &str) -> Mount {
    let path = layout.writable_path(id);
    if path.exists() {
        return Mount::new(
            "ext4",
            path.display().to_string(),
            vec![rw_flag.to_string(), "loop".to_string()],
        );
    }
    Mount::new(
        "mkfs/ext4",
        path.display().to_string(),
        vec![
            "X-containerd.mkfs.fs=ext4".to_string(),
            format!("X-containerd.mkfs.size={}", config.default_writable_size),
            rw_flag.to_string(),
            "loop".to_string(),
        ],
    )
}

/// The diff mount handed to the differ: a plain bind to the upper
/// directory, nothing else.
pub(crate) fn diff_mounts(layout: &Layout, id: &str) -> Vec<Mount> {
    vec![Mount::new(
        "bind",
        layout.upper_path(id).display().to_string(),
        vec!["rw".to_string(), "rbind".to_string()],
    )]
}

fn exists_nonzero(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Tries to collapse the whole parent chain into a single mount of the
/// merged metadata image at the newest parent, with one `device=` option
/// per layer blob, newest to oldest. Falls back to `None` unless the image
/// and every referenced blob are usable. The `fsmeta-ready` label lets the
/// planner skip the per-blob existence probes.
fn fsmeta_mount(layout: &Layout, parents: &[Layer]) -> Option<Mount> {
    let newest = &parents[0];
    let meta = layout.fsmeta_path(&newest.id);
    if !exists_nonzero(&meta) {
        return None;
    }
    let ready = newest.labels.get(LABEL_FSMETA_READY).map(String::as_str)
        == Some(LABEL_VALUE_TRUE);

    let mut options = vec!["ro".to_string(), "loop".to_string()];
    for parent in parents {
        let blob = layout.layer_blob_path(&parent.id);
        if !ready && !exists_nonzero(&blob) {
            return None;
        }
        options.push(format!("device={}", blob.display()));
    }
    Some(Mount::new("erofs", meta.display().to_string(), options))
}

/// Collects the read-only lower mounts for a parent chain, newest first.
/// With a merge threshold configured and exceeded, a single fsmeta mount
/// replaces the per-layer stack when available.
pub(crate) fn collect_lower_mounts(
    layout: &Layout,
    config: &SnapshotterConfig,
    parents: &[Layer],
) -> Result<Vec<Mount>> {
    if config.fs_merge_threshold > 0 && parents.len() as u32 > config.fs_merge_threshold {
        if let Some(mount) = fsmeta_mount(layout, parents) {
            return Ok(vec![mount]);
        }
    }
    parents
        .iter()
        .map(|parent| {
            let blob = layout.find_layer_blob(&parent.id, Some(&parent.labels))?;
            Ok(erofs_mount(&blob))
        })
        .collect()
}

fn single_layer_mounts(
    layout: &Layout,
    config: &SnapshotterConfig,
    snap: &Snapshot,
    info: &Info,
) -> Result<Vec<Mount>> {
    if snap.kind == Kind::Committed {
        let blob = layout.find_layer_blob(&snap.id, Some(&info.labels))?;
        if config.enable_fsverity {
            fsverity::verify_enabled(&blob)?;
        }
        return Ok(vec![erofs_mount(&blob)]);
    }

    let rw_flag = if snap.kind == Kind::View { "ro" } else { "rw" };

    if snap.kind == Kind::Active && config.block_mode() {
        return Ok(vec![
            writable_mount(layout, config, &snap.id, rw_flag),
            Mount::new(
                "format/mkdir/bind",
                "{{ mount 0 }}/upper",
                vec![
                    "X-containerd.mkdir.path={{ mount 0 }}/upper:0755".to_string(),
                    rw_flag.to_string(),
                    "rbind".to_string(),
                ],
            ),
        ]);
    }

    Ok(vec![Mount::new(
        "bind",
        layout.upper_path(&snap.id).display().to_string(),
        vec![rw_flag.to_string(), "rbind".to_string()],
    )])
}

/// Composes the mount stack for a snapshot.
///
/// `parents` is the resolved parent chain, newest first; overlay lower
/// ordering follows it, so the newest layer ends up leftmost in `lowerdir`.
pub(crate) fn plan_mounts(
    layout: &Layout,
    config: &SnapshotterConfig,
    snap: &Snapshot,
    info: &Info,
    parents: &[Layer],
) -> Result<Vec<Mount>> {
    if snap.kind == Kind::Active && is_extract_snapshot(info) {
        return Ok(diff_mounts(layout, &snap.id));
    }
    if parents.is_empty() {
        return single_layer_mounts(layout, config, snap, info);
    }

    let mut mounts = Vec::new();
    let mut options = Vec::new();

    if snap.kind == Kind::Active {
        if config.block_mode() {
            mounts.push(writable_mount(layout, config, &snap.id, "rw"));
            options.push("X-containerd.mkdir.path={{ mount 0 }}/upper:0755".to_string());
            options.push("X-containerd.mkdir.path={{ mount 0 }}/work:0755".to_string());
            options.push("workdir={{ mount 0 }}/work".to_string());
            options.push("upperdir={{ mount 0 }}/upper".to_string());
        } else {
            options.push(format!("workdir={}", layout.work_path(&snap.id).display()));
            options.push(format!("upperdir={}", layout.upper_path(&snap.id).display()));
        }
    } else if parents.len() == 1 {
        // A read-only snapshot over one committed layer needs no overlay at
        // all; the EROFS image itself is the view.
        let blob = layout.find_layer_blob(&parents[0].id, Some(&parents[0].labels))?;
        return Ok(vec![erofs_mount(&blob)]);
    }

    let first = mounts.len();
    mounts.extend(collect_lower_mounts(layout, config, parents)?);
    let last = mounts.len() - 1;

    if first == last {
        if snap.kind != Kind::Active {
            // A single collapsed lower is already the full read-only view.
            return Ok(mounts);
        }
        options.push(format!("lowerdir={{{{ mount {first} }}}}"));
    } else {
        options.push(format!("lowerdir={{{{ overlay {first} {last} }}}}"));
    }
    if snap.kind != Kind::Active {
        options.push("ro".to_string());
    }
    options.extend(config.ovl_options.iter().cloned());

    let overlay_type = if snap.kind == Kind::Active && config.block_mode() {
        "format/mkdir/overlay"
    } else {
        "overlay"
    };
    mounts.push(Mount::new(overlay_type, "overlay", options));
    Ok(mounts)
}
