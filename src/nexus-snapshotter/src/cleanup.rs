//! Unmount and directory cleanup discipline.
//!
//! Cleanup is exhaustive, not fail-fast: every target is attempted even
//! when an earlier one fails, and the last error is reported. Detached
//! (lazy) unmount exists only as an escape hatch for busy mounts; every use
//! is logged and the original error still propagates so the operator sees
//! the leak.

use log::warn;
use nix::mount::{umount2, MntFlags};
use std::path::Path;

use crate::error::{Error, Result};
use crate::mountinfo;
use crate::paths::Layout;

fn errno_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

/// Unmounts every mount stacked on `target`, if any.
fn unmount_stack(target: &Path, flags: MntFlags) -> Result<()> {
    loop {
        if !mountinfo::is_mountpoint(target)? {
            return Ok(());
        }
        match umount2(target, flags) {
            Ok(()) => {}
            // Not mounted (anymore): raced with someone else, done.
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => return Ok(()),
            Err(errno) => return Err(Error::Io(errno_to_io(errno))),
        }
    }
}

/// Unmounts `target`, falling back to a detached unmount when the normal
/// path fails (typically EBUSY). If the fallback succeeds the mount is at
/// least detached, but the original error is still returned so callers can
/// surface the leak.
pub(crate) fn unmount_all(target: &Path) -> Result<()> {
    match unmount_stack(target, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(err) => {
            if unmount_stack(target, MntFlags::MNT_DETACH).is_err() {
                return Err(err);
            }
            warn!(
                "unmount of {} required MNT_DETACH fallback, mount may linger: {err}",
                target.display()
            );
            Err(err)
        }
    }
}

/// Unmounts the directory-mode upper directory of a snapshot.
pub(crate) fn cleanup_upper(layout: &Layout, id: &str) -> Result<()> {
    unmount_all(&layout.upper_path(id))
}

/// Unmounts the block-mode mount stack of a snapshot: the merged overlay,
/// every lower layer, and the writable ext4 mount, in that order. All
/// targets are attempted; the last error wins.
pub(crate) fn cleanup_active_mounts(layout: &Layout, id: &str) -> Result<()> {
    let mut last_err = None;

    let merged = layout.merged_path(id);
    if let Err(err) = unmount_all(&merged) {
        warn!("failed to unmount merged directory {}: {err}", merged.display());
        last_err = Some(err);
    }

    if let Ok(entries) = std::fs::read_dir(layout.lower_root(id)) {
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let target = entry.path();
            if let Err(err) = unmount_all(&target) {
                warn!("failed to unmount lower directory {}: {err}", target.display());
                last_err = Some(err);
            }
        }
    }

    let rw = layout.rw_path(id);
    if let Err(err) = unmount_all(&rw) {
        warn!("failed to unmount rw directory {}: {err}", rw.display());
        last_err = Some(err);
    }

    match last_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
