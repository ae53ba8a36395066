//! Helpers for a cooperating differ.
//!
//! A differ is handed a diff mount (a bind to an extract snapshot's upper
//! directory) and, if it produces EROFS layers itself, writes the blob
//! straight into the snapshot directory. Before doing so it must confirm
//! the mount really is a managed layer root; on anything else it reports
//! `NotImplemented`, which tells the runtime to fall back to another
//! differ.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::paths::EROFS_LAYER_MARKER;
use crate::snapshot::Mount;

/// Resolves a diff-mount list to the snapshot directory the differ may
/// write its layer blob into.
///
/// Accepts exactly one bind mount whose target carries the layer marker
/// (at the upper directory or the snapshot root above it). Everything else
/// is [`Error::NotImplemented`] so the runtime can retry with a differ
/// that walks the mounts instead.
pub fn mounts_to_layer(mounts: &[Mount]) -> Result<PathBuf> {
    if mounts.len() != 1 || mounts[0].fs_type != "bind" {
        return Err(Error::NotImplemented(
            "expected a single bind mount".into(),
        ));
    }

    let upper = PathBuf::from(&mounts[0].source);
    let layer_root = upper
        .parent()
        .ok_or_else(|| Error::NotImplemented("bind source has no parent directory".into()))?;

    if !layer_root.join(EROFS_LAYER_MARKER).exists()
        && !upper.join(EROFS_LAYER_MARKER).exists()
    {
        return Err(Error::NotImplemented(format!(
            "{} is not a managed layer root",
            upper.display()
        )));
    }

    Ok(layer_root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ensure_marker_file;

    fn bind(source: &std::path::Path) -> Mount {
        Mount::new(
            "bind",
            source.display().to_string(),
            vec!["rw".to_string(), "rbind".to_string()],
        )
    }

    #[test]
    fn resolves_a_marked_layer_root() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("fs");
        std::fs::create_dir(&upper).unwrap();
        ensure_marker_file(&dir.path().join(EROFS_LAYER_MARKER)).unwrap();

        let root = mounts_to_layer(&[bind(&upper)]).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn accepts_a_marker_inside_the_upper_directory() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("fs");
        std::fs::create_dir(&upper).unwrap();
        ensure_marker_file(&upper.join(EROFS_LAYER_MARKER)).unwrap();

        mounts_to_layer(&[bind(&upper)]).unwrap();
    }

    #[test]
    fn unmarked_directories_are_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("fs");
        std::fs::create_dir(&upper).unwrap();

        let err = mounts_to_layer(&[bind(&upper)]).unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn non_bind_mounts_are_not_implemented() {
        let err = mounts_to_layer(&[Mount::new(
            "overlay",
            "overlay",
            vec!["lowerdir=/x".to_string()],
        )])
        .unwrap_err();
        assert!(err.is_not_implemented());

        let err = mounts_to_layer(&[]).unwrap_err();
        assert!(err.is_not_implemented());
    }
}
