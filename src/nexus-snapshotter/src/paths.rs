//! On-disk layout of the snapshotter root.
//!
//! ```text
//! <root>/metadata.db              metadata store
//! <root>/snapshots/<id>/fs        overlay upperdir (placeholder in block mode)
//! <root>/snapshots/<id>/work      overlay workdir (directory mode)
//! <root>/snapshots/<id>/rwlayer.img   ext4 writable layer (block mode)
//! <root>/snapshots/<id>/rw        mountpoint of rwlayer.img (transient)
//! <root>/snapshots/<id>/merged    overlay mountpoint (transient)
//! <root>/snapshots/<id>/lower/<i> per-layer loop mountpoints (transient)
//! <root>/snapshots/<id>/layer.erofs   committed layer blob
//! <root>/snapshots/<id>/fsmeta.erofs  merged metadata image (optional)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::labels::LABEL_LAYER_BLOB_PATH;

pub(crate) const SNAPSHOTS_DIR_NAME: &str = "snapshots";
pub(crate) const METADATA_DB_NAME: &str = "metadata.db";
pub(crate) const FS_DIR_NAME: &str = "fs";
pub(crate) const WORK_DIR_NAME: &str = "work";
pub(crate) const RW_LAYER_FILENAME: &str = "rwlayer.img";
pub(crate) const RW_DIR_NAME: &str = "rw";
pub(crate) const UPPER_DIR_NAME: &str = "upper";
pub(crate) const LOWER_DIR_NAME: &str = "lower";
pub(crate) const MERGED_DIR_NAME: &str = "merged";
pub(crate) const LAYER_BLOB_FILENAME: &str = "layer.erofs";
pub(crate) const FSMETA_FILENAME: &str = "fsmeta.erofs";

/// Marker file identifying a directory as managed by this snapshotter. The
/// differ checks for it before treating a bind mount as a layer root and
/// falls back to another differ when it is missing.
pub(crate) const EROFS_LAYER_MARKER: &str = ".erofslayer";

/// Creates the layer marker file at `path` if it does not already exist.
///
/// Exclusive create makes this atomic and idempotent: concurrent callers
/// all succeed, and there is no window between checking and creating.
pub(crate) fn ensure_marker_file(path: &Path) -> std::io::Result<()> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn metadata_db(&self) -> PathBuf {
        self.root.join(METADATA_DB_NAME)
    }

    pub(crate) fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR_NAME)
    }

    pub(crate) fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(id)
    }

    /// Overlay upper directory for directory mode; placeholder in block mode.
    pub(crate) fn upper_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(FS_DIR_NAME)
    }

    /// Overlay work directory, directory mode only.
    pub(crate) fn work_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(WORK_DIR_NAME)
    }

    /// ext4 writable layer image, block mode only.
    pub(crate) fn writable_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(RW_LAYER_FILENAME)
    }

    /// Mountpoint of the writable layer image.
    pub(crate) fn rw_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(RW_DIR_NAME)
    }

    /// Overlay upperdir inside the mounted ext4 image.
    pub(crate) fn block_upper_path(&self, id: &str) -> PathBuf {
        self.rw_path(id).join(UPPER_DIR_NAME)
    }

    /// Overlay workdir inside the mounted ext4 image.
    pub(crate) fn block_work_path(&self, id: &str) -> PathBuf {
        self.rw_path(id).join(WORK_DIR_NAME)
    }

    pub(crate) fn merged_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(MERGED_DIR_NAME)
    }

    pub(crate) fn lower_root(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(LOWER_DIR_NAME)
    }

    pub(crate) fn lower_target(&self, id: &str, index: usize) -> PathBuf {
        self.lower_root(id).join(index.to_string())
    }

    /// Conventional path of the committed layer blob.
    pub(crate) fn layer_blob_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(LAYER_BLOB_FILENAME)
    }

    pub(crate) fn fsmeta_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(FSMETA_FILENAME)
    }

    /// The directory commit converts to EROFS: `rw/upper` when a writable
    /// layer image exists (falling back to `rw/` before the first mount
    /// created `upper/`), the plain upper directory otherwise.
    pub(crate) fn commit_upper_dir(&self, id: &str) -> PathBuf {
        if self.writable_path(id).exists() {
            let upper = self.block_upper_path(id);
            if upper.exists() {
                return upper;
            }
            return self.rw_path(id);
        }
        self.upper_path(id)
    }

    /// Locates the EROFS layer blob for a snapshot.
    ///
    /// The `layer-blob-path` label is the fast path. Without it, the
    /// snapshot directory is scanned for `*.erofs` files (excluding the
    /// fsmeta image) to support differs that write blobs without setting
    /// labels.
    pub(crate) fn find_layer_blob(
        &self,
        id: &str,
        labels: Option<&HashMap<String, String>>,
    ) -> Result<PathBuf> {
        let dir = self.snapshot_dir(id);
        let mut searched = Vec::new();

        if let Some(blob_path) = labels.and_then(|l| l.get(LABEL_LAYER_BLOB_PATH)) {
            let path = PathBuf::from(blob_path);
            if path.exists() {
                return Ok(path);
            }
            searched.push(format!("{blob_path} (from label, file missing)"));
        }

        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name == FSMETA_FILENAME || !name.ends_with(".erofs") {
                    continue;
                }
                return Ok(entry.path());
            }
        }
        searched.push(format!("{}/*.erofs (scan found nothing)", dir.display()));

        Err(Error::LayerBlobNotFound {
            snapshot_id: id.to_string(),
            dir,
            searched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn marker_file_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(EROFS_LAYER_MARKER);
        ensure_marker_file(&marker).unwrap();
        ensure_marker_file(&marker).unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn paths_follow_the_layout() {
        let layout = Layout::new("/var/lib/test");
        assert_eq!(
            layout.upper_path("42"),
            PathBuf::from("/var/lib/test/snapshots/42/fs")
        );
        assert_eq!(
            layout.writable_path("42"),
            PathBuf::from("/var/lib/test/snapshots/42/rwlayer.img")
        );
        assert_eq!(
            layout.block_upper_path("42"),
            PathBuf::from("/var/lib/test/snapshots/42/rw/upper")
        );
        assert_eq!(
            layout.lower_target("42", 2),
            PathBuf::from("/var/lib/test/snapshots/42/lower/2")
        );
    }

    #[test]
    fn commit_upper_dir_selection() {
        let root = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path());

        // No rwlayer.img: directory-mode upper.
        fs::create_dir_all(layout.upper_path("1")).unwrap();
        assert_eq!(layout.commit_upper_dir("1"), layout.upper_path("1"));

        // rwlayer.img with a mounted upper: block-mode upper.
        fs::create_dir_all(layout.block_upper_path("2")).unwrap();
        fs::write(layout.writable_path("2"), b"fake ext4").unwrap();
        assert_eq!(layout.commit_upper_dir("2"), layout.block_upper_path("2"));

        // rwlayer.img without upper yet: the mount root.
        fs::create_dir_all(layout.rw_path("3")).unwrap();
        fs::write(layout.writable_path("3"), b"fake ext4").unwrap();
        assert_eq!(layout.commit_upper_dir("3"), layout.rw_path("3"));
    }

    #[test]
    fn find_layer_blob_prefers_the_label() {
        let root = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path());
        let dir = layout.snapshot_dir("9");
        fs::create_dir_all(&dir).unwrap();
        let blob = dir.join("sha256-abc123.erofs");
        fs::write(&blob, b"fake erofs").unwrap();

        let mut labels = HashMap::new();
        labels.insert(
            LABEL_LAYER_BLOB_PATH.to_string(),
            blob.display().to_string(),
        );
        assert_eq!(layout.find_layer_blob("9", Some(&labels)).unwrap(), blob);
    }

    #[test]
    fn find_layer_blob_falls_back_to_scanning() {
        let root = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path());
        let dir = layout.snapshot_dir("9");
        fs::create_dir_all(&dir).unwrap();
        let blob = dir.join("sha256-abc123.erofs");
        fs::write(&blob, b"fake erofs").unwrap();
        // The fsmeta image must never be picked up as a layer blob.
        fs::write(dir.join(FSMETA_FILENAME), b"fake fsmeta").unwrap();

        assert_eq!(layout.find_layer_blob("9", None).unwrap(), blob);
    }

    #[test]
    fn find_layer_blob_reports_searched_locations() {
        let root = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path());
        fs::create_dir_all(layout.snapshot_dir("9")).unwrap();

        let mut labels = HashMap::new();
        labels.insert(
            LABEL_LAYER_BLOB_PATH.to_string(),
            "/nonexistent/path.erofs".to_string(),
        );
        let err = layout.find_layer_blob("9", Some(&labels)).unwrap_err();
        match err {
            Error::LayerBlobNotFound { searched, .. } => {
                assert_eq!(searched.len(), 2);
                assert!(searched[0].contains("from label"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
