//! The snapshot lifecycle engine.
//!
//! Ties the metadata store, the mount planner, the block executor, and the
//! layer materializer together behind the operation surface the runtime
//! calls. Coordination relies on store transactions and filesystem
//! atomicity (exclusive creates, renames) rather than an in-process lock:
//! concurrent operations from a parallel image pull serialize only where
//! the store itself serializes them.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::block;
use crate::cleanup::{cleanup_active_mounts, cleanup_upper};
use crate::config::SnapshotterConfig;
use crate::error::{Error, Result};
use crate::fsmeta;
use crate::fsverity;
use crate::labels::{
    LABEL_CONVERSION_ERROR, LABEL_EXTRACT, LABEL_IMMUTABLE, LABEL_LAYER_BLOB_PATH, LABEL_PREFIX,
    LABEL_VALUE_TRUE, LABEL_WRITABLE_SIZE,
};
use crate::mount::apply_mount;
use crate::mountinfo;
use crate::paths::{ensure_marker_file, Layout, EROFS_LAYER_MARKER};
use crate::planner::{self, Layer};
use crate::preflight;
use crate::snapshot::{Info, Kind, Mount, Snapshot, Usage, WalkFilter};
use crate::store::{MetaStore, SnapshotReader};
use crate::sys;
use crate::tracker::MountTracker;
use crate::usage::disk_usage;

/// Key prefix (of the final path segment) the runtime uses for unpack
/// snapshots, e.g. `default/7/extract-123456`.
const EXTRACT_KEY_PREFIX: &str = "extract";

/// Returns true if the key indicates an extract/unpack operation. Keys use
/// forward slashes as separators, so only the final segment is inspected.
fn is_extract_key(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .unwrap_or(key)
        .starts_with(EXTRACT_KEY_PREFIX)
}

fn set_dir_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// An EROFS + overlayfs snapshotter rooted at a single directory.
pub struct Snapshotter {
    layout: Layout,
    store: MetaStore,
    config: SnapshotterConfig,
    tracker: MountTracker,
}

impl Snapshotter {
    /// Opens (or initializes) a snapshotter under `root`.
    ///
    /// Runs the startup probes: in directory mode the backing filesystem
    /// must support d_type and the kernel must register `erofs` (reported
    /// as [`Error::SkipPlugin`] so the host can disable the plugin);
    /// fsverity support is probed once here when requested.
    pub fn new(root: impl AsRef<Path>, config: SnapshotterConfig) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        set_dir_mode(root, 0o700)?;

        if !config.block_mode() {
            preflight::check_compatibility(root)?;
        }

        if config.enable_fsverity && !fsverity::is_supported(root)? {
            return Err(Error::FailedPrecondition(format!(
                "fsverity is not supported on the filesystem of {}",
                root.display()
            )));
        }

        if config.set_immutable && cfg!(not(target_os = "linux")) {
            return Err(Error::FailedPrecondition(
                "setting the IMMUTABLE attribute is only supported on Linux".into(),
            ));
        }

        let layout = Layout::new(root);
        let store = MetaStore::open(&layout.metadata_db())?;
        let snapshots = layout.snapshots_dir();
        fs::create_dir_all(&snapshots)?;
        set_dir_mode(&snapshots, 0o700)?;

        Ok(Self {
            layout,
            store,
            config,
            tracker: MountTracker::new(),
        })
    }

    /// Creates a writable active snapshot and returns its mounts.
    pub async fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        info!("prepare({key}, {parent})");
        self.create_snapshot(Kind::Active, key, parent, labels).await
    }

    /// Creates a read-only view over a committed parent chain.
    pub async fn view(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        info!("view({key}, {parent})");
        self.create_snapshot(Kind::View, key, parent, labels).await
    }

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: &str,
        mut labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot key is empty".into()));
        }

        let extract = is_extract_key(key);
        if extract {
            // Recorded in the same transaction that creates the snapshot,
            // so mount planning never races against a half-created record.
            labels.insert(LABEL_EXTRACT.into(), LABEL_VALUE_TRUE.into());
        }
        if kind == Kind::Active && self.config.block_mode() && !extract {
            labels.insert(
                LABEL_WRITABLE_SIZE.into(),
                self.config.default_writable_size.to_string(),
            );
        }

        // Stage under a temporary name; the directory becomes visible at
        // its final path only via the rename inside the transaction below.
        // If we crash in between, the staging dir has no record and the
        // next cleanup sweeps it.
        let staging = tempfile::Builder::new()
            .prefix("new-")
            .tempdir_in(self.layout.snapshots_dir())?;
        self.populate_staging_dir(staging.path(), kind)?;

        let (snap, info) = self.store.with_write(|tx| {
            let snap = tx.create_snapshot(kind, key, parent, labels.clone())?;
            let (info, _) = tx.get_info(key)?;

            if let Some(parent_id) = snap.parent_ids.first() {
                // Propagate the parent upperdir's ownership so the overlay
                // does not cross ownership boundaries for non-root images.
                sys::chown_like(
                    &staging.path().join("fs"),
                    &self.layout.upper_path(parent_id),
                )?;
            }

            fs::rename(staging.path(), self.layout.snapshot_dir(&snap.id))?;
            Ok((snap, info))
        })?;
        // The staging guard's drop is now a no-op: the directory moved to
        // its final path under the committed record.

        if kind == Kind::Active && self.config.block_mode() && !extract {
            if let Err(err) = self.create_writable_layer(&snap.id).await {
                self.rollback_created(key, &snap.id);
                return Err(err);
            }
        }

        match self.mounts_for(&snap, &info) {
            Ok(mounts) => Ok(mounts),
            Err(err) => {
                self.rollback_created(key, &snap.id);
                Err(err)
            }
        }
    }

    fn populate_staging_dir(&self, staging: &Path, kind: Kind) -> Result<()> {
        let upper = staging.join("fs");
        fs::create_dir(&upper)?;
        set_dir_mode(&upper, 0o755)?;

        if kind == Kind::Active {
            if !self.config.block_mode() {
                let work = staging.join("work");
                fs::create_dir(&work)?;
                set_dir_mode(&work, 0o711)?;
            }
            ensure_marker_file(&staging.join(EROFS_LAYER_MARKER))?;
        }
        Ok(())
    }

    /// Undoes a snapshot whose record was committed but whose remaining
    /// setup failed, so a failed prepare leaves neither a record nor a
    /// directory behind.
    fn rollback_created(&self, key: &str, id: &str) {
        if let Err(err) = self.store.with_write(|tx| tx.remove(key).map(|_| ())) {
            warn!("failed to roll back snapshot record {key}: {err}");
        }
        let _ = self.cleanup_snapshot_mounts(id);
        if let Err(err) = fs::remove_dir_all(self.layout.snapshot_dir(id)) {
            warn!("failed to remove snapshot directory for {id}: {err}");
        }
    }

    /// Eagerly creates and formats the ext4 writable layer during prepare.
    /// The deferred-initialization options cut mkfs time on large sparse
    /// files; the upper/work directories appear when the image is mounted.
    async fn create_writable_layer(&self, id: &str) -> Result<()> {
        let path = self.layout.writable_path(id);
        let size = self.config.default_writable_size;

        let file = fs::File::create(&path)?;
        if let Err(err) = file.set_len(size) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }
        drop(file);

        let output = tokio::process::Command::new("mkfs.ext4")
            .args([
                "-q",
                "-F",
                "-L",
                "rwlayer",
                "-E",
                "nodiscard,lazy_itable_init=1,lazy_journal_init=1",
            ])
            .arg(&path)
            .kill_on_drop(true)
            .output()
            .await;

        let failed = |detail: String| {
            let _ = fs::remove_file(&path);
            Err(Error::Io(std::io::Error::other(format!(
                "failed to format ext4 writable layer: {detail}"
            ))))
        };

        match output {
            Ok(out) if out.status.success() => {
                debug!("created writable layer {} ({size} bytes)", path.display());
                Ok(())
            }
            Ok(out) => {
                let mut combined = out.stdout;
                combined.extend_from_slice(&out.stderr);
                failed(erofs_common::truncate_output(&combined, 256))
            }
            Err(err) => failed(err.to_string()),
        }
    }

    /// Resolves a snapshot, its info, and its parent chain (with labels for
    /// blob lookup) in one consistent read.
    fn load_view(&self, key: &str) -> Result<(Snapshot, Info, Vec<Layer>)> {
        self.store.with_read(|tx| {
            let snap = tx.get_snapshot(key)?;
            let (info, _) = tx.get_info(key)?;
            let ids = tx.id_map()?;
            let mut parents = Vec::with_capacity(snap.parent_ids.len());
            for parent_id in &snap.parent_ids {
                let parent_key = ids
                    .get(parent_id)
                    .ok_or_else(|| Error::NotFound(format!("snapshot id {parent_id}")))?;
                let (parent_info, _) = tx.get_info(parent_key)?;
                parents.push(Layer {
                    id: parent_id.clone(),
                    labels: parent_info.labels,
                });
            }
            Ok((snap, info, parents))
        })
    }

    fn mounts_for(&self, snap: &Snapshot, info: &Info) -> Result<Vec<Mount>> {
        let parents = if snap.parent_ids.is_empty() {
            Vec::new()
        } else {
            // Parent labels are needed for blob lookup; resolve them fresh.
            self.load_view(&info.name)?.2
        };

        if self.config.block_mode()
            && snap.kind == Kind::Active
            && !planner::is_extract_snapshot(info)
        {
            return block::active_mounts(&self.layout, &self.config, snap, &parents, &self.tracker);
        }
        planner::plan_mounts(&self.layout, &self.config, snap, info, &parents)
    }

    /// Returns the mounts for an existing snapshot.
    pub async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        debug!("mounts({key})");
        let (snap, info, parents) = self.load_view(key)?;

        if self.config.block_mode()
            && snap.kind == Kind::Active
            && !planner::is_extract_snapshot(&info)
        {
            return block::active_mounts(&self.layout, &self.config, &snap, &parents, &self.tracker);
        }
        planner::plan_mounts(&self.layout, &self.config, &snap, &info, &parents)
    }

    /// Commits the active snapshot at `key` as `name`.
    ///
    /// A blob already present at the conventional path (written by a
    /// cooperating differ during the pull) is used as-is; otherwise the
    /// upper directory is converted. The slow conversion runs outside any
    /// write transaction, and the final transaction re-verifies the blob
    /// before retiring the active record.
    pub async fn commit(
        &self,
        name: &str,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        info!("commit({name}, {key})");

        let snap = self.store.with_read(|tx| tx.get_snapshot(key))?;
        if snap.kind != Kind::Active {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {key} is not active"
            )));
        }
        let id = snap.id.clone();

        let blob = self.layout.layer_blob_path(&id);
        if !blob.exists() {
            if let Err(err) = self.convert_upper(&id, &blob).await {
                let message = erofs_common::truncate_output(err.to_string().as_bytes(), 256);
                let label_result = self.store.with_write(|tx| {
                    let (mut info, _) = tx.get_info(key)?;
                    info.labels.insert(LABEL_CONVERSION_ERROR.into(), message);
                    tx.update_info(&info, &[format!("labels.{LABEL_CONVERSION_ERROR}")])?;
                    Ok(())
                });
                if let Err(label_err) = label_result {
                    warn!("failed to record conversion error for {key}: {label_err}");
                }
                return Err(err);
            }
        }

        if self.config.enable_fsverity {
            fsverity::enable(&blob)?;
        }

        let mut commit_labels = labels;
        commit_labels.insert(LABEL_LAYER_BLOB_PATH.into(), blob.display().to_string());
        if self.config.set_immutable {
            match sys::set_immutable(&blob, true) {
                Ok(()) => {
                    commit_labels.insert(LABEL_IMMUTABLE.into(), LABEL_VALUE_TRUE.into());
                }
                Err(err) => {
                    warn!("failed to set IMMUTABLE attribute for {}: {err}", blob.display());
                }
            }
        }

        let usage = disk_usage(&blob)?;
        self.store.with_write(|tx| {
            if !blob.exists() {
                return Err(Error::FailedPrecondition(format!(
                    "converted erofs blob {} disappeared",
                    blob.display()
                )));
            }
            tx.commit_active(key, name, usage, commit_labels)?;
            Ok(())
        })?;

        self.tracker.set_unmounted(&id);

        if self.config.fs_merge_threshold > 0 {
            let mut chain = vec![id];
            chain.extend(snap.parent_ids.iter().cloned());
            if chain.len() as u32 > self.config.fs_merge_threshold {
                if let Err(err) = fsmeta::generate(&self.layout, &self.store, name, &chain).await {
                    warn!("fsmeta aggregation for {name} failed: {err}");
                }
            }
        }

        Ok(())
    }

    /// Converts the upper directory of snapshot `id` into an EROFS blob.
    ///
    /// In block mode the writable image is mounted read-only (skipping
    /// journal replay) if prepare did not leave it mounted; the mount stack
    /// is torn down afterwards either way. After a successful conversion
    /// the upperdir's entries are removed, keeping the directory itself for
    /// ownership propagation.
    async fn convert_upper(&self, id: &str, blob: &Path) -> Result<()> {
        let writable = self.layout.writable_path(id);
        let block_mode = writable.exists();

        if block_mode {
            let rw = self.layout.rw_path(id);
            fs::create_dir_all(&rw)?;
            if !mountinfo::is_mountpoint(&rw)? {
                let mount = Mount::new(
                    "ext4",
                    writable.display().to_string(),
                    vec!["ro".to_string(), "loop".to_string(), "noload".to_string()],
                );
                apply_mount(&mount, &rw).map_err(|cause| Error::BlockMount {
                    source: writable.clone(),
                    target: rw.clone(),
                    cause,
                })?;
                debug!("mounted writable layer at {} for conversion", rw.display());
            }
        }

        let upper = self.layout.commit_upper_dir(id);
        let result = self.convert_dir(id, blob, &upper).await;

        if block_mode {
            if let Err(err) = cleanup_active_mounts(&self.layout, id) {
                warn!("failed to clean up mounts for {id} after conversion: {err}");
            }
            self.tracker.set_unmounted(id);
        }

        result
    }

    async fn convert_dir(&self, id: &str, blob: &Path, upper: &Path) -> Result<()> {
        erofs_common::convert_dir_to_erofs(blob, upper)
            .await
            .map_err(|cause| Error::Conversion {
                snapshot_id: id.to_string(),
                upper_dir: upper.to_path_buf(),
                cause: cause.into(),
            })?;

        // Drop the converted content but keep the upperdir itself; it still
        // carries the ownership future overlays chown against.
        if let Ok(entries) = fs::read_dir(upper) {
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(err) = removed {
                    warn!("failed to remove {} after conversion: {err}", path.display());
                }
            }
        }
        Ok(())
    }

    /// Removes the snapshot at `key`. Committed snapshots with children are
    /// refused. Mount teardown and directory removal happen after the
    /// record is gone; their failures are logged, not returned, since the
    /// metadata transaction already committed.
    pub async fn remove(&self, key: &str) -> Result<()> {
        info!("remove({key})");

        let mut removals: Vec<PathBuf> = Vec::new();
        let removed_id = self.store.with_write(|tx| {
            let (id, kind) = tx.remove(key)?;

            if kind == Kind::Committed {
                // The IMMUTABLE flag would make the unlink below fail.
                match sys::clear_immutable_if_present(&self.layout.layer_blob_path(&id)) {
                    Ok(()) => {}
                    Err(err) if err.is_not_implemented() => {}
                    Err(err) => {
                        return Err(Error::FailedPrecondition(format!(
                            "failed to clear IMMUTABLE attribute: {err}"
                        )))
                    }
                }
            }

            removals = self.cleanup_directories(&tx.id_map()?)?;
            Ok(id)
        })?;

        if let Err(err) = self.cleanup_snapshot_mounts(&removed_id) {
            warn!("failed to unmount snapshot {removed_id} during removal: {err}");
        }
        self.tracker.set_unmounted(&removed_id);

        for dir in removals {
            if let Err(err) = fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove directory {}: {err}", dir.display());
                }
            }
        }

        Ok(())
    }

    fn cleanup_snapshot_mounts(&self, id: &str) -> Result<()> {
        if self.config.block_mode() {
            cleanup_active_mounts(&self.layout, id)
        } else {
            cleanup_upper(&self.layout, id)
        }
    }

    /// Directories under the snapshots root whose name no longer appears in
    /// the id map: interrupted staging renames and removed snapshots.
    fn cleanup_directories(&self, ids: &HashMap<String, String>) -> Result<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        for entry in fs::read_dir(self.layout.snapshots_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if ids.contains_key(name) {
                continue;
            }
            orphans.push(entry.path());
        }
        Ok(orphans)
    }

    /// Removes every orphaned snapshot directory: unmount the stack, clear
    /// the IMMUTABLE flag on a leftover blob, then delete the tree.
    pub async fn cleanup(&self) -> Result<()> {
        info!("cleanup()");

        let removals = self.store.with_read(|tx| {
            let ids = tx.id_map()?;
            self.cleanup_directories(&ids)
        })?;

        for dir in removals {
            if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
                if let Err(err) = self.cleanup_snapshot_mounts(name) {
                    warn!("failed to unmount orphan {}: {err}", dir.display());
                }
                self.tracker.set_unmounted(name);
            }
            if let Err(err) = sys::clear_immutable_if_present(&dir.join("layer.erofs")) {
                if !err.is_not_implemented() {
                    warn!(
                        "failed to clear IMMUTABLE attribute under {}: {err}",
                        dir.display()
                    );
                }
            }
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!("failed to remove directory {}: {err}", dir.display());
            }
        }

        Ok(())
    }

    /// Returns the metadata of the snapshot at `key`.
    pub async fn stat(&self, key: &str) -> Result<Info> {
        debug!("stat({key})");
        let (info, _) = self.store.with_read(|tx| tx.get_info(key))?;
        Ok(info)
    }

    /// Updates snapshot metadata; only labels are mutable, and labels under
    /// the reserved prefix are owned by the core: they cannot be addressed
    /// directly and survive full label replacements unchanged.
    pub async fn update(&self, info: &Info, fieldpaths: &[String]) -> Result<Info> {
        info!("update({}, {fieldpaths:?})", info.name);

        for path in fieldpaths {
            if let Some(label) = path.strip_prefix("labels.") {
                if label.starts_with(LABEL_PREFIX) {
                    return Err(Error::InvalidArgument(format!(
                        "label {label} is reserved"
                    )));
                }
            }
        }

        let replaces_labels = fieldpaths.is_empty() || fieldpaths.iter().any(|p| p == "labels");
        self.store.with_write(|tx| {
            if replaces_labels {
                let (current, _) = tx.get_info(&info.name)?;
                let mut merged = info.clone();
                merged.labels.retain(|k, _| !k.starts_with(LABEL_PREFIX));
                for (k, v) in current
                    .labels
                    .iter()
                    .filter(|(k, _)| k.starts_with(LABEL_PREFIX))
                {
                    merged.labels.insert(k.clone(), v.clone());
                }
                tx.update_info(&merged, fieldpaths)
            } else {
                tx.update_info(info, fieldpaths)
            }
        })
    }

    /// Reports resource usage: committed snapshots answer from the store,
    /// active snapshots scan their upper directory.
    pub async fn usage(&self, key: &str) -> Result<Usage> {
        debug!("usage({key})");
        let (info, usage) = self.store.with_read(|tx| tx.get_info(key))?;
        if info.kind != Kind::Active {
            return Ok(usage);
        }

        let upper = self.layout.commit_upper_dir(&info.id);
        if upper.exists() {
            disk_usage(&upper)
        } else {
            Ok(Usage::default())
        }
    }

    /// Calls `f` for every snapshot matching `filter`.
    pub async fn walk<F>(&self, filter: &WalkFilter, mut f: F) -> Result<()>
    where
        F: FnMut(&Info) -> Result<()>,
    {
        debug!("walk()");
        self.store.with_read(|tx| tx.walk(filter, &mut f))
    }
}
