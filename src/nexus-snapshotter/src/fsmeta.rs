//! Opportunistic aggregation of layer metadata.
//!
//! Long parent chains cost one loop mount per layer. After a commit pushes
//! a chain past the configured threshold, the chain's metadata is merged
//! into a single EROFS image that references the layer blobs as external
//! devices, letting the planner collapse the lower stack into one mount.
//!
//! Aggregation is best-effort: any failure degrades to per-layer mounts.
//! Concurrent commits over the same chain race to create the placeholder;
//! exclusive create picks exactly one winner and the losers return quietly.

use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::time::Instant;

use crate::error::Result;
use crate::labels::{
    encode_layer_order, is_valid_digest, LABEL_FSMETA_LAYERS, LABEL_FSMETA_READY,
    LABEL_LAYER_DIGEST, LABEL_LAYER_ORDER, LABEL_MOUNT_TYPE, LABEL_VALUE_TRUE,
    MOUNT_TYPE_FORMAT_EROFS,
};
use crate::paths::Layout;
use crate::store::{MetaStore, SnapshotReader};

/// Merges the metadata of `chain_ids` (newest first, starting with the
/// just-committed snapshot) into an fsmeta image at the newest snapshot's
/// directory, then records the result in that snapshot's labels.
pub(crate) async fn generate(
    layout: &Layout,
    store: &MetaStore,
    name: &str,
    chain_ids: &[String],
) -> Result<()> {
    let newest = &chain_ids[0];
    let fsmeta = layout.fsmeta_path(newest);

    // The placeholder claims the aggregation. Losing the race (or finding a
    // finished image) is not an error.
    match OpenOptions::new().create_new(true).write(true).open(&fsmeta) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            debug!("fsmeta for {newest} already claimed, skipping");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    let started = Instant::now();

    let mut blobs = Vec::with_capacity(chain_ids.len());
    for id in chain_ids {
        let blob = layout.layer_blob_path(id);
        let usable = std::fs::metadata(&blob).map(|m| m.len() > 0).unwrap_or(false);
        if !usable {
            warn!(
                "fsmeta for {newest} aborted: layer blob {} is missing",
                blob.display()
            );
            let _ = std::fs::remove_file(&fsmeta);
            return Ok(());
        }
        blobs.push(blob);
    }

    let tmp = fsmeta.with_extension("erofs.tmp");
    let blob_refs: Vec<&std::path::Path> = blobs.iter().map(|b| b.as_path()).collect();
    if let Err(err) = erofs_common::merge_blobs_to_erofs(&tmp, &blob_refs).await {
        warn!("failed to generate fsmeta for {newest}: {err:#}");
        let _ = std::fs::remove_file(&fsmeta);
        return Ok(());
    }

    // Replace the placeholder atomically so readers only ever see a
    // zero-size claim or a complete image.
    std::fs::rename(&tmp, &fsmeta)?;

    let digests = store.with_read(|tx| {
        let ids = tx.id_map()?;
        // Oldest first for external consumers.
        let mut digests = Vec::new();
        for id in chain_ids.iter().rev() {
            let Some(key) = ids.get(id) else { continue };
            let (info, _) = tx.get_info(key)?;
            if let Some(digest) = info.labels.get(LABEL_LAYER_DIGEST) {
                if is_valid_digest(digest) {
                    digests.push(digest.clone());
                }
            }
        }
        Ok(digests)
    })?;

    store.with_write(|tx| {
        let (mut info, _) = tx.get_info(name)?;
        info.labels
            .insert(LABEL_FSMETA_READY.into(), LABEL_VALUE_TRUE.into());
        info.labels
            .insert(LABEL_FSMETA_LAYERS.into(), chain_ids.len().to_string());
        info.labels
            .insert(LABEL_LAYER_ORDER.into(), encode_layer_order(&digests));
        info.labels
            .insert(LABEL_MOUNT_TYPE.into(), MOUNT_TYPE_FORMAT_EROFS.into());
        tx.update_info(
            &info,
            &[
                format!("labels.{LABEL_FSMETA_READY}"),
                format!("labels.{LABEL_FSMETA_LAYERS}"),
                format!("labels.{LABEL_LAYER_ORDER}"),
                format!("labels.{LABEL_MOUNT_TYPE}"),
            ],
        )?;
        Ok(())
    })?;

    info!(
        "merged fsmeta for {newest} ({} layers) generated in {:?}",
        chain_ids.len(),
        started.elapsed()
    );
    Ok(())
}
