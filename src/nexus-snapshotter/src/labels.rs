//! Label keys for snapshot metadata.
//!
//! Labels are stored in the snapshot records and survive restarts. They are
//! updated atomically within store transactions, which makes them preferable
//! to filesystem markers for anything that gates behavior: there is no
//! window between checking and acting on them.

/// Namespace for every label owned by this snapshotter. The runtime and
/// external tools must not write keys under this prefix.
pub const LABEL_PREFIX: &str = "nexus-erofs-snapshotter/";

/// Standard value for boolean labels set to true.
pub const LABEL_VALUE_TRUE: &str = "true";

/// Marks a snapshot created for layer extraction by the differ. Mount
/// planning returns a diff mount (bind to the upper directory) instead of
/// the normal stack. Set during prepare, in the same transaction that
/// creates the record.
pub const LABEL_EXTRACT: &str = "nexus-erofs-snapshotter/extract";

/// OCI digest of the committed layer, when the differ propagated one. The
/// core never synthesizes a digest from the blob.
pub const LABEL_LAYER_DIGEST: &str = "nexus-erofs-snapshotter/layer-digest";

/// Absolute path of the committed EROFS layer blob. Avoids directory scans
/// when composing lower mounts. Set during commit.
pub const LABEL_LAYER_BLOB_PATH: &str = "nexus-erofs-snapshotter/layer-blob-path";

/// Set when fsmeta aggregation completed for this snapshot's chain.
pub const LABEL_FSMETA_READY: &str = "nexus-erofs-snapshotter/fsmeta-ready";

/// Number of layers merged into the fsmeta, as a decimal string.
pub const LABEL_FSMETA_LAYERS: &str = "nexus-erofs-snapshotter/fsmeta-layers";

/// JSON array of layer digests, oldest first. Consumed by external tools
/// that need the chain order without walking the store.
pub const LABEL_LAYER_ORDER: &str = "nexus-erofs-snapshotter/layer-order";

/// Hint at the mount type the planner will emit for this snapshot.
pub const LABEL_MOUNT_TYPE: &str = "nexus-erofs-snapshotter/mount-type";

/// Size in bytes of the ext4 writable layer, informational.
pub const LABEL_WRITABLE_SIZE: &str = "nexus-erofs-snapshotter/writable-size";

/// Last conversion failure message, truncated, for debugging failed commits
/// without searching logs.
pub const LABEL_CONVERSION_ERROR: &str = "nexus-erofs-snapshotter/conversion-error";

/// Records that the layer blob carries the IMMUTABLE file attribute, so
/// removal knows to clear it first.
pub const LABEL_IMMUTABLE: &str = "nexus-erofs-snapshotter/immutable";

/// Mount type strings used for `LABEL_MOUNT_TYPE` values.
pub const MOUNT_TYPE_FORMAT_EROFS: &str = "format/erofs";
pub const MOUNT_TYPE_EROFS: &str = "erofs";
pub const MOUNT_TYPE_EXT4: &str = "ext4";
pub const MOUNT_TYPE_BIND: &str = "bind";

/// Returns true for a well-formed `<algorithm>:<hex>` content digest with a
/// known algorithm and matching hex length.
pub fn is_valid_digest(s: &str) -> bool {
    let Some((algorithm, hex)) = s.split_once(':') else {
        return false;
    };
    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        _ => return false,
    };
    hex.len() == expected_len && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Encodes layer digests (oldest first) as the JSON payload of
/// `LABEL_LAYER_ORDER`.
pub fn encode_layer_order(digests: &[String]) -> String {
    if digests.is_empty() {
        return "[]".to_string();
    }
    serde_json::to_string(digests).unwrap_or_else(|_| "[]".to_string())
}

/// Decodes a `LABEL_LAYER_ORDER` payload. Empty or invalid input decodes to
/// an empty list; individually invalid digests are skipped.
pub fn decode_layer_order(encoded: &str) -> Vec<String> {
    if encoded.is_empty() || encoded == "[]" {
        return Vec::new();
    }
    let Ok(strings) = serde_json::from_str::<Vec<String>>(encoded) else {
        return Vec::new();
    };
    strings.into_iter().filter(|s| is_valid_digest(s)).collect()
}
