/// Name of the EROFS image builder binary, resolved via PATH.
pub const MKFS_EROFS: &str = "mkfs.erofs";

/// Options passed to every mkfs.erofs invocation:
/// `--aufs` converts OCI whiteouts/opaque markers to overlayfs metadata,
/// `--ovlfs-strip=1` strips the overlayfs xattr namespace from copied-up
/// entries, `--quiet` reduces output verbosity.
pub const MKFS_EROFS_BASE_ARGS: [&str; 3] = ["--aufs", "--ovlfs-strip=1", "--quiet"];

/// Maximum number of bytes of tool output embedded in error messages.
pub const MAX_TOOL_OUTPUT: usize = 256;
