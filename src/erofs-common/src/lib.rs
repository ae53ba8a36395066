//! Helpers shared by components that produce EROFS images by driving the
//! external `mkfs.erofs` tool.

pub mod constants;
pub mod utils;

pub use utils::{convert_dir_to_erofs, merge_blobs_to_erofs, mkfs_erofs_available, truncate_output};
