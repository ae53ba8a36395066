//! A container snapshotter that composes read-only EROFS layer images with
//! writable overlays.
//!
//! The runtime drives the snapshot lifecycle through [`Snapshotter`]:
//! `prepare` an active snapshot, let a differ or container write into its
//! mounts, `commit` it into an immutable EROFS layer, and stack committed
//! layers under new snapshots via overlayfs. Mount stacks are returned as
//! data ([`Mount`] lists) for the runtime to apply; only in block mode does
//! the snapshotter mount intermediate layers itself, handing back a single
//! bind mount.
//!
//! State lives under a single root directory: a transactional metadata
//! database plus one directory per snapshot. Consistency across crashes
//! and concurrent operations comes from store transactions, exclusive file
//! creation, and rename-based publication, not from process-wide locks.

mod block;
mod cleanup;
mod config;
mod diff;
mod error;
mod fsmeta;
mod fsverity;
mod loopdev;
mod mount;
mod mountinfo;
mod paths;
mod planner;
mod snapshot;
mod snapshotter;
mod store;
mod sys;
mod tracker;
mod usage;

pub mod labels;
pub mod preflight;

pub use config::SnapshotterConfig;
pub use diff::mounts_to_layer;
pub use error::{Error, Result};
pub use snapshot::{Info, Kind, Mount, Snapshot, Usage, WalkFilter};
pub use snapshotter::Snapshotter;
pub use tracker::MountTracker;
