//! Error kinds surfaced to the runtime.
//!
//! The runtime maps these onto its own status codes, so the distinctions
//! matter more than the messages: `NotFound` and `InvalidArgument` drive the
//! parallel-unpack retry loop, `FailedPrecondition` protects parents with
//! children, and `SkipPlugin` tells the host to disable the plugin at
//! startup instead of failing every operation later.

use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Terminal preflight failure; the host should skip the plugin.
    #[error("skip plugin: {0}")]
    SkipPlugin(String),

    /// The parent exists but is not committed yet. Reported as invalid
    /// argument, but also answers `is_not_found` so that runtimes driving a
    /// parallel unpack retry instead of aborting the pull.
    #[error("parent snapshot {parent} is not committed")]
    ParentNotCommitted { parent: String },

    /// No EROFS layer blob exists for a snapshot. Recoverable: commit falls
    /// back to converting the upper directory.
    #[error("layer blob not found for snapshot {snapshot_id} in {} (searched: {})", .dir.display(), .searched.join(", "))]
    LayerBlobNotFound {
        snapshot_id: String,
        dir: PathBuf,
        searched: Vec<String>,
    },

    /// ext4 loop setup failed.
    #[error("failed to mount ext4 block device {} at {}", .source.display(), .target.display())]
    BlockMount {
        source: PathBuf,
        target: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    /// mkfs.erofs failed while converting an upper directory.
    #[error("failed to convert snapshot {snapshot_id} to erofs (source dir: {})", .upper_dir.display())]
    Conversion {
        snapshot_id: String,
        upper_dir: PathBuf,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("syscall failed")]
    Sys(#[from] nix::errno::Errno),

    #[error("metadata store: {0}")]
    Store(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::ParentNotCommitted { .. } | Error::LayerBlobNotFound { .. }
        )
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::ParentNotCommitted { .. }
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Error::FailedPrecondition(_))
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented(_))
    }

    pub fn is_skip_plugin(&self) -> bool {
        matches!(self, Error::SkipPlugin(_))
    }

    pub fn is_conversion(&self) -> bool {
        matches!(self, Error::Conversion { .. })
    }
}

macro_rules! store_error_from {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error::Store(err.to_string())
            }
        })*
    };
}

store_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    serde_json::Error,
);
