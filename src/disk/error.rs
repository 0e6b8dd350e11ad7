use std::sync::Arc;

use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by the disk core's handlers.
///
/// Cloneable because one underlying failure may fan out to several
/// subscribers (coalesced reads, batched save callbacks).
#[derive(Debug, Clone, Error)]
pub enum DiskError {
    /// The write buffer is full after a persistent save failure; newly
    /// arriving blocks are dropped.
    #[error("write buffer full, block dropped")]
    BlockDropped,

    /// The block was already saved to disk.
    #[error("duplicate block")]
    DuplicateBlock,

    /// The block's piece index, offset or length is out of range.
    #[error("invalid block")]
    InvalidBlock,

    /// The piece failed its hash check; buffered blocks were discarded.
    /// Not a disk fault: the save operation is wrapped up so callers can
    /// conclude any logic tied to the save handlers.
    #[error("corrupt piece data dropped")]
    CorruptDataDropped,

    /// The operation was abandoned, e.g. the torrent is gone or the disk
    /// core is shutting down.
    #[error("operation aborted")]
    OperationAborted,

    /// A storage failure propagated from a worker.
    #[error("storage error: {0}")]
    Storage(Arc<StorageError>),
}

impl From<StorageError> for DiskError {
    fn from(e: StorageError) -> Self {
        Self::Storage(Arc::new(e))
    }
}
