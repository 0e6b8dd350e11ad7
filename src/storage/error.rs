use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block: piece {piece}, offset {offset}")]
    InvalidBlock { piece: u32, offset: u32 },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
