use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index rejected the write. For transfers this is always the
    /// connection code and is recovered by drawing a new one.
    #[error("unique constraint violated on {0}")]
    Conflict(&'static str),
    #[error("stored row is malformed: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {0} does not exist")]
    Missing(String),
    #[error("invalid blob handle {0}")]
    InvalidHandle(String),
    #[error("blob I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer not found")]
    NotFound,
    #[error("no unused connection code found after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("blob storage failure: {0}")]
    Blob(#[from] BlobError),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
