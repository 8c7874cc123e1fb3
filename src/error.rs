use std::path::PathBuf;

use thiserror::Error;

use crate::id::ImportId;

/// A source file could not be opened or parsed as a table.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported file type: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("reader task failed: {0}")]
    Task(String),
}

impl ReadError {
    pub(crate) fn parse(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        ReadError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// A single record could not be written to the catalog.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("SKU is required")]
    MissingSku,
    #[error("Parent SKU is required")]
    MissingParent,
    #[error("Parent product not found: {0}")]
    ParentNotFound(String),
    #[error(transparent)]
    Catalog(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to encode stored value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("value for {key} is {size} bytes, above the {limit} byte limit")]
    ValueTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    #[error("chunk {index} of {group} is missing")]
    MissingChunk { group: String, index: usize },
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("task queue rejected submission: {0}")]
    Rejected(String),
    #[error("no source files to import")]
    NoFiles,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for SchedulingError {
    fn from(err: sqlx::Error) -> Self {
        SchedulingError::Rejected(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid file type, expected {expected}: {name}")]
    InvalidType { expected: &'static str, name: String },
    #[error("no spreadsheet files found in the archive")]
    NoTabularFiles,
    #[error("staging directory is outside the upload root: {}", .0.display())]
    OutsideRoot(PathBuf),
    #[error("failed to extract archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced through the inbound service interface.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no active import")]
    NoActiveImport,
    #[error("import not found: {0}")]
    NotFound(ImportId),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
