use crate::model::ImageStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while running the analyzer or reading its output
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Failed to launch analyzer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Analyzer exited with {status}: {output}")]
    Exited { status: String, output: String },

    #[error("Analyzer did not finish within {0:?}")]
    Timeout(Duration),

    #[error("No analyzer output directory found under {0}")]
    OutputNotFound(PathBuf),

    #[error("No annotated image found in {0}")]
    AnnotatedImageNotFound(PathBuf),

    #[error("Failed to read analyzer output {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode analyzer output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid analyzer output: {0}")]
    Malformed(String),
}

/// Errors raised by an image store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Image {0} not found")]
    NotFound(Uuid),

    #[error("Image {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ImageStatus,
        to: ImageStatus,
    },

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt image row {id}: {message}")]
    Corrupt { id: Uuid, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by image operations
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Not authorized to access image {0}")]
    NotOwner(Uuid),

    #[error("Image {0} not found")]
    NotFound(Uuid),

    #[error("Failed to {action} {path}: {source}")]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Store(StoreError),

    #[error("Failed to build archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<StoreError> for ImageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ImageError::NotFound(id),
            other => ImageError::Store(other),
        }
    }
}

impl ImageError {
    pub fn storage(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ImageError::Storage {
            action,
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ImageError::InvalidInput(_) => "INVALID_INPUT",
            ImageError::NotOwner(_) => "NOT_OWNER",
            ImageError::NotFound(_) => "NOT_FOUND",
            ImageError::Storage { .. } => "STORAGE_ERROR",
            ImageError::Detection(_) => "DETECTION_ERROR",
            ImageError::Store(StoreError::InvalidTransition { .. }) => "INVALID_TRANSITION",
            ImageError::Store(_) => "STORE_ERROR",
            ImageError::Archive(_) => "ARCHIVE_ERROR",
            ImageError::Task(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;
