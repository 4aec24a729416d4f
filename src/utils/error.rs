//! Error types and handling
//!
//! Common error types used across the application.

use crate::video::VideoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Video(#[from] VideoError),
}

/// Error response for callers of the command layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Video(video) => match video {
                VideoError::SourceNotFound(_) => "SOURCE_NOT_FOUND",
                VideoError::ProcessSpawn { .. } => "PROCESS_SPAWN_ERROR",
                VideoError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
                VideoError::InvalidUrl(_) => "INVALID_URL",
                VideoError::UnexpectedExit { .. } => "UNEXPECTED_EXIT",
                VideoError::Connection(_) => "CONNECTION_ERROR",
                VideoError::Bind { .. } => "BIND_ERROR",
                VideoError::PortInUse { .. } => "PORT_IN_USE",
                VideoError::Config(_) => "CONFIG_ERROR",
                VideoError::Io(_) => "IO_ERROR",
            },
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<VideoError> for ErrorResponse {
    fn from(error: VideoError) -> Self {
        AppError::from(error).into()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
