//! Error types for the asset pipeline.

use snapsync_core::{CoreError, RecordId};
use thiserror::Error;

/// Result type for asset operations.
pub type AssetResult<T> = Result<T, AssetError>;

/// Errors from encoding, decoding or reading photo records.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The image codec failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// A photo record lacks a required field.
    #[error("record {id} has no {field} field")]
    MissingField {
        /// Record id.
        id: RecordId,
        /// Field name.
        field: &'static str,
    },

    /// Photo input rejected before it reaches the log.
    #[error("invalid photo: {message}")]
    InvalidPhoto {
        /// Description.
        message: String,
    },

    /// Submitting the photo failed.
    #[error("database error: {0}")]
    Core(#[from] CoreError),
}

impl AssetError {
    /// Creates an invalid-photo error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidPhoto {
            message: message.into(),
        }
    }
}
