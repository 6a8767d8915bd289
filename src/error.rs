//! Failure taxonomy for the caption endpoint.
//!
//! Every variant collapses to the same wire shape, `{"error": "<message>"}`,
//! where the message is the variant's `Display` output.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptionError {
    /// Multipart body could not be read, or held no file.
    #[error("invalid upload: {0}")]
    Upload(String),

    /// Bytes are not a recognized image.
    #[error("cannot identify image file: {0}")]
    Decode(String),

    /// The captioning engine failed.
    #[error("caption generation failed: {0}")]
    Inference(String),

    /// The success body could not be serialized.
    #[error("failed to encode caption: {0}")]
    Encoding(String),
}

impl CaptionError {
    /// Status used when strict status reporting is enabled.
    pub fn status(&self) -> StatusCode {
        match self {
            CaptionError::Upload(_) | CaptionError::Decode(_) => StatusCode::BAD_REQUEST,
            CaptionError::Inference(_) | CaptionError::Encoding(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<image::ImageError> for CaptionError {
    fn from(err: image::ImageError) -> Self {
        CaptionError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for CaptionError {
    fn from(err: serde_json::Error) -> Self {
        CaptionError::Encoding(err.to_string())
    }
}
