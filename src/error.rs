use thiserror::Error;

use crate::codec::RasterFormat;

/// Errors surfaced by the public entry points.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Splice bounds no longer match the buffer they were computed for.
    #[error("Internal fault: {0}")]
    InternalFault(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported image format")]
    UnsupportedFormat,

    #[error("Failed to decode {format} image: {source}")]
    Malformed {
        format: RasterFormat,
        #[source]
        source: image::ImageError,
    },

    #[error("Decoded image has zero width or height")]
    EmptyImage,
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Encoder failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("JPEG quality {0} is outside 1..=100")]
    QualityOutOfRange(u8),
}

pub type Result<T, E = CompressError> = std::result::Result<T, E>;
