//! Error types for the response/task-message codec.

use thiserror::Error;

/// Errors that can occur during wire encode/decode.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Header envelope too small: got {0} bytes")]
    EnvelopeTooSmall(usize),

    #[error("Header size byte is zero")]
    ZeroHeaderSize,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Header does not fit the fixed envelope: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Invalid UTF-8 in field '{field}': {source}")]
    InvalidUtf8 {
        field: String,
        source: std::string::FromUtf8Error,
    },

    #[error("Corruption: {0}")]
    Corruption(String),
}

impl From<WireError> for condor_common::CondorError {
    fn from(e: WireError) -> Self {
        condor_common::CondorError::ProtocolDecode(e.to_string())
    }
}
