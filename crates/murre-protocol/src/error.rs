use thiserror::Error;

/// Errors produced while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialize(#[source] postcard::Error),

    #[error("malformed command body: {0}")]
    MalformedCommand(#[source] postcard::Error),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(#[source] postcard::Error),

    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    #[error("truncated frame: expected {expected} bytes, found {found}")]
    TruncatedFrame { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
