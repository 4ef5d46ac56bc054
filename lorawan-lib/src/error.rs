use std::array::TryFromSliceError;
use std::io;
use thiserror::Error;

/// The primary error type for the `lorawan-lib` library.
///
/// Every variant is scoped to a single datagram or a single device's trust
/// state; none of them is fatal to the process.
#[derive(Error, Debug)]
pub enum LoraError {
    #[error("Truncated frame: expected at least {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("MIC mismatch")]
    MicMismatch,

    #[error("DevNonce already used")]
    ReplayedNonce,

    #[error("Stale frame counter: received {received}, current {current}")]
    StaleFrameCounter { received: u32, current: u32 },

    #[error("Payload decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Device directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Invalid hex value: {0}")]
    InvalidHex(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LoraError {
    /// Shorthand for the length check every codec performs before slicing.
    pub(crate) fn truncated(expected: usize, actual: usize) -> Self {
        LoraError::TruncatedFrame { expected, actual }
    }
}

impl From<TryFromSliceError> for LoraError {
    fn from(_: TryFromSliceError) -> Self {
        LoraError::MalformedFrame("Failed to convert slice to array".to_string())
    }
}

impl From<serde_json::Error> for LoraError {
    fn from(e: serde_json::Error) -> Self {
        LoraError::MalformedFrame(format!("JSON body: {e}"))
    }
}

impl From<base64::DecodeError> for LoraError {
    fn from(e: base64::DecodeError) -> Self {
        LoraError::MalformedFrame(format!("base64 payload: {e}"))
    }
}

impl From<hex::FromHexError> for LoraError {
    fn from(e: hex::FromHexError) -> Self {
        LoraError::InvalidHex(e.to_string())
    }
}
