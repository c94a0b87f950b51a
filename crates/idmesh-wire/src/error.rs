//! Error type for wire encode/decode operations

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
///
/// Decode errors are expected on untrusted input (stored bytes from an older
/// version, frames from a misbehaving peer) and must never panic the caller.
#[derive(Error, Debug)]
pub enum WireError {
    /// Input ended before a complete field could be read
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// A field carried a value outside its allowed range
    #[error("invalid {0}")]
    Invalid(&'static str),

    /// Frame declared a payload larger than the hard cap
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A detached signature had the wrong length
    #[error("signature must be 64 bytes (got {0})")]
    SignatureLength(usize),

    /// Bind message did not start with the expected magic
    #[error("bad bind magic")]
    BadMagic,

    /// Socket-level failure while reading a frame
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using WireError
pub type WireResult<T> = Result<T, WireError>;
