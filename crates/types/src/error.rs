// Path: crates/types/src/error.rs
//! Core error types for the synod kernel.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors produced while decoding canonical wire bytes.
#[derive(Error, Debug)]
pub enum WireError {
    /// The bytes did not decode, or decoded with bytes left over.
    #[error("canonical decode failed: {0}")]
    Decode(String),
}

impl ErrorCode for WireError {
    fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "WIRE_DECODE_FAILED",
        }
    }
}

/// Errors produced while validating or constructing envelopes.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The buffer is too small to hold the header plus one segment.
    #[error("envelope shorter than header plus one segment")]
    Truncated,
    /// The flags byte names no known message class.
    #[error("invalid envelope flags: {0}")]
    BadFlags(u8),
    /// The segment chain ran off the end of the buffer without a
    /// terminating zero.
    #[error("unterminated segment chain")]
    UnterminatedSegments,
    /// A segment did not decode to a message, or decoded to a message of
    /// the wrong class for this envelope.
    #[error("invalid segment: {0}")]
    BadSegment(String),
    /// An encoder was configured with an MTU below the minimum.
    #[error("mtu {mtu} below minimum {min}")]
    MtuTooSmall {
        /// The configured MTU.
        mtu: usize,
        /// The smallest MTU the encoder can operate with.
        min: usize,
    },
    /// `append_garbage` of exactly 1 leaves no room for any garbage byte
    /// while still claiming garbage exists.
    #[error("append_garbage of 1 is not permitted")]
    BadGarbage,
    /// A sub-message was too large to fit a single segment.
    #[error("encoded sub-message of {0} bytes exceeds a segment")]
    SegmentOverflow(usize),
    /// Key material or entropy was unavailable while building an encoder
    /// or signing an envelope.
    #[error("crypto failure: {0}")]
    Crypto(String),
}

impl ErrorCode for EnvelopeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Truncated => "ENVELOPE_TRUNCATED",
            Self::BadFlags(_) => "ENVELOPE_BAD_FLAGS",
            Self::UnterminatedSegments => "ENVELOPE_UNTERMINATED",
            Self::BadSegment(_) => "ENVELOPE_BAD_SEGMENT",
            Self::MtuTooSmall { .. } => "ENVELOPE_MTU_TOO_SMALL",
            Self::BadGarbage => "ENVELOPE_BAD_GARBAGE",
            Self::SegmentOverflow(_) => "ENVELOPE_SEGMENT_OVERFLOW",
            Self::Crypto(_) => "ENVELOPE_CRYPTO_FAILURE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(WireError::Decode("x".into()).code(), "WIRE_DECODE_FAILED");
        assert_eq!(EnvelopeError::Truncated.code(), "ENVELOPE_TRUNCATED");
        assert_eq!(
            EnvelopeError::MtuTooSmall { mtu: 1, min: 2 }.code(),
            "ENVELOPE_MTU_TOO_SMALL"
        );
    }
}
