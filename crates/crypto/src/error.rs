// Path: crates/crypto/src/error.rs
//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors raised by the crypto layer.
///
/// Note that a signature failing to *verify* is not an error: the verifier
/// reports an unknown origin instead, which is a normal protocol outcome.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// A key could not be parsed or was rejected at registration.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// A signature could not be parsed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// The system entropy source failed.
    #[error("entropy source failed: {0}")]
    Entropy(String),
    /// The backend rejected an operation.
    #[error("crypto backend error: {0}")]
    Backend(String),
}
