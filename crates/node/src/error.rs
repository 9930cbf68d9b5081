// Path: crates/node/src/error.rs
//! Errors surfaced while assembling a system.

use synod_types::error::EnvelopeError;
use thiserror::Error;

/// Errors raised at system construction. Once a system runs, recoverable
/// conditions are handled internally and the application only observes
/// status transitions.
#[derive(Error, Debug)]
pub enum SystemError {
    /// An envelope encoder could not be built (bad MTU or garbage
    /// configuration).
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Key generation or the entropy source failed.
    #[error("crypto failure: {0}")]
    Crypto(String),
}
