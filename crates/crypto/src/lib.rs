// Path: crates/crypto/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

//! Cryptographic primitives for the synod kernel.
//!
//! Signing uses Ed25519 via `dcrypt`; everything content-addressed (message
//! hashes, commit hashes, id derivation, directory condensation) uses
//! SHA3-256, with SHAKE-256 driving the keyed garbage sponge. Only the
//! abstract [`sign::Signator`] / [`sign::Verifier`] contract is visible to
//! the rest of the kernel, so the curve can be swapped without touching the
//! protocol.

pub mod error;
pub mod hash;
pub mod random;
pub mod sign;

pub use error::CryptoError;
pub use hash::{sha3, MsgHash};
pub use sign::{PubkeyHint, Signator, Verifier};
