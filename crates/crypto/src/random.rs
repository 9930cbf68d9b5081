// Path: crates/crypto/src/random.rs
//! Secure randomness for salts, keys and ping ids.

use crate::error::CryptoError;
use rand::rngs::OsRng;
use rand::RngCore;

/// Fills the buffer with operating-system entropy.
///
/// This is a comparatively expensive call; use it to seed deterministic
/// generators (the garbage sponge, ping-id hashing) rather than per-message.
pub fn secure_random(dst: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(dst)
        .map_err(|e| CryptoError::Entropy(e.to_string()))
}

/// Returns an array of operating-system entropy.
pub fn secure_random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    secure_random(&mut out)?;
    Ok(out)
}
