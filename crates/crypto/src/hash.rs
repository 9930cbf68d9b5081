// Path: crates/crypto/src/hash.rs
//! SHA-3 digests and the keyed garbage sponge.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};
use synod_types::wire::HASH_SIZE;

/// A full-width message hash.
pub type MsgHash = [u8; HASH_SIZE];

/// Hashes a byte array with SHA3-256.
pub fn sha3(data: &[u8]) -> MsgHash {
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&Sha3_256::digest(data));
    out
}

/// Incremental SHA3-256 over several absorbed inputs; used wherever the
/// protocol hashes a concatenation (commit hashes, id derivation, directory
/// condensation).
#[derive(Default)]
pub struct HashAccumulator {
    inner: Sha3_256,
}

impl HashAccumulator {
    /// Starts a fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs a byte slice.
    pub fn absorb(&mut self, data: &[u8]) {
        Digest::update(&mut self.inner, data);
    }

    /// Finishes the digest.
    pub fn finish(self) -> MsgHash {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&self.inner.finalize());
        out
    }

    /// Finishes and truncates to a little-endian u64, the width used for
    /// condensed directory hashes.
    pub fn finish_u64(self) -> u64 {
        truncate_u64(&self.finish())
    }

    /// Finishes and truncates to a little-endian u32, the width used for
    /// derived node ids.
    pub fn finish_u32(self) -> u32 {
        let hash = self.finish();
        u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
    }
}

/// The first eight bytes of a hash as a little-endian integer.
pub fn truncate_u64(hash: &MsgHash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(bytes)
}

/// Extracts the nybble at the given index of a hash, high nibble first.
/// This is the digit used to descend hash-tree directories.
pub fn nybble(hash: &[u8], index: usize) -> u8 {
    let byte = hash[index / 2];
    if index % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0F
    }
}

/// A keyed sponge producing unpredictable trailing garbage for committed
/// envelopes. Each squeeze feeds the secret salt and the previous output
/// back through SHAKE-256, so an observer can never predict the next
/// envelope's tail bytes.
pub struct KeyedSponge {
    salt: Vec<u8>,
    state: Vec<u8>,
}

impl KeyedSponge {
    /// Builds a sponge from a secret salt and an initial state, both of
    /// which should come from the secure random source.
    pub fn new(salt: Vec<u8>, state: Vec<u8>) -> Self {
        Self { salt, state }
    }

    /// Advances the sponge and returns the fresh garbage bytes. The output
    /// length always equals the initial state length.
    pub fn squeeze(&mut self) -> &[u8] {
        let mut shake = Shake256::default();
        shake.update(&self.salt);
        shake.update(&self.state);
        let mut reader = shake.finalize_xof();
        reader.read(&mut self.state);
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha3_is_deterministic_and_full_width() {
        let a = sha3(b"synod");
        let b = sha3(b"synod");
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_SIZE);
        assert_ne!(a, sha3(b"Synod"));
    }

    #[test]
    fn accumulator_matches_one_shot_concatenation() {
        let mut acc = HashAccumulator::new();
        acc.absorb(b"hello ");
        acc.absorb(b"world");
        assert_eq!(acc.finish(), sha3(b"hello world"));
    }

    #[test]
    fn nybbles_walk_high_nibble_first() {
        let hash = [0xAB, 0xCD];
        assert_eq!(nybble(&hash, 0), 0xA);
        assert_eq!(nybble(&hash, 1), 0xB);
        assert_eq!(nybble(&hash, 2), 0xC);
        assert_eq!(nybble(&hash, 3), 0xD);
    }

    #[test]
    fn sponge_output_evolves_but_stays_sized() {
        let mut sponge = KeyedSponge::new(vec![1; 16], vec![2; 7]);
        let first = sponge.squeeze().to_vec();
        let second = sponge.squeeze().to_vec();
        assert_eq!(first.len(), 7);
        assert_eq!(second.len(), 7);
        assert_ne!(first, second);
    }
}
