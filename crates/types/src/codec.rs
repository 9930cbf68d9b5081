// Path: crates/types/src/codec.rs
//! Defines the canonical, deterministic binary codec for all wire payloads.
//!
//! This module provides thin wrappers around `parity-scale-codec` (SCALE).
//! By centralizing the codec logic here in the base `types` crate, every
//! component uses the exact same serialization for wire segments, commit
//! hashing and id derivation, so no two honest nodes ever disagree on the
//! byte representation of the same message.

use crate::error::WireError;
use parity_scale_codec::{Decode, DecodeAll, Encode};

/// Encodes a value into its canonical byte representation.
///
/// Use this for everything that is hashed, signed or compared byte-wise.
pub fn to_bytes_canonical<T: Encode>(v: &T) -> Vec<u8> {
    v.encode()
}

/// Decodes a value from its canonical byte representation.
///
/// Fails fast on any decoding error, including trailing bytes: a segment
/// that does not decode completely is malformed.
pub fn from_bytes_canonical<T: Decode>(b: &[u8]) -> Result<T, WireError> {
    T::decode_all(&mut &*b).map_err(|e| WireError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Encode, Decode, Debug, PartialEq, Eq)]
    struct TestStruct {
        id: u32,
        name: String,
        tags: Vec<u8>,
    }

    #[test]
    fn canonical_codec_round_trips() {
        let original = TestStruct {
            id: 42,
            name: "test-data".to_string(),
            tags: vec![1, 2, 3],
        };

        let encoded = to_bytes_canonical(&original);
        assert!(!encoded.is_empty());

        let decoded = from_bytes_canonical::<TestStruct>(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let original = TestStruct {
            id: 99,
            name: "another-test".to_string(),
            tags: vec![10, 20, 30],
        };

        let mut encoded = to_bytes_canonical(&original);
        encoded.pop();
        encoded.pop();

        assert!(from_bytes_canonical::<TestStruct>(&encoded).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let original = TestStruct {
            id: 7,
            name: "x".to_string(),
            tags: vec![],
        };

        let mut encoded = to_bytes_canonical(&original);
        encoded.push(0);

        assert!(from_bytes_canonical::<TestStruct>(&encoded).is_err());
    }
}
