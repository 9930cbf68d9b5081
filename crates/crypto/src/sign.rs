// Path: crates/crypto/src/sign.rs
//! The signator/verifier pair: Ed25519 via dcrypt.
//!
//! Every envelope carries a two-byte public-key *hint* so the verifier can
//! skip to candidate keys instead of trying all of them; hint collisions
//! are resolved by attempting verification against each colliding key in
//! registration order.

use crate::error::CryptoError;
use crate::hash::sha3;
use dcrypt::api::Signature as _;
use dcrypt::sign::traditional::eddsa;
use rand::rngs::OsRng;
use synod_types::wire::{PUBKEY_SIZE, SIGNATURE_SIZE};
use synod_types::NodeId;

/// The short filter value derived from a public key: the first two bytes
/// of its SHA-3 digest, read little-endian.
pub type PubkeyHint = u16;

/// Derives the hint for a raw public key.
pub fn pubkey_hint_of(key: &[u8; PUBKEY_SIZE]) -> PubkeyHint {
    let digest = sha3(key);
    u16::from_le_bytes([digest[0], digest[1]])
}

/// A signing capability bound to one freshly generated Ed25519 key pair.
pub struct Signator {
    public_key: eddsa::Ed25519PublicKey,
    secret_key: eddsa::Ed25519SecretKey,
    public_bytes: [u8; PUBKEY_SIZE],
    hint: PubkeyHint,
}

impl Signator {
    /// Generates a signator with a unique key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = OsRng;
        let (public_key, secret_key) = eddsa::Ed25519::keypair(&mut rng)
            .map_err(|e| CryptoError::Backend(format!("keypair generation failed: {e:?}")))?;

        let mut public_bytes = [0u8; PUBKEY_SIZE];
        public_bytes.copy_from_slice(public_key.to_bytes().as_ref());
        let hint = pubkey_hint_of(&public_bytes);

        Ok(Self {
            public_key,
            secret_key,
            public_bytes,
            hint,
        })
    }

    /// Signs a byte range, producing a fixed-size signature.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        let signature = eddsa::Ed25519::sign(data, &self.secret_key)
            .map_err(|e| CryptoError::Backend(format!("signing failed: {e:?}")))?;
        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(signature.to_bytes().as_ref());
        Ok(out)
    }

    /// The raw public key bytes.
    pub fn public_key(&self) -> [u8; PUBKEY_SIZE] {
        self.public_bytes
    }

    /// The two-byte hint placed in envelope headers.
    pub fn pubkey_hint(&self) -> PubkeyHint {
        self.hint
    }

    /// Clones the dcrypt-level public key, for registration elsewhere.
    pub fn dcrypt_public_key(&self) -> eddsa::Ed25519PublicKey {
        self.public_key.clone()
    }
}

struct VerifierEntry {
    hint: PubkeyHint,
    key_bytes: [u8; PUBKEY_SIZE],
    key: eddsa::Ed25519PublicKey,
    node: NodeId,
}

/// Maps `(hint, public key)` pairs to node ids and identifies the origin
/// of signed envelopes.
#[derive(Default)]
pub struct Verifier {
    entries: Vec<VerifierEntry>,
}

impl Verifier {
    /// Creates a verifier with no associated nodes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a public key with a node id.
    ///
    /// Fails if the id is zero or the key is already registered.
    pub fn assoc(&mut self, key_bytes: [u8; PUBKEY_SIZE], node: NodeId) -> Result<(), CryptoError> {
        if node == 0 {
            return Err(CryptoError::InvalidKey(
                "node id 0 cannot own a key".to_string(),
            ));
        }
        if self.is_assoc(&key_bytes) {
            return Err(CryptoError::InvalidKey(format!(
                "public key {} already registered",
                hex::encode(key_bytes)
            )));
        }

        let key = eddsa::Ed25519PublicKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("unparsable public key: {e:?}")))?;
        self.entries.push(VerifierEntry {
            hint: pubkey_hint_of(&key_bytes),
            key_bytes,
            key,
            node,
        });
        Ok(())
    }

    /// Removes a public key. Returns whether it was registered.
    pub fn disassoc(&mut self, key_bytes: &[u8; PUBKEY_SIZE]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.key_bytes != key_bytes);
        self.entries.len() != before
    }

    /// Whether the key is currently registered.
    pub fn is_assoc(&self, key_bytes: &[u8; PUBKEY_SIZE]) -> bool {
        self.entries.iter().any(|e| &e.key_bytes == key_bytes)
    }

    /// Attempts to identify the source of a signed byte range.
    ///
    /// Returns the node id of the first registered key with a matching hint
    /// that verifies the signature, or 0 if none does. An unverifiable
    /// message is a normal outcome (it may come from a node not yet
    /// joined), not an error.
    pub fn verify(&self, hint: PubkeyHint, signature: &[u8; SIGNATURE_SIZE], data: &[u8]) -> NodeId {
        let Ok(sig) = eddsa::Ed25519Signature::from_bytes(signature) else {
            return 0;
        };

        for entry in self.entries.iter().filter(|e| e.hint == hint) {
            if eddsa::Ed25519::verify(data, &sig, &entry.key).is_ok() {
                return entry.node;
            }
        }
        0
    }

    /// One-shot verification against a key that need not be registered.
    pub fn verify_once(
        &self,
        key_bytes: &[u8; PUBKEY_SIZE],
        signature: &[u8; SIGNATURE_SIZE],
        data: &[u8],
    ) -> bool {
        let Ok(key) = eddsa::Ed25519PublicKey::from_bytes(key_bytes) else {
            return false;
        };
        let Ok(sig) = eddsa::Ed25519Signature::from_bytes(signature) else {
            return false;
        };
        eddsa::Ed25519::verify(data, &sig, &key).is_ok()
    }
}
