// Path: crates/storage/src/lib.rs
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

//! Message history storage for the synod kernel.
//!
//! Two structures track what has been seen:
//!
//! - the [`hash_tree::HashTree`], a semi-persistent 16-ary trie indexing
//!   every byte-exact message by its SHA-3 hash, forked cheaply for
//!   snapshots and walked by the repair protocol;
//! - the [`comchain::CommitChain`], one per peer, matching the hashes of
//!   messages actually received against the commit hashes the peer
//!   declared, to detect divergence.

pub mod comchain;
pub mod hash_tree;

pub use comchain::CommitChain;
pub use hash_tree::{AddResult, HashTree, ObjRef, Sid};
