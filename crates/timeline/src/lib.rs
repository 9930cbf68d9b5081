// Path: crates/timeline/src/lib.rs
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

//! The replicated-state core of the synod kernel.
//!
//! Three layers stack to form the standard state:
//!
//! 1. a [`context::Context`], a reversible timeline of objects and events;
//! 2. a [`transactor::Transactor`] above it, admitting each event into the
//!    slave timeline only while it holds an optimistic grant or a majority
//!    of votes;
//! 3. a [`meta::MetaTransactor`] above that, gating every event by whether
//!    its originating node is alive at the event's instant.
//!
//! Everything here is single-threaded and deterministic: given the same
//! events, every node converges on byte-identical slave state, no matter in
//! which order the events arrived.

pub mod bridge;
pub mod context;
pub mod event;
pub mod meta;
pub mod object;
pub mod stack;
pub mod transactor;

pub use bridge::TxBridge;
pub use context::Context;
pub use event::{ProxyEvent, SimEvent};
pub use meta::{Downstream, MetaTransactor};
pub use object::SimObject;
pub use stack::StdStack;
pub use transactor::{Transactor, TxEvent};
