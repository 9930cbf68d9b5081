// Path: crates/node/src/lib.rs
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

//! The full assembly of the synod kernel: one [`system::System`] per node.
//!
//! A system owns the clock, the cryptographic identities, the message
//! history, the replicated state stack and the per-peer bookkeeping, and
//! drives all of them from a single cooperative update loop. Nothing here
//! spawns a task or blocks: every asynchronous-looking behaviour
//! (retransmits, handshakes, history scans) is "check elapsed ticks,
//! produce a message if due". The determinism of the simulation depends on
//! everything happening on discrete tick boundaries.

pub mod app;
pub mod clock;
mod commgr;
mod dispatch;
pub mod error;
mod htm;
mod join;
mod modmgr;
pub mod peer;
mod routemgr;
pub mod simbus;
pub mod system;

pub use app::Application;
pub use clock::Clock;
pub use error::SystemError;
pub use simbus::{SimBus, SimNetwork};
pub use system::System;
