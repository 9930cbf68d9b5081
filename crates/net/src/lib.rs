// Path: crates/net/src/lib.rs
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

//! Message framing and egress plumbing for the synod kernel.
//!
//! [`envelope`] defines the signed high-level message: framing,
//! validation, classification and the accumulating encoder.
//! [`outbox`] fans finished envelopes out to per-destination queues whose
//! delivery is gated by a visibility threshold. [`bus`] is the contract
//! the transport below must satisfy; the kernel itself never touches a
//! socket.

pub mod bus;
pub mod envelope;
pub mod outbox;

pub use bus::MessageBus;
pub use envelope::{Hlmsg, HlmsgBuf, HlmsgEncoder, SerialCell, MTU_MIN};
pub use outbox::{Destination, MessageQueue, Outbox};
