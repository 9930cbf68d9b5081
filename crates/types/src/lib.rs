// Path: crates/types/src/lib.rs
#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # Synod Types
//!
//! This crate is the foundational library for the synod kernel, containing
//! the core identifier types, the wire message set, configuration objects
//! and error enums shared by every other crate in the workspace.
//!
//! ## Architectural Role
//!
//! As the base crate, `synod-types` has minimal dependencies and is itself a
//! dependency for almost every other crate in the workspace. This structure
//! prevents circular dependencies and provides a stable, canonical
//! definition for shared types like [`id::EventKey`], [`wire::Message`] and
//! the [`status::SystemStatus`] the application observes.

/// The canonical, deterministic binary codec for all wire payloads.
pub mod codec;
/// System tunables, default derivation from the standard latency, profiles.
pub mod config;
/// A unified set of error types used across the workspace.
pub mod error;
/// Logical time, object/node identifiers and the event ordering key.
pub mod id;
/// Node status bits, dispositions and the externally visible system status.
pub mod status;
/// The wire message choice and network identifiers.
pub mod wire;

pub use id::{EventKey, EventSerial, Instant, NodeId, ObjectId};
