// Path: crates/types/src/id.rs
//! Logical time and identifier types.
//!
//! All timestamps in the kernel are [`Instant`]s: 32-bit logical time
//! steps. Wall-clock time never appears below the clock-synchronisation
//! layer.

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A 32-bit logical time step. The whole protocol is expressed in instants;
/// how long an instant lasts in real time is an application decision.
pub type Instant = u32;

/// Identifies a simulation object within a single timeline.
pub type ObjectId = u32;

/// The serial number of an event, a uniquifier and tie-breaker for events
/// against the same object in the same instant.
pub type EventSerial = u32;

/// Node identifiers share the object id space: each node owns the
/// simulation object carrying its id.
pub type NodeId = ObjectId;

/// The reserved null object id. No real object or node may carry it.
pub const NULL_OBJECT_ID: ObjectId = 0;

/// The object id reserved for the transactor's synthetic proxy object.
/// This id exists only inside the transactor's private master timeline.
pub const TRANSACTOR_OBJECT_ID: ObjectId = 1;

/// The well-known id of the node that founds a system. Pre-granted at
/// instant zero; join-derived ids are always greater than this.
pub const BOOTSTRAP_NODE_ID: NodeId = 1;

/// The `~0` instant used to mean "not set" / "never".
pub const NEVER: Instant = u32::MAX;

/// The totally ordered identity of an event.
///
/// Events are uniquely identified within a timeline by this triple, and the
/// derived lexicographic order `(instant, object, serial)` is the order in
/// which co-existing events apply.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Encode, Decode, Serialize, Deserialize,
)]
pub struct EventKey {
    /// The instant at which the event applies.
    pub instant: Instant,
    /// The object the event applies to.
    pub object: ObjectId,
    /// The serial number, unique per `(instant, object)`.
    pub serial: EventSerial,
}

impl EventKey {
    /// Builds a key from its components.
    pub fn new(instant: Instant, object: ObjectId, serial: EventSerial) -> Self {
        Self {
            instant,
            object,
            serial,
        }
    }

    /// The key of the sentinel null event that every timeline contains.
    pub fn null() -> Self {
        Self::new(0, 0, 0)
    }

    /// Whether this is the sentinel null event key.
    pub fn is_null(&self) -> bool {
        self.instant == 0 && self.object == 0 && self.serial == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_keys_order_by_instant_then_object_then_serial() {
        let a = EventKey::new(1, 9, 9);
        let b = EventKey::new(2, 0, 0);
        let c = EventKey::new(2, 1, 0);
        let d = EventKey::new(2, 1, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn null_key_is_recognised() {
        assert!(EventKey::null().is_null());
        assert!(!EventKey::new(0, 0, 1).is_null());
    }
}
