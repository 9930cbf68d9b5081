// Path: crates/timeline/src/object.rs
//! The object capability: step forward, rewind back.

use std::any::Any;
use synod_types::{Instant, ObjectId};

/// A simulation object: application-defined state advanced once per
/// instant and rewindable to the beginning of any past instant.
///
/// Objects are usually much larger in scope than "object" suggests; in a
/// game, one object typically carries the full state of a player or of the
/// environment. How much history an object retains is the application's
/// decision, but it must be enough to satisfy any rewind the kernel issues
/// in response to history edits.
pub trait SimObject {
    /// The timeline-unique identifier of this object. Id 0 is reserved.
    fn id(&self) -> ObjectId;

    /// Advances this object by exactly one instant.
    fn step(&mut self);

    /// Restores this object to the state it had at the *beginning* of the
    /// given instant, before any events of that instant were applied.
    fn rewind(&mut self, instant: Instant);

    /// Downcast support, so events can reach their concrete object type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
