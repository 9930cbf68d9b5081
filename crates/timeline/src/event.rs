// Path: crates/timeline/src/event.rs
//! The event capability and the shared-delegate proxy.

use crate::object::SimObject;
use std::rc::Rc;
use synod_types::EventKey;

/// An external stimulus applied to one object at one instant.
///
/// There is no such thing as an "invalid" event: an event applied in a
/// situation where it has no useful interpretation should simply have no
/// effect. Events are identified and totally ordered by their
/// [`EventKey`] triple.
pub trait SimEvent {
    /// The `(instant, object, serial)` identity of this event.
    fn key(&self) -> EventKey;

    /// Mutates the object as this event prescribes.
    fn apply(&self, object: &mut dyn SimObject);
}

/// An event that delegates to a shared event.
///
/// The voting layers keep ownership of an admitted event (they may need to
/// re-admit it after a rewind) while the timeline that accepted it holds
/// one of these.
pub struct ProxyEvent {
    delegate: Rc<dyn SimEvent>,
}

impl ProxyEvent {
    /// Wraps a shared delegate.
    pub fn new(delegate: Rc<dyn SimEvent>) -> Self {
        Self { delegate }
    }
}

impl SimEvent for ProxyEvent {
    fn key(&self) -> EventKey {
        self.delegate.key()
    }

    fn apply(&self, object: &mut dyn SimObject) {
        self.delegate.apply(object);
    }
}
