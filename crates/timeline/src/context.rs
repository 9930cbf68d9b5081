// Path: crates/timeline/src/context.rs
//! The reversible timeline.
//!
//! A context holds a set of objects and a totally ordered set of events,
//! and maintains two instants: `logical_now`, the time external callers
//! observe, and `actual_now <= logical_now`, how far the objects have
//! really been stepped. Inserting or removing an event in the past rolls
//! every object back; the next advance replays forward through the edited
//! history.

use crate::event::SimEvent;
use crate::object::SimObject;
use std::collections::BTreeMap;
use synod_types::{EventKey, Instant, ObjectId};

/// The outcome of [`Context::add_event`].
#[derive(Debug, PartialEq, Eq)]
pub enum AddEvent {
    /// The event was inserted.
    Added,
    /// No object with the event's id exists; the event was dropped.
    NoSuchObject,
    /// An event with the same key already exists; the new event was
    /// dropped.
    Duplicate(EventKey),
}

/// A reversible timeline of objects and events.
#[derive(Default)]
pub struct Context {
    objects: BTreeMap<ObjectId, Box<dyn SimObject>>,
    events: BTreeMap<EventKey, Box<dyn SimEvent>>,
    /// The instant all objects are currently consistent with.
    actual_now: Instant,
    /// The instant external callers observe.
    logical_now: Instant,
}

impl Context {
    /// Creates an empty timeline at instant zero. The sentinel null event
    /// `(0,0,0)` is implicit: it can never be redacted and never applies.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current logical time.
    pub fn now(&self) -> Instant {
        self.logical_now
    }

    /// Registers an object.
    ///
    /// Returns the rejected object when its id is 0 or an object with the
    /// same id already exists; `None` signals success. A newly inserted
    /// object is immediately rewound to the context's actual time so its
    /// state is consistent with its peers.
    pub fn add_object(&mut self, mut object: Box<dyn SimObject>) -> Option<Box<dyn SimObject>> {
        let id = object.id();
        if id == 0 || self.objects.contains_key(&id) {
            return Some(object);
        }
        object.rewind(self.actual_now);
        self.objects.insert(id, object);
        None
    }

    /// Looks an object up by id.
    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut dyn SimObject> {
        self.objects.get_mut(&id).map(|o| &mut **o as &mut dyn SimObject)
    }

    /// Whether an object with the given id exists.
    pub fn has_object(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Inserts an event.
    ///
    /// An event naming a nonexistent object is dropped; an event whose key
    /// collides with an existing event is dropped and the existing key
    /// reported. Inserting into the past rolls all objects back to the
    /// event's instant.
    pub fn add_event(&mut self, event: Box<dyn SimEvent>) -> AddEvent {
        let key = event.key();
        if !self.objects.contains_key(&key.object) {
            return AddEvent::NoSuchObject;
        }
        if self.events.contains_key(&key) {
            return AddEvent::Duplicate(key);
        }

        self.events.insert(key, event);
        self.roll_back(key.instant);
        AddEvent::Added
    }

    /// Removes an event by key, rolling back first when the event is in
    /// the past. Returns false when no such event exists; the null event
    /// `(0,0,0)` is never redactable.
    pub fn redact_event(&mut self, key: EventKey) -> bool {
        if key.is_null() || !self.events.contains_key(&key) {
            return false;
        }

        self.roll_back(key.instant);
        self.events.remove(&key);
        true
    }

    /// Looks an event up by key.
    pub fn event(&self, key: EventKey) -> Option<&dyn SimEvent> {
        self.events.get(&key).map(|e| e.as_ref())
    }

    /// The first event at or after the given instant, in key order.
    pub fn first_event_after(&self, when: Instant) -> Option<&dyn SimEvent> {
        self.events
            .range(EventKey::new(when, 0, 0)..)
            .next()
            .map(|(_, e)| e.as_ref())
    }

    /// Rolls objects back so that `actual_now <= when`. External callers
    /// use this to force re-evaluation of history from `when` onward; the
    /// next advance replays forward.
    pub fn rewind_to(&mut self, when: Instant) {
        self.roll_back(when);
    }

    fn roll_back(&mut self, when: Instant) {
        if when < self.actual_now {
            self.actual_now = when;
            for object in self.objects.values_mut() {
                object.rewind(when);
            }
        }
    }

    /// Advances logical time by `delta` and steps objects until they catch
    /// up, applying each instant's events (in key order) before stepping.
    ///
    /// A delta of zero is meaningful: it replays any rolled-back history
    /// and brings every object back to consistency with `logical_now`.
    pub fn advance(&mut self, delta: u32) {
        self.logical_now = self.logical_now.saturating_add(delta);

        while self.actual_now < self.logical_now {
            let now = self.actual_now;
            let upper = EventKey::new(now, ObjectId::MAX, u32::MAX);
            for (key, event) in self.events.range(EventKey::new(now, 0, 0)..=upper) {
                if let Some(object) = self.objects.get_mut(&key.object) {
                    event.apply(object.as_mut());
                }
            }

            for object in self.objects.values_mut() {
                object.step();
            }
            self.actual_now += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A counter object that records its own history so it can rewind.
    struct Counter {
        id: ObjectId,
        value: i64,
        history: Vec<i64>, // value at the beginning of each instant
    }

    impl Counter {
        fn new(id: ObjectId) -> Self {
            Self {
                id,
                value: 0,
                history: vec![0],
            }
        }
    }

    impl SimObject for Counter {
        fn id(&self) -> ObjectId {
            self.id
        }
        fn step(&mut self) {
            self.value += 1;
            self.history.push(self.value);
        }
        fn rewind(&mut self, instant: Instant) {
            self.history.truncate(instant as usize + 1);
            self.value = *self.history.last().unwrap();
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct AddEvent2 {
        key: EventKey,
        amount: i64,
    }

    impl SimEvent for AddEvent2 {
        fn key(&self) -> EventKey {
            self.key
        }
        fn apply(&self, object: &mut dyn SimObject) {
            let counter = object.as_any_mut().downcast_mut::<Counter>().unwrap();
            counter.value += self.amount;
            // The event applies before the step records history, so patch
            // the running value only; step() will record it.
        }
    }

    fn ev(instant: Instant, object: ObjectId, serial: u32, amount: i64) -> Box<dyn SimEvent> {
        Box::new(AddEvent2 {
            key: EventKey::new(instant, object, serial),
            amount,
        })
    }

    #[test]
    fn add_object_rejects_null_and_duplicate_ids() {
        let mut ctx = Context::new();
        assert!(ctx.add_object(Box::new(Counter::new(0))).is_some());
        assert!(ctx.add_object(Box::new(Counter::new(5))).is_none());
        assert!(ctx.add_object(Box::new(Counter::new(5))).is_some());
    }

    #[test]
    fn events_for_unknown_objects_are_dropped() {
        let mut ctx = Context::new();
        assert_eq!(ctx.add_event(ev(0, 9, 0, 1)), AddEvent::NoSuchObject);
    }

    #[test]
    fn duplicate_event_keys_report_the_conflict() {
        let mut ctx = Context::new();
        ctx.add_object(Box::new(Counter::new(2)));
        assert_eq!(ctx.add_event(ev(3, 2, 0, 1)), AddEvent::Added);
        assert_eq!(
            ctx.add_event(ev(3, 2, 0, 9)),
            AddEvent::Duplicate(EventKey::new(3, 2, 0))
        );
    }

    #[test]
    fn late_event_rewinds_and_replays() {
        // 1. SETUP: advance an object well past the insertion point.
        let mut ctx = Context::new();
        ctx.add_object(Box::new(Counter::new(2)));
        ctx.advance(100);

        // 2. ACT: insert an event into the past.
        assert_eq!(ctx.add_event(ev(50, 2, 0, 1000)), AddEvent::Added);
        ctx.advance(0);

        // 3. ASSERT: the state equals stepping 0..100 with the event
        // applied at instant 50.
        let counter = ctx.object_mut(2).unwrap();
        let counter = counter.as_any_mut().downcast_mut::<Counter>().unwrap();
        assert_eq!(counter.value, 100 + 1000);
    }

    #[test]
    fn add_then_redact_is_a_no_op() {
        let mut ctx = Context::new();
        ctx.add_object(Box::new(Counter::new(2)));
        ctx.advance(10);

        ctx.add_event(ev(4, 2, 7, 50));
        assert!(ctx.redact_event(EventKey::new(4, 2, 7)));
        ctx.advance(0);

        let counter = ctx.object_mut(2).unwrap();
        let counter = counter.as_any_mut().downcast_mut::<Counter>().unwrap();
        assert_eq!(counter.value, 10);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let run = |order_flip: bool| -> i64 {
            let mut ctx = Context::new();
            ctx.add_object(Box::new(Counter::new(2)));
            ctx.advance(20);
            let (a, b) = (ev(5, 2, 0, 3), ev(9, 2, 1, 7));
            if order_flip {
                ctx.add_event(b);
                ctx.add_event(a);
            } else {
                ctx.add_event(a);
                ctx.add_event(b);
            }
            ctx.advance(0);
            let counter = ctx.object_mut(2).unwrap();
            counter
                .as_any_mut()
                .downcast_mut::<Counter>()
                .unwrap()
                .value
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn null_event_is_never_redactable() {
        let mut ctx = Context::new();
        assert!(!ctx.redact_event(EventKey::null()));
    }

    #[test]
    fn same_instant_events_apply_in_serial_order() {
        struct Recorder {
            id: ObjectId,
            seen: Rc<RefCell<Vec<u32>>>,
        }
        impl SimObject for Recorder {
            fn id(&self) -> ObjectId {
                self.id
            }
            fn step(&mut self) {}
            fn rewind(&mut self, _: Instant) {
                self.seen.borrow_mut().clear();
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
        struct Mark {
            key: EventKey,
        }
        impl SimEvent for Mark {
            fn key(&self) -> EventKey {
                self.key
            }
            fn apply(&self, object: &mut dyn SimObject) {
                let recorder = object.as_any_mut().downcast_mut::<Recorder>().unwrap();
                recorder.seen.borrow_mut().push(self.key.serial);
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut ctx = Context::new();
        ctx.add_object(Box::new(Recorder {
            id: 3,
            seen: seen.clone(),
        }));
        for serial in [4u32, 1, 3, 0] {
            ctx.add_event(Box::new(Mark {
                key: EventKey::new(2, 3, serial),
            }));
        }
        ctx.advance(5);
        assert_eq!(*seen.borrow(), vec![0, 1, 3, 4]);
    }
}
