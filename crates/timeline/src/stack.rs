// Path: crates/timeline/src/stack.rs
//! The standard stack: context, transactor and meta-transactor kept in
//! sync with each other.

use crate::bridge::TxBridge;
use crate::context::Context;
use crate::meta::MetaTransactor;
use crate::transactor::Transactor;
use synod_types::Instant;

/// The assembled three-layer state every node replicates.
///
/// Ownership runs strictly downward: the meta-transactor owns the bridge,
/// the bridge owns the transactor, the transactor owns the application
/// context. Destruction therefore tears the stack down in reverse
/// dependency order for free.
pub struct StdStack {
    meta: MetaTransactor<TxBridge>,
    now: Instant,
}

impl StdStack {
    /// Builds a fresh stack at instant zero.
    pub fn new() -> Self {
        let context = Context::new();
        let tx = Transactor::new(context);
        let meta = MetaTransactor::new(TxBridge::new(tx));
        Self { meta, now: 0 }
    }

    /// The meta-transactor layer.
    pub fn meta(&self) -> &MetaTransactor<TxBridge> {
        &self.meta
    }

    /// The meta-transactor layer, mutably.
    pub fn meta_mut(&mut self) -> &mut MetaTransactor<TxBridge> {
        &mut self.meta
    }

    /// The transactor layer.
    pub fn transactor(&self) -> &Transactor {
        self.meta.cxn().transactor()
    }

    /// The transactor layer, mutably.
    pub fn transactor_mut(&mut self) -> &mut Transactor {
        self.meta.cxn_mut().transactor_mut()
    }

    /// The application context.
    pub fn context(&self) -> &Context {
        self.transactor().slave()
    }

    /// The application context, mutably.
    pub fn context_mut(&mut self) -> &mut Context {
        self.transactor_mut().slave_mut()
    }

    /// The stack's logical time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Advances all three layers by `delta`, top down. A delta of zero is
    /// meaningful: it settles every layer back into consistency after
    /// history edits.
    pub fn advance(&mut self, delta: u32) {
        self.now = self.now.saturating_add(delta);
        self.meta.advance(delta);
        self.transactor_mut().advance(delta);
        self.context_mut().advance(delta);
    }
}

impl Default for StdStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SimEvent;
    use crate::object::SimObject;
    use std::any::Any;
    use synod_types::id::BOOTSTRAP_NODE_ID;
    use synod_types::status::StatusBit;
    use synod_types::{EventKey, ObjectId};

    struct Cell {
        id: ObjectId,
        marks: Vec<Instant>,
    }

    impl SimObject for Cell {
        fn id(&self) -> ObjectId {
            self.id
        }
        fn step(&mut self) {}
        fn rewind(&mut self, instant: Instant) {
            self.marks.retain(|m| *m < instant);
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct MarkEvent {
        key: EventKey,
    }

    impl SimEvent for MarkEvent {
        fn key(&self) -> EventKey {
            self.key
        }
        fn apply(&self, object: &mut dyn SimObject) {
            let cell = object.as_any_mut().downcast_mut::<Cell>().unwrap();
            cell.marks.push(self.key.instant);
        }
    }

    #[test]
    fn events_flow_through_all_three_layers() {
        // 1. SETUP: a stack with an object for the bootstrap node.
        let mut stack = StdStack::new();
        stack.context_mut().add_object(Box::new(Cell {
            id: BOOTSTRAP_NODE_ID,
            marks: Vec::new(),
        }));

        // 2. ACT: an optimistic event from the bootstrap node at instant 3.
        let event = Box::new(MarkEvent {
            key: EventKey::new(3, BOOTSTRAP_NODE_ID, 0),
        });
        let wrapper = stack.transactor_mut().put_event(event, true);
        assert!(stack.meta_mut().add_event(BOOTSTRAP_NODE_ID, wrapper));
        stack.advance(10);

        // 3. ASSERT: the application object saw the event.
        let cell = stack
            .context_mut()
            .object_mut(BOOTSTRAP_NODE_ID)
            .unwrap()
            .as_any_mut()
            .downcast_mut::<Cell>()
            .unwrap();
        assert_eq!(cell.marks, vec![3]);
    }

    #[test]
    fn chmod_feeds_a_node_count_into_the_transactor() {
        let mut stack = StdStack::new();
        stack.meta_mut().add_node(30);
        stack.meta_mut().chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 4);
        stack.advance(10);

        assert_eq!(stack.transactor().node_count_at(3), 1);
        assert_eq!(stack.transactor().node_count_at(4), 2);
    }

    #[test]
    fn events_from_denied_nodes_vanish_retroactively() {
        let mut stack = StdStack::new();
        stack.context_mut().add_object(Box::new(Cell {
            id: BOOTSTRAP_NODE_ID,
            marks: Vec::new(),
        }));

        let event = Box::new(MarkEvent {
            key: EventKey::new(6, BOOTSTRAP_NODE_ID, 0),
        });
        let wrapper = stack.transactor_mut().put_event(event, true);
        stack.meta_mut().add_event(BOOTSTRAP_NODE_ID, wrapper);
        stack.advance(10);

        // The bootstrap node is denied at 5, before the event's instant.
        stack
            .meta_mut()
            .chmod(BOOTSTRAP_NODE_ID, BOOTSTRAP_NODE_ID, StatusBit::Deny, 5);
        stack.advance(0);

        let cell = stack
            .context_mut()
            .object_mut(BOOTSTRAP_NODE_ID)
            .unwrap()
            .as_any_mut()
            .downcast_mut::<Cell>()
            .unwrap();
        assert!(cell.marks.is_empty(), "the event at 6 must be withdrawn");
    }
}
