// Path: crates/timeline/src/transactor.rs
//! The transactor: vote-gated admission of events into a slave timeline.
//!
//! The transactor maintains a private master timeline holding exactly one
//! synthetic object (id 1) and four kinds of events against it. Rather
//! than keeping an ever-growing table of past states, a single copy of the
//! voting state is mutated in place and a LIFO journal records how to undo
//! each mutation; rewinding walks the journal backwards. This makes rewind
//! O(t), which has not been a problem in practice.
//!
//! Events of the same kind in the same instant commute, but events of
//! *different* kinds do not (a node-count change would have to re-check
//! every wrapper). The two high bits of each serial number force a fixed
//! per-instant order between the kinds instead.

use crate::context::{AddEvent, Context};
use crate::event::{ProxyEvent, SimEvent};
use std::collections::BTreeMap;
use std::rc::Rc;
use synod_types::id::TRANSACTOR_OBJECT_ID;
use synod_types::{EventKey, EventSerial, Instant};
use tracing::trace;

/// The low 30 bits of a transactor serial number: a monotone counter.
pub const SN_MASK: EventSerial = 0x3FFF_FFFF;
/// Serial prefix of node-count-delta events.
pub const SN_NODE_COUNT: EventSerial = 0x0000_0000;
/// Serial prefix of wrapped application events.
pub const SN_EVENT: EventSerial = 0x4000_0000;
/// Serial prefix of vote events.
pub const SN_VOTEFOR: EventSerial = 0x8000_0000;
/// Serial prefix of deadline events.
pub const SN_DEADLINE: EventSerial = 0xC000_0000;

/// An event in the transactor's master timeline.
///
/// Clones share the wrapped delegate, so the voting layers above can keep
/// a copy for re-admission after rewinds.
#[derive(Clone)]
pub enum TxEvent {
    /// Pushes a new live-node count valid from its instant onward.
    NodeCountDelta {
        /// The master-timeline identity of this event.
        key: EventKey,
        /// The signed change in the number of live nodes.
        delta: i32,
    },
    /// Wraps an application event; inserts it into the slave while the
    /// acceptance rule holds.
    Wrapped {
        /// The master-timeline identity of this event.
        key: EventKey,
        /// The application event, shared with the slave-side proxy.
        delegate: Rc<dyn SimEvent>,
        /// Whether the wrapper starts under an optimistic grant.
        optimistic: bool,
    },
    /// Adds one vote to the wrapper identified by `target`.
    VoteFor {
        /// The master-timeline identity of this event.
        key: EventKey,
        /// The slave-timeline triple of the voted-for event.
        target: EventKey,
    },
    /// Clears the optimistic grant on the wrapper identified by `target`.
    Deadline {
        /// The master-timeline identity of this event.
        key: EventKey,
        /// The slave-timeline triple of the affected event.
        target: EventKey,
    },
}

impl TxEvent {
    /// The master-timeline key of this event.
    pub fn key(&self) -> EventKey {
        match self {
            TxEvent::NodeCountDelta { key, .. }
            | TxEvent::Wrapped { key, .. }
            | TxEvent::VoteFor { key, .. }
            | TxEvent::Deadline { key, .. } => *key,
        }
    }

    /// For wrapped events, the slave-timeline triple of the delegate.
    pub fn delegate_key(&self) -> Option<EventKey> {
        match self {
            TxEvent::Wrapped { delegate, .. } => Some(delegate.key()),
            _ => None,
        }
    }
}

/// One segment of the piecewise-constant live-node count.
struct NodeCount {
    valid_after: Instant,
    count: u32,
}

/// The mutable voting state of one wrapped event.
struct WrappedState {
    delegate: Rc<dyn SimEvent>,
    votes: u32,
    optimistic: bool,
    accepted: bool,
}

/// One undoable mutation. Entries are only ever accessed LIFO; an entry is
/// always popped (by the rewind preceding a redact) before the event that
/// produced it can be dropped.
enum JournalEntry {
    NodeCount { when: Instant },
    Wrapped { when: Instant, target: EventKey },
    Vote { when: Instant, target: EventKey },
    Deadline { when: Instant, target: EventKey },
}

impl JournalEntry {
    fn when(&self) -> Instant {
        match self {
            JournalEntry::NodeCount { when }
            | JournalEntry::Wrapped { when, .. }
            | JournalEntry::Vote { when, .. }
            | JournalEntry::Deadline { when, .. } => *when,
        }
    }
}

/// The voting layer between a master timeline and its slave context.
pub struct Transactor {
    /// Master-timeline events, all against the synthetic proxy object.
    events: BTreeMap<EventKey, TxEvent>,
    actual_now: Instant,
    logical_now: Instant,

    /// Node-count segments, newest last. The initial `{0, 1}` segment is
    /// not journalled and never pops.
    node_counts: Vec<NodeCount>,
    journal: Vec<JournalEntry>,
    wrapped: BTreeMap<EventKey, WrappedState>,
    next_serial: EventSerial,

    slave: Context,
}

impl Transactor {
    /// Wraps a slave context in a fresh transactor.
    pub fn new(slave: Context) -> Self {
        Self {
            events: BTreeMap::new(),
            actual_now: 0,
            logical_now: 0,
            node_counts: vec![NodeCount {
                valid_after: 0,
                count: 1,
            }],
            journal: Vec::new(),
            wrapped: BTreeMap::new(),
            next_serial: 0,
            slave,
        }
    }

    /// The slave context.
    pub fn slave(&self) -> &Context {
        &self.slave
    }

    /// The slave context, mutably.
    pub fn slave_mut(&mut self) -> &mut Context {
        &mut self.slave
    }

    fn alloc_serial(&mut self, prefix: EventSerial) -> EventSerial {
        let serial = (self.next_serial & SN_MASK) | prefix;
        self.next_serial = self.next_serial.wrapping_add(1);
        serial
    }

    /// Builds a node-count-delta event effective from `when`.
    pub fn node_count_delta(&mut self, delta: i32, when: Instant) -> TxEvent {
        let serial = self.alloc_serial(SN_NODE_COUNT);
        TxEvent::NodeCountDelta {
            key: EventKey::new(when, TRANSACTOR_OBJECT_ID, serial),
            delta,
        }
    }

    /// Wraps an application event for vote-gated admission, consuming it.
    pub fn put_event(&mut self, delegate: Box<dyn SimEvent>, optimistic: bool) -> TxEvent {
        let instant = delegate.key().instant;
        let serial = self.alloc_serial(SN_EVENT);
        TxEvent::Wrapped {
            key: EventKey::new(instant, TRANSACTOR_OBJECT_ID, serial),
            delegate: Rc::from(delegate),
            optimistic,
        }
    }

    /// Builds a vote for the event identified by `target`. The vote takes
    /// effect at the target's instant.
    pub fn votefor(&mut self, target: EventKey) -> TxEvent {
        let serial = self.alloc_serial(SN_VOTEFOR);
        TxEvent::VoteFor {
            key: EventKey::new(target.instant, TRANSACTOR_OBJECT_ID, serial),
            target,
        }
    }

    /// Builds a deadline that clears the optimistic grant on `target` at
    /// instant `at`.
    pub fn deadline(&mut self, target: EventKey, at: Instant) -> TxEvent {
        let serial = self.alloc_serial(SN_DEADLINE);
        TxEvent::Deadline {
            key: EventKey::new(at, TRANSACTOR_OBJECT_ID, serial),
            target,
        }
    }

    /// Inserts an event into the master timeline, rolling back when the
    /// event lies in the past. Duplicate keys are dropped.
    pub fn add_master_event(&mut self, event: TxEvent) -> bool {
        let key = event.key();
        if self.events.contains_key(&key) {
            return false;
        }
        self.events.insert(key, event);
        self.roll_back(key.instant);
        true
    }

    /// Removes an event from the master timeline, rolling back first when
    /// it lies in the past.
    pub fn redact_master_event(&mut self, key: EventKey) -> bool {
        if !self.events.contains_key(&key) {
            return false;
        }
        self.roll_back(key.instant);
        self.events.remove(&key);
        true
    }

    /// The master timeline's logical time.
    pub fn now(&self) -> Instant {
        self.logical_now
    }

    /// The live-node count in force at `when`.
    pub fn node_count_at(&self, when: Instant) -> u32 {
        // The initial {0, 1} segment guarantees a match.
        self.node_counts
            .iter()
            .rev()
            .find(|nc| nc.valid_after <= when)
            .map(|nc| nc.count)
            .unwrap_or(1)
    }

    /// Whether the wrapper for `target` currently sits in the slave.
    pub fn is_accepted(&self, target: EventKey) -> bool {
        self.wrapped.get(&target).map(|w| w.accepted).unwrap_or(false)
    }

    /// Advances the master timeline, applying events and re-running the
    /// acceptance rule. The slave context keeps its own logical clock and
    /// is advanced separately by the owning stack.
    pub fn advance(&mut self, delta: u32) {
        self.logical_now = self.logical_now.saturating_add(delta);

        while self.actual_now < self.logical_now {
            let now = self.actual_now;
            let upper = EventKey::new(now, u32::MAX, u32::MAX);
            let batch: Vec<TxEvent> = self
                .events
                .range(EventKey::new(now, 0, 0)..=upper)
                .map(|(_, e)| e.clone())
                .collect();
            for event in batch {
                self.apply(event);
            }
            // The proxy object has nothing to do on step; everything
            // happens in response to events.
            self.actual_now += 1;
        }
    }

    fn apply(&mut self, event: TxEvent) {
        match event {
            TxEvent::NodeCountDelta { key, delta } => {
                let head = self.node_counts.last().map(|nc| nc.count).unwrap_or(1);
                let count = head.saturating_add_signed(delta);
                trace!(target: "timeline::tx", when = key.instant, count, "node count change");
                self.node_counts.push(NodeCount {
                    valid_after: key.instant,
                    count,
                });
                self.journal.push(JournalEntry::NodeCount { when: key.instant });
            }
            TxEvent::Wrapped {
                key,
                delegate,
                optimistic,
            } => {
                let target = delegate.key();
                if self.wrapped.contains_key(&target) {
                    return;
                }
                self.wrapped.insert(
                    target,
                    WrappedState {
                        delegate,
                        votes: 0,
                        optimistic,
                        accepted: false,
                    },
                );
                self.accept_reject(target);
                self.journal.push(JournalEntry::Wrapped {
                    when: key.instant,
                    target,
                });
            }
            TxEvent::VoteFor { key, target } => {
                let Some(wrapper) = self.wrapped.get_mut(&target) else {
                    return;
                };
                wrapper.votes += 1;
                self.accept_reject(target);
                self.journal.push(JournalEntry::Vote {
                    when: key.instant,
                    target,
                });
            }
            TxEvent::Deadline { key, target } => {
                let Some(wrapper) = self.wrapped.get_mut(&target) else {
                    return;
                };
                wrapper.optimistic = false;
                self.accept_reject(target);
                self.journal.push(JournalEntry::Deadline {
                    when: key.instant,
                    target,
                });
            }
        }
    }

    /// Re-evaluates the acceptance rule for one wrapper and admits or
    /// redacts its slave-side proxy accordingly.
    fn accept_reject(&mut self, target: EventKey) {
        let node_count = self.node_count_at(target.instant);
        let Some(wrapper) = self.wrapped.get_mut(&target) else {
            return;
        };

        let should_accept = wrapper.optimistic || wrapper.votes * 2 >= node_count;
        if should_accept && !wrapper.accepted {
            wrapper.accepted = true;
            let proxy = Box::new(ProxyEvent::new(wrapper.delegate.clone()));
            if self.slave.add_event(proxy) != AddEvent::Added {
                trace!(target: "timeline::tx", ?target, "slave refused proxy event");
            }
        } else if !should_accept && wrapper.accepted {
            wrapper.accepted = false;
            self.slave.redact_event(target);
        }
    }

    fn roll_back(&mut self, when: Instant) {
        if when >= self.actual_now {
            return;
        }
        self.actual_now = when;
        while let Some(entry) = self.journal.last() {
            if entry.when() < when {
                break;
            }
            let entry = match self.journal.pop() {
                Some(entry) => entry,
                None => break,
            };
            self.unapply(entry);
        }
    }

    fn unapply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::NodeCount { .. } => {
                // The initial segment is not journalled, so this pop never
                // removes it.
                if self.node_counts.len() > 1 {
                    self.node_counts.pop();
                }
            }
            JournalEntry::Vote { target, .. } => {
                if let Some(wrapper) = self.wrapped.get_mut(&target) {
                    wrapper.votes = wrapper.votes.saturating_sub(1);
                    self.accept_reject(target);
                }
            }
            JournalEntry::Deadline { target, .. } => {
                if let Some(wrapper) = self.wrapped.get_mut(&target) {
                    wrapper.optimistic = true;
                    self.accept_reject(target);
                }
            }
            JournalEntry::Wrapped { target, .. } => {
                if let Some(wrapper) = self.wrapped.remove(&target) {
                    if wrapper.accepted {
                        self.slave.redact_event(target);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SimObject;
    use std::any::Any;
    use synod_types::ObjectId;

    struct Tape {
        id: ObjectId,
        applied: Vec<(Instant, i64)>, // (instant, amount) in apply order
        now: Instant,
    }

    impl Tape {
        fn new(id: ObjectId) -> Self {
            Self {
                id,
                applied: Vec::new(),
                now: 0,
            }
        }
    }

    impl SimObject for Tape {
        fn id(&self) -> ObjectId {
            self.id
        }
        fn step(&mut self) {
            self.now += 1;
        }
        fn rewind(&mut self, instant: Instant) {
            self.now = instant;
            self.applied.retain(|(at, _)| *at < instant);
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Stamp {
        key: EventKey,
        amount: i64,
    }

    impl SimEvent for Stamp {
        fn key(&self) -> EventKey {
            self.key
        }
        fn apply(&self, object: &mut dyn SimObject) {
            let tape = object.as_any_mut().downcast_mut::<Tape>().unwrap();
            tape.applied.push((self.key.instant, self.amount));
        }
    }

    fn new_tx() -> Transactor {
        let mut slave = Context::new();
        slave.add_object(Box::new(Tape::new(8)));
        Transactor::new(slave)
    }

    fn stamp(instant: Instant, serial: u32) -> Box<dyn SimEvent> {
        Box::new(Stamp {
            key: EventKey::new(instant, 8, serial),
            amount: 1,
        })
    }

    fn slave_applied(tx: &mut Transactor) -> Vec<(Instant, i64)> {
        tx.slave_mut()
            .object_mut(8)
            .unwrap()
            .as_any_mut()
            .downcast_mut::<Tape>()
            .unwrap()
            .applied
            .clone()
    }

    #[test]
    fn optimistic_event_appears_without_votes() {
        let mut tx = new_tx();
        let wrapper = tx.put_event(stamp(2, 0), true);
        tx.add_master_event(wrapper);
        tx.advance(5);
        tx.slave_mut().advance(5);
        assert!(tx.is_accepted(EventKey::new(2, 8, 0)));
        assert_eq!(slave_applied(&mut tx), vec![(2, 1)]);
    }

    #[test]
    fn non_optimistic_event_needs_majority() {
        let mut tx = new_tx();
        // Raise the node count to 3 before the event's instant.
        let delta = tx.node_count_delta(2, 0);
        tx.add_master_event(delta);

        let wrapper = tx.put_event(stamp(2, 0), false);
        tx.add_master_event(wrapper);
        tx.advance(5);
        assert!(!tx.is_accepted(EventKey::new(2, 8, 0)));

        // One vote: 1*2 < 3, still out.
        let vote = tx.votefor(EventKey::new(2, 8, 0));
        tx.add_master_event(vote);
        tx.advance(0);
        assert!(!tx.is_accepted(EventKey::new(2, 8, 0)));

        // Second vote: 2*2 >= 3, in.
        let vote = tx.votefor(EventKey::new(2, 8, 0));
        tx.add_master_event(vote);
        tx.advance(0);
        assert!(tx.is_accepted(EventKey::new(2, 8, 0)));
    }

    #[test]
    fn deadline_clears_optimism() {
        let mut tx = new_tx();
        let delta = tx.node_count_delta(2, 0);
        tx.add_master_event(delta);

        let wrapper = tx.put_event(stamp(2, 0), true);
        let target = EventKey::new(2, 8, 0);
        tx.add_master_event(wrapper);
        let deadline = tx.deadline(target, 6);

        tx.add_master_event(deadline);
        tx.advance(6);
        assert!(tx.is_accepted(target), "optimistic until the deadline runs");

        tx.advance(1);
        assert!(!tx.is_accepted(target), "deadline at 6 with no votes");
    }

    #[test]
    fn votes_survive_deadline() {
        let mut tx = new_tx();
        let wrapper = tx.put_event(stamp(2, 0), true);
        let target = EventKey::new(2, 8, 0);
        tx.add_master_event(wrapper);
        let vote = tx.votefor(target);
        tx.add_master_event(vote);
        let deadline = tx.deadline(target, 6);
        tx.add_master_event(deadline);

        tx.advance(10);
        // 1 vote * 2 >= node count 1.
        assert!(tx.is_accepted(target));
    }

    #[test]
    fn redacting_a_vote_rewinds_and_reevaluates() {
        let mut tx = new_tx();
        let delta = tx.node_count_delta(1, 0); // count 2 from instant 0
        tx.add_master_event(delta);

        let wrapper = tx.put_event(stamp(2, 0), false);
        let target = EventKey::new(2, 8, 0);
        tx.add_master_event(wrapper);
        let vote = tx.votefor(target);
        let vote_key = vote.key();
        tx.add_master_event(vote);

        tx.advance(10);
        assert!(tx.is_accepted(target));

        tx.redact_master_event(vote_key);
        tx.advance(0);
        assert!(!tx.is_accepted(target), "without the vote 0*2 < 2");
    }

    #[test]
    fn rewind_and_replay_is_deterministic() {
        let mut tx = new_tx();
        let wrapper = tx.put_event(stamp(3, 0), true);
        tx.add_master_event(wrapper);
        tx.advance(10);
        tx.slave_mut().advance(10);
        let before = slave_applied(&mut tx);

        // A node-count change in the past forces a full rewind/replay.
        let delta = tx.node_count_delta(1, 1);
        tx.add_master_event(delta);
        tx.advance(0);
        tx.slave_mut().advance(0);

        assert_eq!(slave_applied(&mut tx), before);
    }
}
