// Path: crates/timeline/src/meta.rs
//! The meta-transactor: gating events by their origin node's status.
//!
//! A node's state is its two monotone status bits plus the events it has
//! produced. Rather than keeping a table of past states, each bit is
//! represented by the instant at which it became set (`NEVER` when unset),
//! which lets any point in time be interrogated after the fact. Chmod
//! meta-events are added unconditionally and decide for themselves, when
//! applied, whether their vote carries.
//!
//! Chmod votes cannot simply be passed to the transactor below: whether a
//! vote counts depends on the status of the *voter* at the effective
//! instant. Each chmod event therefore tracks its nominal voters
//! (append-only) and counts the live ones at application time. A chmod
//! identifies itself by `(instant, target, bit)`, so the bit doubles as
//! the tie-breaker between co-instant chmods.

use crate::transactor::TxEvent;
use std::collections::BTreeMap;
use synod_types::id::{BOOTSTRAP_NODE_ID, NEVER};
use synod_types::status::StatusBit;
use synod_types::{EventKey, Instant, NodeId};
use tracing::{debug, trace};

/// The downstream connection the meta-transactor feeds: in production the
/// transactor's master timeline, in tests a recording stub.
pub trait Downstream {
    /// Admits an event downstream.
    fn accept(&mut self, event: TxEvent);
    /// Withdraws a previously admitted event.
    fn redact(&mut self, key: EventKey);
    /// Obtains a node-count-delta event effective from `when`.
    fn node_count_delta(&mut self, delta: i32, when: Instant) -> TxEvent;
}

/// A gated event belonging to one node.
struct NodeEvent {
    event: TxEvent,
    accepted: bool,
}

/// The status and event set of one node.
struct MetaNode {
    /// The node's own actual time.
    now: Instant,
    /// Instants at which GRANT and DENY became set; `NEVER` means unset.
    bits_set: [Instant; 2],
    /// Keys of the node-count deltas sent downstream when GRANT/DENY first
    /// took effect, so a rewind can withdraw them. Note that the bits may
    /// be set while these are `None` if DENY carried before GRANT.
    delta_sent: [Option<EventKey>; 2],
    /// The node's gated events, in timeline order.
    events: BTreeMap<EventKey, NodeEvent>,
}

impl MetaNode {
    fn new(id: NodeId, now: Instant) -> Self {
        let mut node = Self {
            now,
            bits_set: [NEVER, NEVER],
            delta_sent: [None, None],
            events: BTreeMap::new(),
        };
        if id == BOOTSTRAP_NODE_ID {
            node.bits_set[StatusBit::Grant.index() as usize] = 0;
        }
        node
    }

    /// Status evaluation at the node's own time: a bit is set once its
    /// instant lies strictly in the past.
    fn is_alive(&self) -> bool {
        let grant = self.bits_set[0] < self.now;
        let deny = self.bits_set[1] < self.now;
        grant && !deny
    }

    /// Whether the node was alive *at* the given instant, i.e. whether an
    /// event of that instant is admissible.
    fn alive_at(&self, instant: Instant) -> bool {
        instant > self.bits_set[0] && instant <= self.bits_set[1]
    }
}

/// One chmod meta-event: a single bit against a single node at a single
/// instant, with its nominal voters.
struct ChmodEvent {
    bit: StatusBit,
    /// The node-count delta to send downstream if this chmod carries.
    delta_event: TxEvent,
    voters: Vec<NodeId>,
}

/// The node-status layer above the transactor.
pub struct MetaTransactor<D: Downstream> {
    cxn: D,
    nodes: BTreeMap<NodeId, MetaNode>,
    /// Chmod events, keyed `(instant, target, bit)`.
    chmods: BTreeMap<EventKey, ChmodEvent>,
    actual_now: Instant,
    logical_now: Instant,
}

impl<D: Downstream> MetaTransactor<D> {
    /// Creates a meta-transactor over the given downstream connection. The
    /// bootstrap node exists from the start, with GRANT set at instant 0.
    pub fn new(cxn: D) -> Self {
        let mut this = Self {
            cxn,
            nodes: BTreeMap::new(),
            chmods: BTreeMap::new(),
            actual_now: 0,
            logical_now: 0,
        };
        this.add_node(BOOTSTRAP_NODE_ID);
        this
    }

    /// The downstream connection.
    pub fn cxn(&self) -> &D {
        &self.cxn
    }

    /// The downstream connection, mutably.
    pub fn cxn_mut(&mut self) -> &mut D {
        &mut self.cxn
    }

    /// The meta timeline's logical time.
    pub fn now(&self) -> Instant {
        self.logical_now
    }

    /// Registers a node with status UNBORN (the bootstrap node instead
    /// starts with GRANT at 0). Returns false when the id is null or
    /// already taken.
    pub fn add_node(&mut self, id: NodeId) -> bool {
        if id == 0 || self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, MetaNode::new(id, self.actual_now));
        true
    }

    /// Whether the node exists.
    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// The instant at which the node's GRANT bit became set, `NEVER` when
    /// unset.
    pub fn grant_instant(&self, id: NodeId) -> Instant {
        self.nodes
            .get(&id)
            .map(|n| n.bits_set[0])
            .unwrap_or(NEVER)
    }

    /// The instant at which the node's DENY bit became set, `NEVER` when
    /// unset.
    pub fn deny_instant(&self, id: NodeId) -> Instant {
        self.nodes
            .get(&id)
            .map(|n| n.bits_set[1])
            .unwrap_or(NEVER)
    }

    /// The number of nodes currently alive.
    pub fn live_node_count(&self) -> u32 {
        self.nodes.values().filter(|n| n.is_alive()).count() as u32
    }

    /// Adds a gated event on behalf of `node_id`, consuming it.
    ///
    /// An event in the node's past is forwarded downstream immediately if
    /// the node was alive at the event's instant; a future event waits for
    /// the node to step over it. Returns false (dropping the event) when
    /// the node is unknown or the event key collides.
    pub fn add_event(&mut self, node_id: NodeId, event: TxEvent) -> bool {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        let key = event.key();
        if node.events.contains_key(&key) {
            return false;
        }

        let immediate = key.instant <= node.now && node.alive_at(key.instant);
        node.events.insert(
            key,
            NodeEvent {
                event: event.clone(),
                accepted: immediate,
            },
        );
        if immediate {
            self.cxn.accept(event);
        }
        true
    }

    /// Casts `voter`'s vote on setting `bit` for `target` at `when`.
    ///
    /// The chmod event is created on first vote; repeat votes are silently
    /// absorbed. A fresh vote rewinds the meta timeline to `when` so that
    /// everything depending on it is re-evaluated.
    pub fn chmod(
        &mut self,
        target: NodeId,
        voter: NodeId,
        bit: StatusBit,
        when: Instant,
    ) -> bool {
        if !self.nodes.contains_key(&target) || !self.nodes.contains_key(&voter) {
            return false;
        }

        let key = EventKey::new(when, target, bit.index());
        if !self.chmods.contains_key(&key) {
            let delta = match bit {
                StatusBit::Grant => 1,
                StatusBit::Deny => -1,
            };
            let delta_event = self.cxn.node_count_delta(delta, when);
            self.chmods.insert(
                key,
                ChmodEvent {
                    bit,
                    delta_event,
                    voters: Vec::new(),
                },
            );
        }

        let chmod = match self.chmods.get_mut(&key) {
            Some(chmod) => chmod,
            None => return false,
        };
        if chmod.voters.contains(&voter) {
            return true;
        }
        chmod.voters.push(voter);
        debug!(target: "timeline::meta", target_node = target, voter, ?bit, when, "chmod vote");

        self.rewind_to(when);
        true
    }

    /// Whether `voter` has already voted for this exact chmod.
    pub fn has_chmod(&self, target: NodeId, voter: NodeId, bit: StatusBit, when: Instant) -> bool {
        let key = EventKey::new(when, target, bit.index());
        self.chmods
            .get(&key)
            .map(|c| c.voters.contains(&voter))
            .unwrap_or(false)
    }

    /// Rolls the meta timeline back so history from `when` onward is
    /// re-evaluated on the next advance.
    pub fn rewind_to(&mut self, when: Instant) {
        if when >= self.actual_now {
            return;
        }
        self.actual_now = when;
        for node in self.nodes.values_mut() {
            Self::rewind_node(&mut self.cxn, node, when);
        }
        // Node ids factor into the bootstrap special case, so re-derive it.
        if let Some(bootstrap) = self.nodes.get_mut(&BOOTSTRAP_NODE_ID) {
            bootstrap.bits_set[0] = 0;
        }
    }

    fn rewind_node(cxn: &mut D, node: &mut MetaNode, then: Instant) {
        node.now = then;

        // Clear status bits that are not strictly in the past, withdrawing
        // the node-count deltas they sent downstream.
        for bit in 0..2 {
            if node.bits_set[bit] >= then {
                if let Some(key) = node.delta_sent[bit].take() {
                    cxn.redact(key);
                }
                node.bits_set[bit] = NEVER;
            }
        }
    }

    /// Advances the meta timeline: chmods of each instant apply in
    /// `(target, bit)` order, then every node steps, admitting or
    /// withdrawing its events as its liveness dictates.
    pub fn advance(&mut self, delta: u32) {
        self.logical_now = self.logical_now.saturating_add(delta);

        while self.actual_now < self.logical_now {
            let now = self.actual_now;
            let upper = EventKey::new(now, u32::MAX, u32::MAX);
            let due: Vec<EventKey> = self
                .chmods
                .range(EventKey::new(now, 0, 0)..=upper)
                .map(|(k, _)| *k)
                .collect();
            for key in due {
                self.apply_chmod(key);
            }

            for node in self.nodes.values_mut() {
                Self::step_node(&mut self.cxn, node);
            }
            self.actual_now += 1;
        }
    }

    fn step_node(cxn: &mut D, node: &mut MetaNode) {
        node.now += 1;

        let alive = node.is_alive();
        let lower = EventKey::new(node.now, 0, 0);
        let upper = EventKey::new(node.now, u32::MAX, u32::MAX);
        for (key, entry) in node.events.range_mut(lower..=upper) {
            if alive != entry.accepted {
                if alive {
                    cxn.accept(entry.event.clone());
                } else {
                    cxn.redact(*key);
                }
                entry.accepted = alive;
            }
        }
    }

    fn apply_chmod(&mut self, key: EventKey) {
        let Some(chmod) = self.chmods.get(&key) else {
            return;
        };
        let bit = chmod.bit;
        let delta_event = chmod.delta_event.clone();

        // A vote carries when at least half of the currently live nodes
        // back it; only live voters count.
        let eligible = self.nodes.values().filter(|n| n.is_alive()).count() as u32;
        let votes = chmod
            .voters
            .iter()
            .filter(|v| self.nodes.get(v).map(|n| n.is_alive()).unwrap_or(false))
            .count() as u32;
        if votes * 2 < eligible {
            return;
        }

        let Some(target) = self.nodes.get_mut(&key.object) else {
            return;
        };
        let bit_ix = bit.index() as usize;

        // If this chmod actually changes the node count, send the delta
        // downstream and remember it for rewinds. The actual now is
        // included in the already-set range to account for the bootstrap
        // node gaining GRANT spontaneously at instant zero.
        if target.bits_set[bit_ix] > target.now {
            trace!(target: "timeline::meta", node = key.object, ?bit, when = key.instant, "chmod carries");
            target.delta_sent[bit_ix] = Some(delta_event.key());
            self.cxn.accept(delta_event);
        }

        // The new set-instant is this event's instant if earlier than the
        // old one. In the current design that only happens when the bit is
        // not set at all, but testing this way is simpler and robust.
        if key.instant < target.bits_set[bit_ix] {
            target.bits_set[bit_ix] = key.instant;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactor::SN_EVENT;
    use std::cell::RefCell;
    use std::rc::Rc;
    use synod_types::id::TRANSACTOR_OBJECT_ID;

    /// Records accept/redact traffic instead of feeding a transactor.
    #[derive(Default)]
    struct Recorder {
        inner: Rc<RefCell<RecorderInner>>,
    }

    #[derive(Default)]
    struct RecorderInner {
        accepted: Vec<EventKey>,
        redacted: Vec<EventKey>,
        serial: u32,
    }

    impl Downstream for Recorder {
        fn accept(&mut self, event: TxEvent) {
            self.inner.borrow_mut().accepted.push(event.key());
        }
        fn redact(&mut self, key: EventKey) {
            self.inner.borrow_mut().redacted.push(key);
        }
        fn node_count_delta(&mut self, delta: i32, when: Instant) -> TxEvent {
            let mut inner = self.inner.borrow_mut();
            let serial = inner.serial;
            inner.serial += 1;
            TxEvent::NodeCountDelta {
                key: EventKey::new(when, TRANSACTOR_OBJECT_ID, serial),
                delta,
            }
        }
    }

    fn tx_event(serial: u32, instant: Instant) -> TxEvent {
        TxEvent::VoteFor {
            key: EventKey::new(instant, TRANSACTOR_OBJECT_ID, serial | SN_EVENT),
            target: EventKey::new(instant, 9, 0),
        }
    }

    fn new_meta() -> (MetaTransactor<Recorder>, Rc<RefCell<RecorderInner>>) {
        let recorder = Recorder::default();
        let inner = recorder.inner.clone();
        (MetaTransactor::new(recorder), inner)
    }

    #[test]
    fn bootstrap_node_is_born_granted() {
        let (meta, _) = new_meta();
        assert_eq!(meta.grant_instant(BOOTSTRAP_NODE_ID), 0);
        assert_eq!(meta.deny_instant(BOOTSTRAP_NODE_ID), NEVER);
    }

    #[test]
    fn events_from_unborn_nodes_never_surface() {
        let (mut meta, inner) = new_meta();
        meta.add_node(30);

        assert!(meta.add_event(30, tx_event(1, 5)));
        meta.advance(20);
        assert!(inner.borrow().accepted.is_empty());
    }

    #[test]
    fn events_from_live_nodes_flow_downstream() {
        let (mut meta, inner) = new_meta();
        // The bootstrap node is alive from instant 1 onward.
        let key = tx_event(1, 5).key();
        assert!(meta.add_event(BOOTSTRAP_NODE_ID, tx_event(1, 5)));
        meta.advance(20);
        assert_eq!(inner.borrow().accepted, vec![key]);
    }

    #[test]
    fn past_events_from_live_nodes_surface_immediately() {
        let (mut meta, inner) = new_meta();
        meta.advance(10);
        let key = tx_event(1, 5).key();
        assert!(meta.add_event(BOOTSTRAP_NODE_ID, tx_event(1, 5)));
        assert_eq!(inner.borrow().accepted, vec![key]);
    }

    #[test]
    fn carried_grant_sets_bit_and_sends_delta() {
        let (mut meta, inner) = new_meta();
        meta.add_node(30);
        meta.advance(10);

        // One voter (the bootstrap node) out of one live node: carries.
        assert!(meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 12));
        meta.advance(10);

        assert_eq!(meta.grant_instant(30), 12);
        let inner = inner.borrow();
        assert_eq!(inner.accepted.len(), 1, "one node-count delta accepted");
        assert_eq!(inner.accepted[0].instant, 12);
    }

    #[test]
    fn rewinding_before_the_grant_clears_it() {
        let (mut meta, inner) = new_meta();
        meta.add_node(30);
        meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 12);
        meta.advance(20);
        assert_eq!(meta.grant_instant(30), 12);

        meta.rewind_to(10);
        assert_eq!(meta.grant_instant(30), NEVER);
        assert_eq!(
            inner.borrow().redacted.len(),
            1,
            "the node-count delta was withdrawn"
        );

        // Replaying re-carries the grant deterministically.
        meta.advance(0);
        assert_eq!(meta.grant_instant(30), 12);
    }

    #[test]
    fn rewinding_after_the_grant_preserves_it() {
        let (mut meta, _) = new_meta();
        meta.add_node(30);
        meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 12);
        meta.advance(20);

        meta.rewind_to(15);
        assert_eq!(meta.grant_instant(30), 12);
    }

    #[test]
    fn bootstrap_grant_survives_any_rewind() {
        let (mut meta, _) = new_meta();
        meta.advance(20);
        meta.rewind_to(0);
        assert_eq!(meta.grant_instant(BOOTSTRAP_NODE_ID), 0);
    }

    #[test]
    fn deny_gates_later_events_but_not_earlier_ones() {
        let (mut meta, inner) = new_meta();
        meta.add_node(30);
        meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 2);
        meta.advance(4); // node 30 alive from instant 3

        assert!(meta.add_event(30, tx_event(1, 4)));
        assert!(meta.add_event(30, tx_event(2, 9)));
        meta.advance(2);
        assert_eq!(inner.borrow().accepted.len(), 2, "grant delta + event@4");

        // Both live nodes vote DENY at 8; the event at 9 must not surface.
        meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Deny, 8);
        meta.chmod(30, 30, StatusBit::Deny, 8);
        meta.advance(20);

        let inner = inner.borrow();
        assert_eq!(meta.deny_instant(30), 8);
        // Accepted: grant delta, event@4, deny delta. Never the event@9.
        assert!(inner.accepted.iter().all(|k| k.instant != 9));
    }

    #[test]
    fn duplicate_votes_are_absorbed() {
        let (mut meta, _) = new_meta();
        meta.add_node(30);
        assert!(meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 5));
        assert!(meta.has_chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 5));
        assert!(meta.chmod(30, BOOTSTRAP_NODE_ID, StatusBit::Grant, 5));
        assert!(!meta.has_chmod(30, 30, StatusBit::Grant, 5));
    }
}
