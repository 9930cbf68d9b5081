// Path: crates/net/src/outbox.rs
//! Outboxes and per-destination message queues.
//!
//! An outbox fronts one envelope encoder; every envelope it finishes is
//! handed to all subscribed queues. Each queue tags envelopes with the
//! instant they were queued at and delivers only those at or below its
//! visibility threshold, which is how committed-redistributable traffic
//! is withheld from peers that have not yet committed far enough.

use crate::bus::MessageBus;
use crate::envelope::{HlmsgBuf, HlmsgEncoder};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use synod_types::error::EnvelopeError;
use synod_types::id::NEVER;
use synod_types::wire::{Message, NetworkIdentifierPair};
use synod_types::Instant;

/// Where a queue delivers.
#[derive(Clone, Debug)]
pub enum Destination {
    /// Every registered route.
    Broadcast,
    /// One peer.
    Unicast(NetworkIdentifierPair),
}

/// A pending-envelope queue bound to one destination.
///
/// The backing store grows on demand; entries leave in insertion order
/// once their queue instant is at or below the threshold. Since outbox
/// instants never decrease, the deliverable entries always form a prefix.
pub struct MessageQueue {
    dest: Destination,
    triangular: bool,
    threshold: Instant,
    pending: VecDeque<(Instant, Rc<HlmsgBuf>)>,
}

impl MessageQueue {
    /// Creates a queue with an unlimited (`NEVER`) threshold.
    pub fn new(dest: Destination) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            dest,
            triangular: false,
            threshold: NEVER,
            pending: VecDeque::with_capacity(16),
        }))
    }

    /// Lowers or raises the visibility threshold: only envelopes queued
    /// at or before it are delivered.
    pub fn set_threshold(&mut self, threshold: Instant) {
        self.threshold = threshold;
    }

    /// Whether unicast deliveries are additionally mirrored via the relay
    /// service (NAT hole punching during first contact).
    pub fn set_triangular(&mut self, triangular: bool) {
        self.triangular = triangular;
    }

    /// Re-targets the queue (used when a peer commandeers a new address).
    pub fn set_destination(&mut self, dest: Destination) {
        self.dest = dest;
    }

    /// The number of envelopes waiting.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn enqueue(&mut self, queued_at: Instant, msg: Rc<HlmsgBuf>) {
        self.pending.push_back((queued_at, msg));
    }

    /// Sends every deliverable envelope through the bus and drops it.
    pub fn update(&mut self, bus: &mut dyn MessageBus) {
        while let Some((queued_at, _)) = self.pending.front() {
            if *queued_at > self.threshold {
                break;
            }
            let (_, msg) = match self.pending.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            match (&self.dest, self.triangular) {
                (Destination::Unicast(netid), true) => {
                    bus.triangular_unicast(netid, msg.wire_bytes())
                }
                (Destination::Unicast(netid), false) => bus.unicast(netid, msg.wire_bytes()),
                (Destination::Broadcast, _) => bus.broadcast(msg.wire_bytes()),
            }
        }
    }
}

/// Fans finished envelopes out to subscribed queues.
pub struct Outbox {
    encoder: HlmsgEncoder,
    subscribers: Vec<Rc<RefCell<MessageQueue>>>,
    now: Instant,
}

impl Outbox {
    /// Wraps an encoder.
    pub fn new(encoder: HlmsgEncoder) -> Self {
        Self {
            encoder,
            subscribers: Vec::new(),
            now: 0,
        }
    }

    /// Subscribes a queue to every envelope finished from now on.
    pub fn subscribe(&mut self, mq: Rc<RefCell<MessageQueue>>) {
        self.subscribers.push(mq);
    }

    /// The instant stamped on envelopes started from now on.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Sets the instant for subsequent envelopes; pending accumulation
    /// must be flushed first.
    pub fn set_now(&mut self, now: Instant) {
        self.encoder.set_now(now);
        self.now = now;
    }

    /// Resets the encoder's advisory serial cell.
    pub fn reset_serial(&mut self, value: u32) {
        self.encoder.reset_serial(value);
    }

    fn distribute(&mut self, msg: HlmsgBuf) {
        let msg = Rc::new(msg);
        for mq in &self.subscribers {
            mq.borrow_mut().enqueue(self.now, msg.clone());
        }
    }

    /// Appends a message; a full envelope may finish and fan out.
    pub fn append(&mut self, message: &Message) -> Result<(), EnvelopeError> {
        if let Some(done) = self.encoder.append(message)? {
            self.distribute(done);
        }
        Ok(())
    }

    /// Encodes a message as its own envelope and fans it out immediately.
    pub fn singleton(&mut self, message: &Message) -> Result<(), EnvelopeError> {
        let done = self.encoder.singleton(message)?;
        self.distribute(done);
        Ok(())
    }

    /// Encodes a message as its own envelope and returns it instead of
    /// fanning out (the join handshake sends these by hand).
    pub fn singleton_buf(&mut self, message: &Message) -> Result<HlmsgBuf, EnvelopeError> {
        self.encoder.singleton(message)
    }

    /// Finishes and fans out the pending envelope, if any.
    pub fn flush(&mut self) -> Result<(), EnvelopeError> {
        if let Some(done) = self.encoder.flush()? {
            self.distribute(done);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MTU_MIN;
    use std::rc::Rc;
    use synod_crypto::Signator;
    use synod_types::wire::{IpAddress, MessageClass, NetworkIdentifier, PingMsg};

    /// A bus that records what was sent where.
    #[derive(Default)]
    struct RecordingBus {
        unicasts: Vec<(u16, Vec<u8>)>,
        triangular: Vec<(u16, Vec<u8>)>,
        broadcasts: Vec<Vec<u8>>,
    }

    impl MessageBus for RecordingBus {
        fn create_route(&mut self, _: &NetworkIdentifierPair) -> bool {
            true
        }
        fn delete_route(&mut self, _: &NetworkIdentifierPair) -> bool {
            true
        }
        fn unicast(&mut self, netid: &NetworkIdentifierPair, data: &[u8]) {
            self.unicasts.push((netid.intranet.port, data.to_vec()));
        }
        fn triangular_unicast(&mut self, netid: &NetworkIdentifierPair, data: &[u8]) {
            self.triangular.push((netid.intranet.port, data.to_vec()));
        }
        fn broadcast(&mut self, data: &[u8]) {
            self.broadcasts.push(data.to_vec());
        }
        fn recv(&mut self, _: &mut [u8]) -> usize {
            0
        }
    }

    fn netid(port: u16) -> NetworkIdentifierPair {
        NetworkIdentifierPair {
            intranet: NetworkIdentifier {
                port,
                address: IpAddress::V4([127, 0, 0, 1]),
            },
            internet: None,
        }
    }

    fn rpc_outbox() -> Outbox {
        let signator = Rc::new(Signator::generate().unwrap());
        Outbox::new(
            HlmsgEncoder::new(MessageClass::Rpc, Some(signator), None, MTU_MIN, 0).unwrap(),
        )
    }

    #[test]
    fn thresholds_gate_delivery() {
        let mut outbox = rpc_outbox();
        let mq = MessageQueue::new(Destination::Broadcast);
        outbox.subscribe(mq.clone());

        outbox.set_now(10);
        outbox.singleton(&Message::Ping(PingMsg { id: 1 })).unwrap();
        outbox.set_now(20);
        outbox.singleton(&Message::Ping(PingMsg { id: 2 })).unwrap();

        let mut bus = RecordingBus::default();
        mq.borrow_mut().set_threshold(15);
        mq.borrow_mut().update(&mut bus);
        assert_eq!(bus.broadcasts.len(), 1, "only the instant-10 envelope");

        mq.borrow_mut().set_threshold(NEVER);
        mq.borrow_mut().update(&mut bus);
        assert_eq!(bus.broadcasts.len(), 2);
        assert_eq!(mq.borrow().pending_len(), 0);
    }

    #[test]
    fn every_subscriber_sees_every_envelope_in_order() {
        let mut outbox = rpc_outbox();
        let a = MessageQueue::new(Destination::Unicast(netid(1000)));
        let b = MessageQueue::new(Destination::Broadcast);
        outbox.subscribe(a.clone());
        outbox.subscribe(b.clone());

        for id in 0..3u64 {
            outbox.singleton(&Message::Ping(PingMsg { id })).unwrap();
        }

        let mut bus = RecordingBus::default();
        a.borrow_mut().update(&mut bus);
        b.borrow_mut().update(&mut bus);
        assert_eq!(bus.unicasts.len(), 3);
        assert_eq!(bus.broadcasts.len(), 3);
        // Identical envelopes, preserved order.
        let ids = |wire: &Vec<u8>| HlmsgBuf::from_wire(wire).as_hlmsg().serial();
        let sent: Vec<u32> = bus.unicasts.iter().map(|(_, w)| ids(w)).collect();
        let broadcast: Vec<u32> = bus.broadcasts.iter().map(ids).collect();
        assert_eq!(sent, broadcast);
        assert!(sent.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn triangular_unicast_is_used_when_enabled() {
        let mut outbox = rpc_outbox();
        let mq = MessageQueue::new(Destination::Unicast(netid(2000)));
        mq.borrow_mut().set_triangular(true);
        outbox.subscribe(mq.clone());

        outbox.singleton(&Message::Ping(PingMsg { id: 7 })).unwrap();
        let mut bus = RecordingBus::default();
        mq.borrow_mut().update(&mut bus);
        assert_eq!(bus.triangular.len(), 1);
        assert!(bus.unicasts.is_empty());
    }
}
