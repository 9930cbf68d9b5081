// Path: crates/node/src/peer.rs
//! Per-peer bookkeeping: identity, routing, commits and join-tree data.

use std::cell::RefCell;
use std::rc::Rc;
use synod_net::{Destination, MessageQueue, Outbox};
use synod_storage::CommitChain;
use synod_types::status::Disposition;
use synod_types::wire::{NetworkIdentifierPair, PUBKEY_SIZE};
use synod_types::{Instant, NodeId};

/// The number of round-trip samples averaged into the latency estimate.
pub const NUM_LATENCY_SAMPLES: usize = 8;

/// Everything the local node tracks about one node of the system
/// (including itself).
pub struct Peer {
    /// The node's derived id.
    pub id: NodeId,
    /// Where the node answers.
    pub net_id: NetworkIdentifierPair,
    /// The node's public key.
    pub pubkey: [u8; PUBKEY_SIZE],
    /// Whether this record describes the local node.
    pub is_local: bool,
    /// The local opinion of this node.
    pub disposition: Disposition,
    /// Why the disposition last went negative, for the log.
    pub negative_reason: Option<String>,

    /// The node's commit bookkeeping.
    pub comchain: CommitChain,

    /// Point-to-point outbox for this node.
    pub rpc_out: Outbox,
    /// Queue of rpc envelopes to this node.
    pub rpc_mq: Rc<RefCell<MessageQueue>>,
    /// Queue of committed-redistributable envelopes to this node, gated by
    /// its visibility horizon.
    pub cr_mq: Rc<RefCell<MessageQueue>>,

    /// Whether a transport route to the node is believed to exist.
    pub has_route: bool,
    /// Tick of the last route announcement made on this node's behalf.
    pub last_route_announce: Instant,
    /// Tick of the last ping sent.
    pub last_ping: Instant,
    /// Tick of the last pong received.
    pub last_pong: Instant,
    /// The correlation id of the outstanding ping, if any.
    pub in_flight_ping: Option<u64>,
    /// Ping counter feeding the correlation-id hash.
    pub ping_counter: u64,
    /// Round-trip samples, newest first.
    pub latency_samples: [u32; NUM_LATENCY_SAMPLES],
    /// The smoothed round-trip estimate.
    pub latency: u32,

    /// The effective instant of the last DENY vote cast against this
    /// node, to vote once per window.
    pub last_deny_vote: Instant,

    /// This node's own Accept envelope, as raw wire bytes.
    pub join_tree_data: Vec<u8>,
    /// Nodes whose Accepts this node issued, in admission order.
    pub join_tree_children: Vec<NodeId>,
    /// The next join-tree child offset to query, `None` once this branch
    /// reported end-of-list.
    pub curr_join_tree_query: Option<u32>,
}

impl Peer {
    /// Assembles a peer record around its routing endpoints.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        net_id: NetworkIdentifierPair,
        pubkey: [u8; PUBKEY_SIZE],
        is_local: bool,
        disposition: Disposition,
        rpc_out: Outbox,
        rpc_mq: Rc<RefCell<MessageQueue>>,
        cr_mq: Rc<RefCell<MessageQueue>>,
    ) -> Self {
        Self {
            id,
            net_id,
            pubkey,
            is_local,
            disposition,
            negative_reason: None,
            comchain: CommitChain::new(),
            rpc_out,
            rpc_mq,
            cr_mq,
            has_route: false,
            last_route_announce: 0,
            last_ping: 0,
            last_pong: 0,
            in_flight_ping: None,
            ping_counter: 0,
            latency_samples: [0; NUM_LATENCY_SAMPLES],
            latency: 0,
            last_deny_vote: 0,
            join_tree_data: Vec::new(),
            join_tree_children: Vec::new(),
            curr_join_tree_query: Some(0),
        }
    }

    /// Records a fresh round-trip sample and refreshes the average.
    pub fn push_latency_sample(&mut self, rtt: u32) {
        self.latency_samples.rotate_right(1);
        self.latency_samples[0] = rtt;
        let sum: u32 = self.latency_samples.iter().sum();
        self.latency = sum / NUM_LATENCY_SAMPLES as u32;
    }

    /// Re-targets the peer's queues after an address migration.
    pub fn set_net_id(&mut self, net_id: NetworkIdentifierPair) {
        self.rpc_mq
            .borrow_mut()
            .set_destination(Destination::Unicast(net_id.clone()));
        self.cr_mq
            .borrow_mut()
            .set_destination(Destination::Unicast(net_id.clone()));
        self.net_id = net_id;
    }
}
