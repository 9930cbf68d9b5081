// Path: crates/node/src/system.rs
//! The system orchestrator: one instance per participating node.

use crate::app::Application;
use crate::clock::Clock;
use crate::error::SystemError;
use crate::htm::HtmMgr;
use crate::join::{JoinMgr, JoinPhase};
use crate::peer::Peer;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use synod_crypto::random::secure_random_array;
use synod_crypto::{Signator, Verifier};
use synod_net::envelope::HlmsgEncoder;
use synod_net::{Destination, MessageBus, MessageQueue, Outbox, SerialCell};
use synod_storage::{CommitChain, HashTree};
use synod_timeline::StdStack;
use synod_types::config::{Profile, SystemConfig};
use synod_types::error::EnvelopeError;
use synod_types::id::{BOOTSTRAP_NODE_ID, NEVER};
use synod_types::status::{Disposition, SystemStatus};
use synod_types::wire::{
    AppEventMsg, Message, MessageClass, NetworkIdentifierPair, VoteMsg, PUBKEY_SIZE,
};
use synod_types::{EventKey, EventSerial, Instant, NodeId, ObjectId};
use tracing::{debug, info, warn};

/// A full assembly of the synod kernel components.
///
/// Once created and configured, the primary interface between the kernel
/// and the application is the [`Application`] callback trait plus the
/// status returned by every [`System::advance`].
pub struct System<A: Application> {
    pub(crate) app: A,
    pub(crate) bus: Box<dyn MessageBus>,
    pub(crate) cfg: SystemConfig,

    pub(crate) clock: Clock,
    pub(crate) signator: Rc<Signator>,
    pub(crate) verifier: Verifier,
    pub(crate) hash_tree: HashTree,
    pub(crate) stack: StdStack,

    pub(crate) self_net_id: NetworkIdentifierPair,
    /// The local node's id, or 0 while anonymous.
    pub(crate) local_id: NodeId,
    pub(crate) peers: BTreeMap<NodeId, Peer>,

    // Router state. Committed-redistributable traffic fans out to one
    // gated queue per peer plus the loopback and commit-capture queues;
    // uncommitted-redistributable traffic broadcasts and loops back. The
    // advisory serial cell is shared by both outboxes.
    pub(crate) cr_out: Outbox,
    pub(crate) ur_out: Outbox,
    pub(crate) ur_bus_mq: Rc<RefCell<MessageQueue>>,
    pub(crate) ur_loop_mq: Rc<RefCell<MessageQueue>>,
    pub(crate) cr_loop_mq: Rc<RefCell<MessageQueue>>,
    pub(crate) cr_capture_mq: Rc<RefCell<MessageQueue>>,

    // Commit manager.
    pub(crate) commit_builder: CommitChain,
    pub(crate) last_commit: Instant,

    // Status voting.
    pub(crate) last_grant_proposal: Instant,

    pub(crate) join: JoinMgr,
    pub(crate) htm: HtmMgr,

    // Route manager.
    pub(crate) ping_salt: [u8; 8],

    // Dispatch bookkeeping.
    pub(crate) votes_seen: HashMap<EventKey, HashSet<NodeId>>,
    pub(crate) voted: HashSet<EventKey>,
    pub(crate) evt_serial: EventSerial,

    pub(crate) abnormal: Option<SystemStatus>,
    pub(crate) info_complete_reported: bool,
    pub(crate) clock_synced_reported: bool,
}

impl<A: Application> System<A> {
    /// Constructs a new, empty, unconnected system.
    ///
    /// `std_latency` is the one-way latency, in instants, the application
    /// expects to commonly experience; it seeds every interval default.
    /// `mtu` must be at least [`synod_net::MTU_MIN`] plus the committed
    /// garbage tail of 8.
    pub fn new(
        app: A,
        bus: Box<dyn MessageBus>,
        self_net_id: NetworkIdentifierPair,
        std_latency: u32,
        profile: Profile,
        mtu: usize,
    ) -> Result<Self, SystemError> {
        let cfg = SystemConfig::new(std_latency, profile, mtu);
        let signator =
            Rc::new(Signator::generate().map_err(|e| SystemError::Crypto(e.to_string()))?);

        let adv_serno: SerialCell = Rc::new(Cell::new(0));
        let mut cr_out = Outbox::new(HlmsgEncoder::new(
            MessageClass::Committed,
            Some(signator.clone()),
            Some(adv_serno.clone()),
            mtu,
            8,
        )?);
        let mut ur_out = Outbox::new(HlmsgEncoder::new(
            MessageClass::Uncommitted,
            Some(signator.clone()),
            Some(adv_serno.clone()),
            mtu,
            0,
        )?);

        let ur_bus_mq = MessageQueue::new(Destination::Broadcast);
        let ur_loop_mq = MessageQueue::new(Destination::Broadcast);
        let cr_loop_mq = MessageQueue::new(Destination::Broadcast);
        let cr_capture_mq = MessageQueue::new(Destination::Broadcast);
        ur_out.subscribe(ur_bus_mq.clone());
        ur_out.subscribe(ur_loop_mq.clone());
        cr_out.subscribe(cr_loop_mq.clone());
        cr_out.subscribe(cr_capture_mq.clone());

        let system_salt =
            secure_random_array::<32>().map_err(|e| SystemError::Crypto(e.to_string()))?;
        let system_salt_sig = signator
            .sign(&system_salt)
            .map_err(|e| SystemError::Crypto(e.to_string()))?;
        let ping_salt =
            secure_random_array::<8>().map_err(|e| SystemError::Crypto(e.to_string()))?;

        let clock = Clock::new(cfg.clock_obsolescence_interval, cfg.clock_tolerance);

        Ok(Self {
            app,
            bus,
            clock,
            signator,
            verifier: Verifier::new(),
            hash_tree: HashTree::new(),
            stack: StdStack::new(),
            self_net_id,
            local_id: 0,
            peers: BTreeMap::new(),
            cr_out,
            ur_out,
            ur_bus_mq,
            ur_loop_mq,
            cr_loop_mq,
            cr_capture_mq,
            commit_builder: CommitChain::new(),
            last_commit: 0,
            last_grant_proposal: 0,
            join: JoinMgr::new(system_salt, system_salt_sig),
            htm: HtmMgr::new(),
            ping_salt,
            votes_seen: HashMap::new(),
            voted: HashSet::new(),
            evt_serial: 0,
            abnormal: None,
            info_complete_reported: false,
            clock_synced_reported: false,
            cfg,
        })
    }

    /// The application, for callers that embed state there.
    pub fn app(&self) -> &A {
        &self.app
    }

    /// The application, mutably.
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// The local node's id, 0 while anonymous.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The replicated state stack.
    pub fn stack(&self) -> &StdStack {
        &self.stack
    }

    /// The replicated state stack, mutably (for application queries; the
    /// kernel owns its advancement).
    pub fn stack_mut(&mut self) -> &mut StdStack {
        &mut self.stack
    }

    /// The message history tree.
    pub fn hash_tree(&self) -> &HashTree {
        &self.hash_tree
    }

    /// The clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The ids of all known nodes.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// The local opinion of a node, if known.
    pub fn disposition_of(&self, id: NodeId) -> Option<Disposition> {
        self.peers.get(&id).map(|p| p.disposition)
    }

    /// "Connects" this system by making the local node the bootstrap node.
    /// Only meaningful on a freshly created system.
    pub fn bootstrap(&mut self) {
        if self.local_id != 0 {
            return;
        }
        info!(target: "node::system", "bootstrapping a new system");
        let peer = match self.make_peer(
            BOOTSTRAP_NODE_ID,
            self.self_net_id.clone(),
            self.signator.public_key(),
            true,
            Disposition::Positive,
        ) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(target: "node::system", error = %e, "bootstrap failed");
                self.abnormal = Some(SystemStatus::Oom);
                return;
            }
        };
        self.register_peer(peer);
        self.local_id = BOOTSTRAP_NODE_ID;
        self.join.phase = JoinPhase::Connected;
        self.app.acquire_id(BOOTSTRAP_NODE_ID);
    }

    /// Begins the asynchronous join protocol against a member of an
    /// existing system. Progress happens across subsequent advances.
    pub fn connect(&mut self, target: NetworkIdentifierPair) {
        info!(target: "node::system", "connecting to an existing system");
        self.join_connect(target);
    }

    /// Initiates a graceful disconnect: the local node votes DENY on
    /// itself, so the rest of the system retires it cleanly.
    pub fn disconnect(&mut self) {
        if let Some(local) = self.local_id_peer_mut() {
            local.disposition = Disposition::Negative;
        }
    }

    pub(crate) fn local_id_peer_mut(&mut self) -> Option<&mut Peer> {
        if self.local_id == 0 {
            None
        } else {
            self.peers.get_mut(&self.local_id)
        }
    }

    /// Queues an application event produced by the local node. The event
    /// becomes visible in the simulation once it loops back through the
    /// committed pipeline, exactly as it does on every other node.
    pub fn add_event(&mut self, data: Vec<u8>) -> bool {
        if self.local_id == 0 {
            return false;
        }
        let serial = self.evt_serial;
        self.evt_serial = self.evt_serial.wrapping_add(1);
        let result = self
            .cr_out
            .append(&Message::AppEvent(AppEventMsg { serial, data }));
        self.absorb(result);
        self.abnormal.is_none()
    }

    /// Broadcasts an explicit vote for an event identified by its triple.
    pub fn vote_event(&mut self, object: ObjectId, instant: Instant, serial: EventSerial) -> bool {
        let result = self.cr_out.append(&Message::Vote(VoteMsg {
            object,
            instant,
            serial,
        }));
        self.absorb(result);
        self.abnormal.is_none()
    }

    /// Sends point-to-point application data to one node, outside the
    /// simulation.
    pub fn send_unicast(&mut self, to: NodeId, data: Vec<u8>) -> bool {
        let msg = Message::AppUni(synod_types::wire::AppUniMsg { data });
        let result = self
            .peers
            .get_mut(&to)
            .filter(|p| !p.is_local)
            .map(|p| p.rpc_out.append(&msg))
            .unwrap_or(Ok(()));
        self.absorb(result);
        self.abnormal.is_none()
    }

    /// Announces that the local node now answers at a new address. Peers
    /// honour the claim because the announcement carries our signature.
    pub fn commandeer(&mut self, new_addr: NetworkIdentifierPair) -> bool {
        if self.local_id == 0 {
            return false;
        }
        self.self_net_id = new_addr.clone();
        if let Some(local) = self.local_id_peer_mut() {
            local.net_id = new_addr.clone();
        }
        let result = self
            .ur_out
            .append(&Message::Commandeer(synod_types::wire::CommandeerMsg {
                node: self.local_id,
                identifier: new_addr,
            }));
        self.absorb(result);
        self.abnormal.is_none()
    }

    /// Treats an envelope-layer failure the way the protocol treats
    /// resource exhaustion: latch the oom status and stop producing.
    pub(crate) fn absorb(&mut self, result: Result<(), EnvelopeError>) {
        if let Err(e) = result {
            warn!(target: "node::system", error = %e, "outbound path failed");
            self.abnormal = Some(SystemStatus::Oom);
        }
    }

    pub(crate) fn make_peer(
        &mut self,
        id: NodeId,
        net_id: NetworkIdentifierPair,
        pubkey: [u8; PUBKEY_SIZE],
        is_local: bool,
        disposition: Disposition,
    ) -> Result<Peer, SystemError> {
        let rpc_out_enc = HlmsgEncoder::new(
            MessageClass::Rpc,
            Some(self.signator.clone()),
            None,
            self.cfg.mtu,
            0,
        )?;
        let mut rpc_out = Outbox::new(rpc_out_enc);
        let rpc_mq = MessageQueue::new(Destination::Unicast(net_id.clone()));
        let cr_mq = MessageQueue::new(Destination::Unicast(net_id.clone()));
        rpc_out.subscribe(rpc_mq.clone());
        if !is_local {
            // The local node's committed traffic travels the loopback
            // queue instead.
            self.cr_out.subscribe(cr_mq.clone());
        }
        Ok(Peer::new(
            id,
            net_id,
            pubkey,
            is_local,
            disposition,
            rpc_out,
            rpc_mq,
            cr_mq,
        ))
    }

    /// Installs a peer: key registration, transport route, meta node and
    /// the application's node object.
    pub(crate) fn register_peer(&mut self, peer: Peer) -> bool {
        if self.peers.contains_key(&peer.id) {
            return false;
        }
        if let Err(e) = self.verifier.assoc(peer.pubkey, peer.id) {
            warn!(target: "node::system", node = peer.id, error = %e, "key registration failed");
            return false;
        }
        self.bus.create_route(&peer.net_id);
        self.stack.meta_mut().add_node(peer.id);
        self.app.create_node_object(self.stack.context_mut(), peer.id);
        let id = peer.id;
        let mut peer = peer;
        peer.has_route = true;
        self.peers.insert(id, peer);
        debug!(target: "node::system", node = id, "node registered");
        true
    }

    /// Removes a node entirely: key, route, clock source and the
    /// application object's registration. The kernel itself never calls
    /// this mid-life (denied nodes stay on the books so history still
    /// replays); it exists for applications retiring long-dead peers.
    pub fn drop_peer(&mut self, id: NodeId) {
        if let Some(peer) = self.peers.remove(&id) {
            self.verifier.disassoc(&peer.pubkey);
            self.bus.delete_route(&peer.net_id);
            self.clock.remove_source(id);
            self.app.remove_node(id);
        }
    }

    /// Flags a peer as misbehaving; the status-voting manager will start
    /// voting DENY against it.
    pub(crate) fn set_negative(&mut self, id: NodeId, reason: &str) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if peer.disposition != Disposition::Negative {
                warn!(target: "node::system", node = id, reason, "disposition set negative");
                peer.disposition = Disposition::Negative;
                peer.negative_reason = Some(reason.to_string());
            }
        }
    }

    /// Whether a node holds GRANT anywhere in accepted history.
    pub(crate) fn node_has_grant(&self, id: NodeId) -> bool {
        self.stack.meta().grant_instant(id) != NEVER
    }

    /// Whether a node holds DENY anywhere in accepted history.
    pub(crate) fn node_has_deny(&self, id: NodeId) -> bool {
        self.stack.meta().deny_instant(id) != NEVER
    }

    /// Advances the system by `delta` ticks and reports its status.
    pub fn advance(&mut self, delta: u32) -> SystemStatus {
        // 1. Pull every pending datagram off the bus.
        let mut buf = vec![0u8; 65536];
        loop {
            let n = self.bus.recv(&mut buf);
            if n == 0 {
                break;
            }
            let wire = buf[..n].to_vec();
            self.receive(&wire, false);
        }

        // 2. Pump locally produced redistributables from the last frame.
        self.pump_loopback();

        // 3. One clock tick per frame.
        self.clock.advance(delta);
        if self.clock.is_synced() && !self.clock_synced_reported {
            self.clock_synced_reported = true;
            self.app.clock_synced();
        }

        // Stamp the outboxes for everything produced this frame.
        self.router_update();

        // 4. Per-node updates.
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in &ids {
            self.routemgr_update_node(*id);
            self.mod_update_node(*id);
            self.commgr_update_node(*id);
        }

        // 5. System-wide updates.
        self.mod_update();
        self.join_update();
        self.htm_update();

        // 6. Flush the outboxes and run the queues.
        self.router_flush();

        // The commit manager runs after the routers have flushed, so the
        // commit hash covers everything this frame produced.
        self.commgr_update();

        // Deliver this frame's own redistributables to ourselves.
        self.pump_loopback();

        // Catch the replicated stack up with agreed time.
        let target = self.clock.systime;
        if target >= NEVER - 1 {
            if self.abnormal.is_none() {
                self.abnormal = Some(SystemStatus::Overflow);
            }
        } else if target > self.stack.now() {
            let delta = target - self.stack.now();
            self.stack.advance(delta);
        } else {
            self.stack.advance(0);
        }

        self.status()
    }

    /// Computes the externally visible status, most severe first.
    pub fn status(&self) -> SystemStatus {
        if let Some(abnormal) = self.abnormal {
            return abnormal;
        }
        if self.local_id == 0 {
            return SystemStatus::Anonymous;
        }
        if self.node_has_deny(self.local_id) {
            return SystemStatus::Kicked;
        }

        let live = self.stack.meta().live_node_count();
        let negatives = self
            .peers
            .values()
            .filter(|p| p.disposition == Disposition::Negative && !self.node_has_deny(p.id))
            .count() as u32;
        if negatives > 0 && negatives * 2 >= live {
            return SystemStatus::Partitioned;
        }
        SystemStatus::Ok
    }

    fn router_update(&mut self) {
        let now = self.clock.monotime;
        self.absorb_flush_all();
        self.cr_out.set_now(now);
        self.ur_out.set_now(now);
        for peer in self.peers.values_mut() {
            peer.rpc_out.set_now(now);
        }
    }

    fn absorb_flush_all(&mut self) {
        let r = self.cr_out.flush();
        self.absorb(r);
        let r = self.ur_out.flush();
        self.absorb(r);
        let mut failed = false;
        for peer in self.peers.values_mut() {
            failed |= peer.rpc_out.flush().is_err();
        }
        if failed {
            self.abnormal = Some(SystemStatus::Oom);
        }
    }

    fn router_flush(&mut self) {
        self.absorb_flush_all();

        // Broadcast queue for uncommitted traffic.
        self.ur_bus_mq.borrow_mut().update(self.bus.as_mut());

        // Per-peer queues.
        for peer in self.peers.values_mut() {
            if peer.is_local {
                continue;
            }
            peer.rpc_mq.borrow_mut().update(self.bus.as_mut());
            peer.cr_mq.borrow_mut().update(self.bus.as_mut());
        }
    }

    /// Drains the loopback queues and feeds each envelope back through
    /// the receive path, so locally produced messages follow exactly the
    /// code path remote ones do.
    pub(crate) fn pump_loopback(&mut self) {
        // Capture queue first: the commit builder must see every
        // committed envelope exactly once.
        let mut collector = CollectBus::default();
        self.cr_capture_mq.borrow_mut().update(&mut collector);
        for wire in collector.take() {
            self.commgr_capture(&wire);
        }

        let mut collector = CollectBus::default();
        self.cr_loop_mq.borrow_mut().update(&mut collector);
        self.ur_loop_mq.borrow_mut().update(&mut collector);
        for wire in collector.take() {
            self.receive(&wire, true);
        }
    }
}

/// A bus that swallows everything into a list; used to drain loopback
/// queues without touching the real transport.
#[derive(Default)]
pub(crate) struct CollectBus {
    datagrams: Vec<Vec<u8>>,
}

impl CollectBus {
    pub(crate) fn take(self) -> Vec<Vec<u8>> {
        self.datagrams
    }
}

impl MessageBus for CollectBus {
    fn create_route(&mut self, _: &NetworkIdentifierPair) -> bool {
        true
    }
    fn delete_route(&mut self, _: &NetworkIdentifierPair) -> bool {
        true
    }
    fn unicast(&mut self, _: &NetworkIdentifierPair, data: &[u8]) {
        self.datagrams.push(data.to_vec());
    }
    fn triangular_unicast(&mut self, _: &NetworkIdentifierPair, data: &[u8]) {
        self.datagrams.push(data.to_vec());
    }
    fn broadcast(&mut self, data: &[u8]) {
        self.datagrams.push(data.to_vec());
    }
    fn recv(&mut self, _: &mut [u8]) -> usize {
        0
    }
}

impl<A: Application> System<A> {
    /// Configures the clock obsolescence interval.
    pub fn conf_clock_obsolescence_interval(&mut self, v: u32) {
        self.cfg.clock_obsolescence_interval = v;
        self.clock.obsolescence_interval = v;
    }

    /// Configures the clock tolerance.
    pub fn conf_clock_tolerance(&mut self, v: u32) {
        self.cfg.clock_tolerance = v;
        self.clock.tolerance = v;
    }

    /// Configures the commit interval.
    pub fn conf_commit_interval(&mut self, v: u32) {
        self.cfg.commit_interval = v;
    }

    /// Configures the maximum tolerated commit lag.
    pub fn conf_max_commit_lag(&mut self, v: u32) {
        self.cfg.max_commit_lag = v;
    }

    /// Configures the maximum tolerated validation lag.
    pub fn conf_max_validated_lag(&mut self, v: u32) {
        self.cfg.max_validated_lag = v;
    }

    /// Configures the committed-visibility laxness.
    pub fn conf_commit_lag_laxness(&mut self, v: u32) {
        self.cfg.commit_lag_laxness = v;
    }

    /// Configures the self-commit-lag compensation fraction. The
    /// numerator must be below 65536 and the denominator non-zero.
    pub fn conf_self_commit_lag_compensation(&mut self, numerator: u32, denominator: u32) {
        self.cfg
            .set_self_commit_lag_compensation(numerator, denominator);
    }

    /// Configures the maximum objects per hash-tree range answer.
    pub fn conf_ht_range_max(&mut self, v: u32) {
        self.cfg.ht_range_max = v;
    }

    /// Configures the pacing of hash-tree range queries.
    pub fn conf_ht_range_query_interval(&mut self, v: u32) {
        self.cfg.ht_range_query_interval = v;
    }

    /// Configures the snapshot cadence of the hash-tree manager.
    pub fn conf_ht_snapshot_interval(&mut self, v: u32) {
        self.cfg.ht_snapshot_interval = v;
    }

    /// Configures how many hash-tree snapshots are retained.
    pub fn conf_ht_num_snapshots(&mut self, v: u32) {
        self.cfg.ht_num_snapshots = v;
        self.htm.trim_snapshots(v as usize);
    }

    /// Configures the cadence of root comparisons against peers.
    pub fn conf_ht_root_query_interval(&mut self, v: u32) {
        self.cfg.ht_root_query_interval = v;
    }

    /// Configures how far back the compared snapshot is taken.
    pub fn conf_ht_root_query_offset(&mut self, v: u32) {
        self.cfg.ht_root_query_offset = v;
    }

    /// Configures the join-tree query retry interval.
    pub fn conf_join_tree_query_interval(&mut self, v: u32) {
        self.cfg.join_tree_query_interval = v;
    }

    /// Configures the minimum spacing between locally issued Accepts.
    pub fn conf_accept_interval(&mut self, v: u32) {
        self.cfg.accept_interval = v;
    }

    /// Configures the live-node admission limit.
    pub fn conf_max_live_nodes(&mut self, v: u32) {
        self.cfg.max_live_nodes = v;
    }

    /// Configures how often an ungranted local node proposes its GRANT.
    pub fn conf_propose_grant_interval(&mut self, v: u32) {
        self.cfg.propose_grant_interval = v;
    }

    /// Configures the DENY voting window width.
    pub fn conf_vote_deny_interval(&mut self, v: u32) {
        self.cfg.vote_deny_interval = v;
    }

    /// Configures how far in the future chmod votes take effect.
    pub fn conf_vote_chmod_offset(&mut self, v: u32) {
        self.cfg.vote_chmod_offset = v;
    }

    /// Configures the optimistic-event deadline distance.
    pub fn conf_event_deadline_offset(&mut self, v: u32) {
        self.cfg.event_deadline_offset = v;
    }
}
