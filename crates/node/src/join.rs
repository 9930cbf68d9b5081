// Path: crates/node/src/join.rs
//! The join protocol: bootstrap discovery, signed admission, id
//! derivation and join-tree history recovery.
//!
//! Joining runs in phases. The joiner asks any member for the network
//! info (salt, bootstrap key), then repeats a signed join request until a
//! member broadcasts an Accept quoting the request byte-for-byte. Every
//! recipient of a valid Accept derives the same node id from the salt and
//! the joiner's key, so the id needs no coordination. The joiner then
//! walks the tree of prior Accepts, feeding each recovered Accept back
//! through the ordinary receive pipeline until the whole membership
//! history is reconstructed.

use crate::app::Application;
use crate::dispatch::EnvelopeInfo;
use crate::system::System;
use std::cell::RefCell;
use std::rc::Rc;
use synod_crypto::hash::HashAccumulator;
use synod_net::envelope::{HlmsgEncoder, JOINACCEPT_MAX, MTU_MIN};
use synod_net::{Destination, MessageQueue, Outbox, SerialCell};
use synod_types::status::{Disposition, SystemStatus};
use synod_types::wire::{
    GetNetworkInfoMsg, JoinAcceptMsg, JoinRequestMsg, JoinTreeEntryMsg, JoinTreeMsg, Message,
    MessageClass, NetworkIdentifierPair, NetworkInfoMsg, SALT_SIZE, SIGNATURE_SIZE,
};
use synod_types::{Instant, NodeId};
use tracing::{debug, info, warn};

/// Where the local node stands in the join protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum JoinPhase {
    /// Neither bootstrapped nor connecting.
    Idle,
    /// Repeating GetNetworkInfo / JoinRequest at the connect target.
    RequestCxn,
    /// Accepted; recovering history via join-tree queries.
    WalkingJoinTree,
    /// History recovered; waiting for the GRANT vote to carry.
    RequestingGrant,
    /// A full participant (or the bootstrap node).
    Connected,
}

/// Join-protocol state.
pub(crate) struct JoinMgr {
    pub phase: JoinPhase,
    pub system_salt: [u8; SALT_SIZE],
    pub system_salt_sig: [u8; SIGNATURE_SIZE],
    pub connect_target: Option<NetworkIdentifierPair>,
    pub connect_out: Option<Outbox>,
    pub connect_mq: Option<Rc<RefCell<MessageQueue>>>,
    /// The serial cell shared by the connect outbox and the normalised
    /// re-encodings; reset to zero before every signed join request so
    /// the signable bytes are reproducible on the far side.
    pub minimal_serno: SerialCell,
    pub has_received_network_info: bool,
    pub last_join_tree_query: Instant,
    pub last_accept: Instant,
}

impl JoinMgr {
    pub(crate) fn new(system_salt: [u8; SALT_SIZE], system_salt_sig: [u8; SIGNATURE_SIZE]) -> Self {
        Self {
            phase: JoinPhase::Idle,
            system_salt,
            system_salt_sig,
            connect_target: None,
            connect_out: None,
            connect_mq: None,
            minimal_serno: SerialCell::default(),
            has_received_network_info: false,
            last_join_tree_query: 0,
            last_accept: 0,
        }
    }
}

impl<A: Application> System<A> {
    pub(crate) fn join_connect(&mut self, target: NetworkIdentifierPair) {
        self.join.phase = JoinPhase::RequestCxn;
        self.join.connect_target = Some(target.clone());
        self.bus.create_route(&target);

        let encoder = HlmsgEncoder::new(
            MessageClass::Rpc,
            Some(self.signator.clone()),
            Some(self.join.minimal_serno.clone()),
            MTU_MIN,
            0,
        );
        match encoder {
            Ok(encoder) => {
                let mut out = Outbox::new(encoder);
                let mq = MessageQueue::new(Destination::Unicast(target));
                // First contact may need the relay until a reply proves
                // the direct path works.
                mq.borrow_mut().set_triangular(true);
                out.subscribe(mq.clone());
                self.join.connect_out = Some(out);
                self.join.connect_mq = Some(mq);
            }
            Err(e) => {
                warn!(target: "node::join", error = %e, "connect outbox failed");
                self.abnormal = Some(SystemStatus::Oom);
            }
        }
    }

    /// Builds the normalised single-segment encoding of a join request at
    /// a fixed instant and serial zero; the signable range of this
    /// encoding is what join-request signatures cover.
    fn normalised_join_request(
        &mut self,
        request: &JoinRequestMsg,
        instant: Instant,
    ) -> Option<Vec<u8>> {
        let mut encoder = HlmsgEncoder::new(
            MessageClass::Rpc,
            Some(self.signator.clone()),
            Some(SerialCell::default()),
            MTU_MIN,
            0,
        )
        .ok()?;
        encoder.set_now(instant);
        let buf = encoder
            .singleton(&Message::JoinRequest(request.clone()))
            .ok()?;
        Some(buf.as_hlmsg().signable().to_vec())
    }

    fn verify_join_request_signature(
        &mut self,
        request: &JoinRequestMsg,
        signature: &[u8; SIGNATURE_SIZE],
        instant: Instant,
    ) -> bool {
        let Some(signable) = self.normalised_join_request(request, instant) else {
            return false;
        };
        self.verifier
            .verify_once(&request.public_key, signature, &signable)
    }

    fn is_valid_join_request(
        &mut self,
        request: &JoinRequestMsg,
        signature: &[u8; SIGNATURE_SIZE],
        instant: Instant,
    ) -> bool {
        let Some(bootstrap_key) = self
            .peers
            .get(&synod_types::id::BOOTSTRAP_NODE_ID)
            .map(|p| p.pubkey)
        else {
            return false;
        };
        // The network address must be acceptable, the key must not be the
        // bootstrap key, the signature must verify against the normalised
        // encoding, and any application authentication must pass.
        if !self.app.permit_net_id(&request.identifier) {
            return false;
        }
        if request.public_key == bootstrap_key {
            return false;
        }
        if !self.verify_join_request_signature(request, signature, instant) {
            return false;
        }
        self.app.is_auth_valid(request)
    }

    fn is_reserved_id(&self, id: NodeId) -> bool {
        id < 2 || !self.app.permit_object_id(id)
    }

    /// The id every honest recipient derives for an accepted key.
    fn derive_node_id(&self, public_key: &[u8; 32]) -> NodeId {
        let mut acc = HashAccumulator::new();
        acc.absorb(&self.join.system_salt);
        acc.absorb(public_key);
        let mut id = acc.finish_u32();
        while self.is_reserved_id(id) {
            id = id.wrapping_add(1);
        }
        id
    }

    fn live_node_count(&self) -> u32 {
        self.stack.meta().live_node_count()
    }

    /// The per-frame join work: retransmit the current handshake step, or
    /// drive the join-tree walk to completion.
    pub(crate) fn join_update(&mut self) {
        if self.join.connect_out.is_none() {
            return;
        }
        let monotime = self.clock.monotime;
        if let Some(out) = self.join.connect_out.as_mut() {
            if out.flush().is_err() {
                self.abnormal = Some(SystemStatus::Oom);
                return;
            }
            out.set_now(monotime);
        }

        if !self.join.has_received_network_info {
            // Retransmit every frame: requests are idempotent and cheap.
            let msg = Message::GetNetworkInfo(GetNetworkInfoMsg {
                retaddr: self.self_net_id.clone(),
            });
            self.join.minimal_serno.set(0);
            if let Some(out) = self.join.connect_out.as_mut() {
                let r = out.singleton(&msg);
                self.absorb(r);
            }
        } else if self.local_id == 0 {
            let mut request = JoinRequestMsg {
                public_key: self.signator.public_key(),
                identifier: self.self_net_id.clone(),
                auth: None,
            };
            request.auth = self.app.gen_auth(&request);
            // Serial zero, so the far side can re-derive the signable
            // bytes from the quoted request alone.
            self.join.minimal_serno.set(0);
            if let Some(out) = self.join.connect_out.as_mut() {
                let r = out.singleton(&Message::JoinRequest(request));
                self.absorb(r);
            }
        } else {
            self.join_walk_update();
        }

        if let Some(out) = self.join.connect_out.as_mut() {
            if out.flush().is_err() {
                self.abnormal = Some(SystemStatus::Oom);
            }
        }
        if let Some(mq) = self.join.connect_mq.clone() {
            mq.borrow_mut().update(self.bus.as_mut());
        }
    }

    fn join_walk_update(&mut self) {
        let pending: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| p.curr_join_tree_query.is_some())
            .map(|p| p.id)
            .collect();

        if pending.is_empty() {
            // Connection phase complete: tear the handshake resources
            // down and start campaigning for GRANT.
            info!(target: "node::join", "join tree traversal complete");
            self.join.phase = JoinPhase::RequestingGrant;
            self.app.join_tree_traversed();

            if let Some(target) = self.join.connect_target.take() {
                let target_id = self
                    .peers
                    .values()
                    .find(|p| p.net_id == target)
                    .map(|p| p.id);
                if let Some(id) = target_id {
                    if let Some(peer) = self.peers.get_mut(&id) {
                        if peer.disposition == Disposition::Neutral {
                            peer.disposition = Disposition::Positive;
                        }
                    }
                }
            }
            self.join.connect_mq = None;
            self.join.connect_out = None;
            return;
        }

        // Re-issue the outstanding query for every unfinished branch on a
        // timer; answers re-issue immediately, this is just loss repair.
        if self.clock.ticks - self.join.last_join_tree_query
            > self.cfg.join_tree_query_interval
        {
            self.join.last_join_tree_query = self.clock.ticks;
            for id in pending {
                self.join_query_next(id);
            }
        }
    }

    fn join_query_next(&mut self, against: NodeId) {
        let Some(offset) = self
            .peers
            .get(&against)
            .and_then(|p| p.curr_join_tree_query)
        else {
            return;
        };
        let msg = Message::JoinTree(JoinTreeMsg {
            node: against,
            offset,
        });
        if let Some(out) = self.join.connect_out.as_mut() {
            let r = out.append(&msg);
            self.absorb(r);
        }
    }

    /// A prospective joiner asked who we are: answer with the salt and
    /// the bootstrap identity, straight over the bus.
    pub(crate) fn join_recv_get_network_info(&mut self, msg: &GetNetworkInfoMsg) {
        let Some(bootstrap) = self.peers.get(&synod_types::id::BOOTSTRAP_NODE_ID) else {
            return;
        };
        if !self.app.permit_net_id(&msg.retaddr) {
            return;
        }

        let reply = Message::NetworkInfo(NetworkInfoMsg {
            salt: self.join.system_salt,
            salt_sig: self.join.system_salt_sig,
            bootstrap_key: bootstrap.pubkey,
            bootstrap_id: bootstrap.net_id.clone(),
        });

        let encoder = HlmsgEncoder::new(
            MessageClass::Rpc,
            Some(self.signator.clone()),
            None,
            MTU_MIN,
            0,
        );
        let Ok(mut encoder) = encoder else {
            return;
        };
        encoder.set_now(self.clock.monotime);
        let Ok(buf) = encoder.singleton(&reply) else {
            return;
        };
        self.bus.unicast(&msg.retaddr, buf.wire_bytes());
    }

    /// The answer to our GetNetworkInfo: adopt the salt once its
    /// signature checks out against the claimed bootstrap key.
    pub(crate) fn join_recv_network_info(&mut self, msg: &NetworkInfoMsg) {
        if self.join.has_received_network_info || self.join.connect_out.is_none() {
            return;
        }
        if !self
            .verifier
            .verify_once(&msg.bootstrap_key, &msg.salt_sig, &msg.salt)
        {
            return;
        }

        self.join.system_salt = msg.salt;
        self.join.system_salt_sig = msg.salt_sig;

        let bootstrap = self.make_peer(
            synod_types::id::BOOTSTRAP_NODE_ID,
            msg.bootstrap_id.clone(),
            msg.bootstrap_key,
            false,
            Disposition::Positive,
        );
        match bootstrap {
            Ok(peer) => {
                self.register_peer(peer);
            }
            Err(e) => {
                warn!(target: "node::join", error = %e, "bootstrap peer failed");
                self.abnormal = Some(SystemStatus::Oom);
                return;
            }
        }

        self.join.has_received_network_info = true;
        debug!(target: "node::join", "network info adopted");
        // A reply got through, so the direct path works; stop relaying.
        if let Some(mq) = self.join.connect_mq.as_ref() {
            mq.borrow_mut().set_triangular(false);
        }
    }

    /// A join request reached us as a member: validate, rate-limit, and
    /// broadcast the Accept. Node creation happens when the Accept comes
    /// back around, on every node alike.
    pub(crate) fn join_recv_join_request(
        &mut self,
        origin: NodeId,
        msg: &JoinRequestMsg,
        env: &EnvelopeInfo,
    ) {
        if !self.join.has_received_network_info && self.join.phase != JoinPhase::Connected {
            return;
        }
        if self.local_id == 0 || !self.peers.contains_key(&synod_types::id::BOOTSTRAP_NODE_ID) {
            return;
        }
        // The bootstrap node never requests to join; nothing to remind it
        // of either.
        if origin == synod_types::id::BOOTSTRAP_NODE_ID {
            return;
        }

        if origin == 0 {
            if !self.is_valid_join_request(msg, &env.signature, env.instant) {
                return;
            }
            // Admission rate limit and population cap.
            if self.clock.ticks.wrapping_sub(self.join.last_accept) < self.cfg.accept_interval
                && self.join.last_accept != 0
            {
                return;
            }
            if self.live_node_count() >= self.cfg.max_live_nodes {
                return;
            }
            self.join.last_accept = self.clock.ticks;

            let accept = Message::JoinAccept(JoinAcceptMsg {
                instant: env.instant,
                signature: env.signature,
                request: msg.clone(),
            });
            let result = self.ur_out.singleton(&accept);
            self.absorb(result);
            info!(target: "node::join", "join request accepted");
        } else {
            // Known node repeating its request: remind it of its Accept.
            let data = self
                .peers
                .get(&origin)
                .map(|p| (p.net_id.clone(), p.join_tree_data.clone()));
            if let Some((netid, data)) = data {
                if !data.is_empty() {
                    self.bus.unicast(&netid, &data);
                }
            }
        }
    }

    /// An Accept: derive the id and admit the node, or, if it names our
    /// own key, become that node.
    pub(crate) fn join_recv_join_accept(
        &mut self,
        origin: NodeId,
        msg: &JoinAcceptMsg,
        env: &EnvelopeInfo,
    ) {
        if !self.is_valid_join_request(&msg.request, &msg.signature, msg.instant) {
            // Unlike a raw join request, a bad Accept is a protocol
            // violation by whoever redistributed it.
            if origin != 0 {
                self.set_negative(origin, "redistributed an invalid accept");
            }
            return;
        }

        let id = self.derive_node_id(&msg.request.public_key);

        if self.local_id == 0 && msg.request.public_key == self.signator.public_key() {
            // This is us.
            if self.peers.contains_key(&id) {
                warn!(target: "node::join", id, "derived id collides; staying anonymous");
                return;
            }
            let peer = match self.make_peer(
                id,
                self.self_net_id.clone(),
                msg.request.public_key,
                true,
                Disposition::Positive,
            ) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(target: "node::join", error = %e, "local peer failed");
                    self.abnormal = Some(SystemStatus::Oom);
                    return;
                }
            };
            self.register_peer(peer);
            self.local_id = id;
            self.app.acquire_id(id);
            if origin != 0 {
                self.join_record_in_tree(origin, id, &env.wire);
            }
            info!(target: "node::join", id, "acquired node id, walking join tree");
            self.join.phase = JoinPhase::WalkingJoinTree;
            self.join.last_join_tree_query = self.clock.ticks;
            let branches: Vec<NodeId> = self.peers.keys().copied().collect();
            for branch in branches {
                self.join_query_next(branch);
            }
            return;
        }

        // Only members can introduce other members.
        if origin == 0 {
            return;
        }

        if let Some(existing) = self.peers.get(&id) {
            if existing.pubkey == msg.request.public_key {
                if existing.join_tree_data.is_empty() {
                    self.join_record_in_tree(origin, id, &env.wire);
                }
                return;
            }
            // Same id, different key: a forged accept lost the race.
            self.set_negative(origin, "accept collides with an existing node");
            return;
        }

        // Nodes we accepted ourselves start positive; others stay
        // neutral until someone vouches a route (accepts often describe
        // nodes long gone).
        let disposition = if origin == self.local_id {
            Disposition::Positive
        } else {
            Disposition::Neutral
        };
        let peer = match self.make_peer(
            id,
            msg.request.identifier.clone(),
            msg.request.public_key,
            false,
            disposition,
        ) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(target: "node::join", error = %e, "new peer failed");
                self.abnormal = Some(SystemStatus::Oom);
                return;
            }
        };
        let netid = peer.net_id.clone();
        if self.register_peer(peer) {
            self.app.discover_node(&netid, id);
            self.join_record_in_tree(origin, id, &env.wire);
            // Loop the Accept back to the new node: it both informs the
            // joiner and punches a hole toward it.
            self.bus.unicast(&netid, &env.wire);
            debug!(target: "node::join", id, "node admitted from accept");
        }
    }

    fn join_record_in_tree(&mut self, issuer: NodeId, new_node: NodeId, wire: &[u8]) {
        if wire.len() > JOINACCEPT_MAX {
            warn!(target: "node::join", len = wire.len(), "accept too large for the join tree");
            return;
        }
        if let Some(peer) = self.peers.get_mut(&new_node) {
            peer.join_tree_data = wire.to_vec();
        }
        if let Some(issuer) = self.peers.get_mut(&issuer) {
            if !issuer.join_tree_children.contains(&new_node) {
                issuer.join_tree_children.push(new_node);
            }
        }

        // Vouch for the recorded Accept, so nodes that learned of the
        // newcomer second-hand gain confidence in it.
        if self.local_id != 0 {
            let endorsement =
                Message::Endorsement(synod_types::wire::EndorsementMsg {
                    node: new_node,
                    accept_hash: synod_crypto::sha3(wire),
                });
            let result = self.ur_out.append(&endorsement);
            self.absorb(result);
        }
    }

    /// A walker asked for one child of a node's join-tree entry.
    pub(crate) fn join_recv_join_tree(&mut self, origin: NodeId, msg: &JoinTreeMsg) {
        let (nkeys, data) = match self.peers.get(&msg.node) {
            Some(against) => {
                let child_data = against
                    .join_tree_children
                    .get(msg.offset as usize)
                    .and_then(|child| self.peers.get(child))
                    .map(|child| child.join_tree_data.clone())
                    .filter(|d| !d.is_empty());
                (against.join_tree_children.len() as u32, child_data)
            }
            None => (0, None),
        };

        let reply = Message::JoinTreeEntry(JoinTreeEntryMsg {
            node: msg.node,
            offset: msg.offset,
            nkeys,
            data,
        });
        let result = self
            .peers
            .get_mut(&origin)
            .map(|p| p.rpc_out.append(&reply))
            .unwrap_or(Ok(()));
        self.absorb(result);
    }

    /// One recovered Accept (or an end-of-list marker). Entries are
    /// accepted even from unknown senders: the Accepts they carry form a
    /// chain of signatures rooted at the bootstrap key, which is all the
    /// authenticity the walk needs.
    pub(crate) fn join_recv_join_tree_entry(&mut self, msg: &JoinTreeEntryMsg) {
        if let Some(data) = msg.data.as_ref() {
            if data.len() <= JOINACCEPT_MAX {
                // Feed the recovered Accept through the ordinary
                // pipeline; duplicates fall out in the hash tree.
                self.receive(data, false);
            }
        }

        let Some(against) = self.peers.get_mut(&msg.node) else {
            return;
        };
        if against.curr_join_tree_query != Some(msg.offset) {
            return;
        }
        if msg.data.is_some() {
            against.curr_join_tree_query = Some(msg.offset + 1);
            self.join_query_next(msg.node);
        } else {
            against.curr_join_tree_query = None;
        }
    }

    /// An endorsement: someone vouches they hold this node's Accept.
    pub(crate) fn join_recv_endorsement(
        &mut self,
        _origin: NodeId,
        msg: &synod_types::wire::EndorsementMsg,
    ) {
        if let Some(peer) = self.peers.get_mut(&msg.node) {
            if peer.disposition == Disposition::Neutral {
                peer.disposition = Disposition::Positive;
            }
        }
    }
}
