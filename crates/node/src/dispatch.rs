// Path: crates/node/src/dispatch.rs
//! The inbound dispatcher: envelope validation, origin identification,
//! class processing and per-message fan-out.

use crate::app::Application;
use crate::system::System;
use synod_crypto::hash::sha3;
use synod_storage::hash_tree::AddResult;
use synod_types::wire::{AppEventMsg, Message, MessageClass, VoteMsg};
use synod_types::{EventKey, Instant, NodeId};
use tracing::{debug, trace};

/// Envelope facts handlers need after the buffer itself is gone.
pub(crate) struct EnvelopeInfo {
    pub instant: Instant,
    pub signature: [u8; synod_types::wire::SIGNATURE_SIZE],
    pub wire: Vec<u8>,
}

impl<A: Application> System<A> {
    /// Processes one datagram as a high-level message.
    ///
    /// `from_loopback` marks envelopes the local node produced itself;
    /// they skip the origin-is-self drop (which only guards against
    /// echoes arriving from the real transport).
    pub(crate) fn receive(&mut self, wire: &[u8], from_loopback: bool) {
        let buf = synod_net::HlmsgBuf::from_wire(wire);
        let msg = buf.as_hlmsg();

        // Malformed input is silently discarded. An attacker gains
        // nothing by signing garbage correctly, so no blame is assigned.
        if !msg.is_valid() {
            return;
        }

        let origin = self
            .verifier
            .verify(msg.pubkey_hint(), &msg.signature(), msg.signable());
        if !from_loopback && origin != 0 && origin == self.local_id {
            return;
        }

        // Known origins contribute clock samples.
        if origin != 0 && origin != self.local_id {
            if let Some(peer) = self.peers.get(&origin) {
                let latency = peer.latency / 2;
                self.clock.sample(origin, msg.instant(), latency);
            }
        }

        let instant = msg.instant();
        let class = msg.class();
        match class {
            MessageClass::Committed => {
                let hash = sha3(wire);
                if let AddResult::AlreadyPresent(_) = self.hash_tree.add(wire, instant) {
                    trace!(target: "node::dispatch", "duplicate committed envelope");
                    return;
                }
                if origin != 0 && origin != self.local_id {
                    if let Some(peer) = self.peers.get_mut(&origin) {
                        peer.comchain.reveal(instant, hash);
                    }
                }
            }
            MessageClass::Uncommitted => {
                if let AddResult::AlreadyPresent(_) = self.hash_tree.add(wire, instant) {
                    trace!(target: "node::dispatch", "duplicate uncommitted envelope");
                    return;
                }
            }
            MessageClass::Rpc => {}
        }

        let info = EnvelopeInfo {
            instant,
            signature: msg.signature(),
            wire: wire.to_vec(),
        };
        let messages: Vec<Message> = msg.messages().collect();
        drop(buf);
        for message in messages {
            self.dispatch_one(origin, &info, message);
        }
    }

    fn dispatch_one(&mut self, origin: NodeId, env: &EnvelopeInfo, message: Message) {
        match message {
            Message::Ping(m) => {
                if origin != 0 {
                    self.routemgr_recv_ping(origin, &m);
                }
            }
            Message::Pong(m) => {
                if origin != 0 {
                    self.routemgr_recv_pong(origin, &m);
                }
            }
            Message::GetNetworkInfo(m) => self.join_recv_get_network_info(&m),
            Message::NetworkInfo(m) => self.join_recv_network_info(&m),
            Message::JoinRequest(m) => self.join_recv_join_request(origin, &m, env),
            Message::JoinAccept(m) => self.join_recv_join_accept(origin, &m, env),
            Message::JoinTree(m) => {
                if origin != 0 {
                    self.join_recv_join_tree(origin, &m);
                }
            }
            Message::JoinTreeEntry(m) => self.join_recv_join_tree_entry(&m),
            Message::Endorsement(m) => {
                if origin != 0 {
                    self.join_recv_endorsement(origin, &m);
                }
            }
            Message::Commandeer(m) => {
                if origin != 0 {
                    self.routemgr_recv_commandeer(origin, &m);
                }
            }
            Message::Chmod(m) => {
                if origin != 0 {
                    self.mod_recv_chmod(origin, env.instant, &m);
                }
            }
            Message::Vote(m) => {
                if origin != 0 {
                    self.recv_vote(origin, &m);
                }
            }
            Message::AppEvent(m) => {
                if origin != 0 {
                    self.recv_app_event(origin, env.instant, &m);
                }
            }
            Message::AppUni(m) => {
                if origin != 0 {
                    self.app.receive_unicast(origin, &m.data);
                }
            }
            Message::Commit(m) => {
                if origin != 0 {
                    self.commgr_recv_commit(origin, env.instant, &m);
                }
            }
            Message::Route(m) => self.routemgr_recv_route(&m),
            Message::HtLs(m) => {
                if origin != 0 {
                    self.htm_recv_ls(origin, &m);
                }
            }
            Message::HtDir(m) => {
                if origin != 0 {
                    self.htm_recv_dir(origin, &m);
                }
            }
            Message::HtRead(m) => {
                if origin != 0 {
                    self.htm_recv_read(origin, &m);
                }
            }
            Message::HtRange(m) => {
                if origin != 0 {
                    self.htm_recv_range(origin, &m);
                }
            }
            Message::Received(m) => {
                if origin != 0 {
                    self.htm_recv_received(origin, &m);
                }
            }
        }
    }

    /// An application event from `origin`: wrap it for voting, gate it by
    /// the origin's status, arm its optimism deadline, and vote for it if
    /// it arrived inside the voting window.
    fn recv_app_event(&mut self, origin: NodeId, instant: Instant, msg: &AppEventMsg) {
        if !self.stack.meta().has_node(origin) {
            return;
        }

        let key = EventKey::new(instant, origin, msg.serial);
        let Some(delegate) = self.app.decode_event(instant, origin, msg.serial, &msg.data) else {
            self.set_negative(origin, "sent undecodable application event");
            return;
        };
        if delegate.key() != key {
            self.set_negative(origin, "decoded event key mismatch");
            return;
        }

        let wrapper = self.stack.transactor_mut().put_event(delegate, true);
        if !self.stack.meta_mut().add_event(origin, wrapper) {
            // Already known through another envelope; nothing more to do.
            return;
        }

        let deadline_at = instant.saturating_add(self.cfg.event_deadline_offset);
        let deadline = self.stack.transactor_mut().deadline(key, deadline_at);
        self.stack.transactor_mut().add_master_event(deadline);
        debug!(target: "node::dispatch", node = origin, instant, serial = msg.serial, "application event admitted");

        // Vote for timely events, once.
        if self.local_id != 0
            && self.clock.systime <= deadline_at
            && !self.voted.contains(&key)
        {
            self.voted.insert(key);
            let result = self.cr_out.append(&Message::Vote(VoteMsg {
                object: origin,
                instant,
                serial: msg.serial,
            }));
            self.absorb(result);
        }
    }

    /// A vote from `origin` for the event identified by the message.
    /// Repeat votes from the same voter are dropped before they can
    /// inflate the count.
    fn recv_vote(&mut self, origin: NodeId, msg: &VoteMsg) {
        if !self.stack.meta().has_node(origin) {
            return;
        }
        let target = EventKey::new(msg.instant, msg.object, msg.serial);
        let seen = self.votes_seen.entry(target).or_default();
        if !seen.insert(origin) {
            return;
        }

        let vote = self.stack.transactor_mut().votefor(target);
        self.stack.meta_mut().add_event(origin, vote);
    }
}
