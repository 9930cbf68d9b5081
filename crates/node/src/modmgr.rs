// Path: crates/node/src/modmgr.rs
//! Status voting: proposing the local GRANT, voting DENY on misbehaving
//! peers, and echoing chmods the local node agrees with.

use crate::app::Application;
use crate::join::JoinPhase;
use crate::system::System;
use synod_types::status::{Disposition, StatusBit};
use synod_types::wire::{ChmodMsg, Message};
use synod_types::{Instant, NodeId};
use tracing::debug;

impl<A: Application> System<A> {
    /// The system half: propose our own GRANT while we lack it.
    pub(crate) fn mod_update(&mut self) {
        if self.local_id == 0 {
            return;
        }

        if self.node_has_grant(self.local_id) {
            if self.join.phase == JoinPhase::RequestingGrant {
                self.join.phase = JoinPhase::Connected;
                self.app.gained_grant();
            }
            return;
        }

        // The first proposal goes out as soon as the node can speak;
        // the interval only paces the retries.
        if self.last_grant_proposal == 0
            || self.clock.ticks - self.last_grant_proposal >= self.cfg.propose_grant_interval
        {
            let msg = Message::Chmod(ChmodMsg {
                node: self.local_id,
                effective: self.cr_out.now().saturating_add(self.cfg.vote_chmod_offset),
                bit: StatusBit::Grant,
            });
            let result = self.cr_out.append(&msg);
            self.absorb(result);
            self.last_grant_proposal = self.clock.ticks;
            debug!(target: "node::mod", "proposed own grant");
        }
    }

    /// The per-node half: vote DENY on negative peers, once per voting
    /// window. The local node is deliberately included; voting DENY on
    /// oneself is how graceful disconnect works.
    pub(crate) fn mod_update_node(&mut self, id: NodeId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.disposition != Disposition::Negative || self.node_has_deny(id) {
            return;
        }

        // Align on the shared clock so every voter lands on the same
        // effective instant and the votes pool into one chmod event.
        let interval = self.cfg.vote_deny_interval.max(1);
        let vote_at =
            self.clock.systime / interval * interval + self.cfg.vote_chmod_offset;
        if vote_at <= peer.last_deny_vote {
            return;
        }

        let msg = ChmodMsg {
            node: id,
            effective: vote_at,
            bit: StatusBit::Deny,
        };
        // A joiner's monotime can trail systime; if the stamp would fall
        // outside the window, wait for the next boundary.
        if !self.chmod_permissible(self.cr_out.now(), &msg) {
            return;
        }
        let result = self.cr_out.append(&Message::Chmod(msg));
        self.absorb(result);
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_deny_vote = vote_at;
        }
        debug!(target: "node::mod", node = id, effective = vote_at, "voted deny");
    }

    fn chmod_permissible(&self, envelope_instant: Instant, msg: &ChmodMsg) -> bool {
        envelope_instant <= msg.effective
            && msg.effective - envelope_instant <= self.cfg.vote_chmod_offset
    }

    /// A chmod vote from `origin`. The vote lands in the meta-transactor;
    /// when the local node agrees and has not yet voted itself, the chmod
    /// is echoed, and the echo is immediately fed back through this
    /// handler so a second identical vote in the same frame cannot
    /// produce a duplicate outbound message.
    pub(crate) fn mod_recv_chmod(&mut self, origin: NodeId, envelope_instant: Instant, msg: &ChmodMsg) {
        if !self.chmod_permissible(envelope_instant, msg) {
            // Out of bounds: ignore the request and exact revenge.
            self.set_negative(origin, "sent non-permissible chmod");
            return;
        }
        if !self.stack.meta().has_node(msg.node) || !self.stack.meta().has_node(origin) {
            return;
        }

        self.stack
            .meta_mut()
            .chmod(msg.node, origin, msg.bit, msg.effective);

        let local = self.local_id;
        if local == 0
            || self
                .stack
                .meta()
                .has_chmod(msg.node, local, msg.bit, msg.effective)
        {
            return;
        }

        let target_disposition = self
            .peers
            .get(&msg.node)
            .map(|p| p.disposition)
            .unwrap_or(Disposition::Neutral);
        let agree = match msg.bit {
            StatusBit::Deny => {
                target_disposition == Disposition::Negative && !self.node_has_deny(msg.node)
            }
            StatusBit::Grant => {
                target_disposition == Disposition::Positive && !self.node_has_grant(msg.node)
            }
        };
        if !agree {
            return;
        }

        // Echo only if the rebroadcast itself will still satisfy the
        // window at the instant it is stamped with.
        if self.chmod_permissible(self.cr_out.now(), msg) {
            let echo = Message::Chmod(msg.clone());
            let result = self.cr_out.append(&echo);
            self.absorb(result);
            let now = self.cr_out.now();
            self.mod_recv_chmod(local, now, msg);
        }
    }
}
