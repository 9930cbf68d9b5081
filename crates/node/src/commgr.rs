// Path: crates/node/src/commgr.rs
//! The commit manager: producing local commits, matching peers' commits
//! against observed traffic, and maintaining each peer's visibility
//! horizon.

use crate::app::Application;
use crate::join::JoinPhase;
use crate::system::System;
use synod_crypto::hash::sha3;
use synod_types::id::NEVER;
use synod_types::status::Disposition;
use synod_types::wire::{CommitMsg, Message};
use synod_types::{Instant, NodeId};
use tracing::debug;

impl<A: Application> System<A> {
    /// Reveals one locally produced committed envelope to the commit
    /// builder (fed from the capture queue on the committed outbox).
    pub(crate) fn commgr_capture(&mut self, wire: &[u8]) {
        let buf = synod_net::HlmsgBuf::from_wire(wire);
        let instant = buf.as_hlmsg().instant();
        self.commit_builder.reveal(instant, sha3(wire));
    }

    /// The per-frame system half: emit a commit once the interval has
    /// elapsed. Runs after the routers have flushed, so it must emit as a
    /// singleton.
    pub(crate) fn commgr_update(&mut self) {
        if self.local_id == 0 {
            return;
        }
        let monotime = self.clock.monotime;
        if monotime <= self.last_commit
            || monotime - self.last_commit - 1 < self.cfg.commit_interval
        {
            return;
        }

        let hash = self
            .commit_builder
            .create_commit(self.last_commit, monotime);
        let msg = Message::Commit(CommitMsg {
            start: self.last_commit,
            hash,
        });

        // Back-date by one: several frames can share a monotime instant,
        // and the commit must not cover traffic of the instant it is
        // itself sent in.
        self.ur_out.set_now(monotime - 1);
        let result = self.ur_out.singleton(&msg);
        self.absorb(result);
        self.ur_out.set_now(monotime);

        debug!(target: "node::commgr", start = self.last_commit, end = monotime, "commit emitted");
        self.last_commit = monotime;
    }

    /// A peer's commit declaration: the envelope instant closes the range.
    pub(crate) fn commgr_recv_commit(&mut self, origin: NodeId, end: Instant, msg: &CommitMsg) {
        if end < msg.start {
            self.set_negative(origin, "commit range ends before it starts");
            return;
        }
        if let Some(peer) = self.peers.get_mut(&origin) {
            peer.comchain.commit(msg.start, end + 1, msg.hash);
        }
    }

    /// The per-frame node half: refresh the visibility threshold and
    /// police commit/validation lag.
    pub(crate) fn commgr_update_node(&mut self, id: NodeId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.is_local {
            return;
        }

        let horizon = self.visibility_horizon(id);
        if let Some(peer) = self.peers.get(&id) {
            peer.cr_mq.borrow_mut().set_threshold(horizon);
        }

        // Lag is only enforced once the local node is a full participant;
        // before that, the gap is probably our own missing history.
        if self.join.phase != JoinPhase::Connected {
            return;
        }

        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.comchain.is_dead() {
            self.set_negative(id, "commit chain diverged");
            return;
        }

        if !self.node_has_grant(id) {
            return;
        }
        let committed = peer.comchain.committed_frontier();
        let validated = peer.comchain.validated_frontier();
        let systime = self.clock.systime;

        if committed < systime && systime - committed > self.cfg.max_commit_lag {
            self.app
                .awaiting_stability(id, systime, committed, validated);
            self.set_negative(id, "commit lag exceeded");
        } else if validated < systime && systime - validated > self.cfg.max_validated_lag {
            self.app
                .awaiting_stability(id, systime, committed, validated);
            self.set_negative(id, "validation lag exceeded");
        }
    }

    /// How far into committed history a peer is allowed to see.
    ///
    /// The local node sees everything; a denied node sees nothing; anyone
    /// else sees up to their committed frontier plus the configured
    /// laxness plus a compensation share of the local network's own
    /// latency (a quarter of the minimum round trip to any live peer).
    pub(crate) fn visibility_horizon(&self, id: NodeId) -> Instant {
        if id == self.local_id {
            return NEVER;
        }
        if self.node_has_deny(id) {
            return 0;
        }
        let Some(peer) = self.peers.get(&id) else {
            return 0;
        };

        let mut threshold = peer
            .comchain
            .committed_frontier()
            .saturating_add(self.cfg.commit_lag_laxness);

        let min_latency = self
            .peers
            .values()
            .filter(|p| !p.is_local && p.disposition == Disposition::Positive)
            .map(|p| p.latency)
            .min()
            .unwrap_or(0);

        // Reduce round-trip to half-one-way, then scale by the
        // compensation fraction.
        let frac =
            ((min_latency as u64 / 4) * self.cfg.self_commit_lag_compensation_16 as u64) >> 16;
        threshold.saturating_add(frac as u32)
    }
}
