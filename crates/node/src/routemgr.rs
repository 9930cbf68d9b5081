// Path: crates/node/src/routemgr.rs
//! Route liveness: announcements, pings and latency estimation.

use crate::app::Application;
use crate::system::System;
use synod_crypto::hash::HashAccumulator;
use synod_types::status::Disposition;
use synod_types::wire::{CommandeerMsg, Message, PingMsg, PongMsg, RouteMsg};
use synod_types::NodeId;
use tracing::{debug, trace};

impl<A: Application> System<A> {
    /// The per-node frame work: announce routes and keep pings flowing.
    pub(crate) fn routemgr_update_node(&mut self, id: NodeId) {
        let ticks = self.clock.ticks;
        let has_grant = self.node_has_grant(id);

        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.is_local {
            return;
        }

        // Routes for ungranted peers are refreshed more aggressively:
        // they are the ones still trying to become reachable everywhere.
        let announce_interval = if has_grant {
            self.cfg.granted_route_interval
        } else {
            self.cfg.ungranted_route_interval
        };
        let mut announce = None;
        if peer.has_route && ticks - peer.last_route_announce >= announce_interval {
            peer.last_route_announce = ticks;
            announce = Some(Message::Route(RouteMsg { node: id }));
        }

        // Ping on schedule; an unanswered ping beyond the silence bound
        // drops the route and frees the slot for the next attempt.
        let mut ping = None;
        if peer.in_flight_ping.is_none() {
            if ticks - peer.last_ping >= self.cfg.ping_interval {
                peer.last_ping = ticks;
                peer.ping_counter = peer.ping_counter.wrapping_add(1);
                let mut acc = HashAccumulator::new();
                acc.absorb(&self.ping_salt);
                acc.absorb(&id.to_le_bytes());
                acc.absorb(&peer.ping_counter.to_le_bytes());
                let ping_id = acc.finish_u64();
                peer.in_flight_ping = Some(ping_id);
                ping = Some(Message::Ping(PingMsg { id: ping_id }));
            }
        } else if ticks - peer.last_ping > self.cfg.max_pong_silence {
            trace!(target: "node::routemgr", node = id, "pong silence, dropping route");
            peer.has_route = false;
            peer.in_flight_ping = None;
        }

        if let Some(ping) = ping {
            let result = self
                .peers
                .get_mut(&id)
                .map(|p| p.rpc_out.append(&ping))
                .unwrap_or(Ok(()));
            self.absorb(result);
        }
        if let Some(announce) = announce {
            let result = self.ur_out.append(&announce);
            self.absorb(result);
        }
    }

    /// A peer announced a route to `msg.node`; upgrade our opinion of
    /// that node if we had none.
    pub(crate) fn routemgr_recv_route(&mut self, msg: &RouteMsg) {
        if let Some(peer) = self.peers.get_mut(&msg.node) {
            if peer.disposition == Disposition::Neutral {
                peer.disposition = Disposition::Positive;
            }
        }
    }

    /// Answer a ping over the point-to-point outbox.
    pub(crate) fn routemgr_recv_ping(&mut self, origin: NodeId, msg: &PingMsg) {
        let pong = Message::Pong(PongMsg { id: msg.id });
        let result = self
            .peers
            .get_mut(&origin)
            .map(|p| p.rpc_out.append(&pong))
            .unwrap_or(Ok(()));
        self.absorb(result);
    }

    /// A pong: correlate, then fold the round trip into the latency
    /// estimate.
    pub(crate) fn routemgr_recv_pong(&mut self, origin: NodeId, msg: &PongMsg) {
        let ticks = self.clock.ticks;
        let Some(peer) = self.peers.get_mut(&origin) else {
            return;
        };
        if peer.in_flight_ping != Some(msg.id) {
            // Uncorrelated or unsolicited response, discard.
            return;
        }

        peer.in_flight_ping = None;
        peer.last_pong = ticks;
        peer.has_route = true;
        let rtt = ticks.saturating_sub(peer.last_ping);
        peer.push_latency_sample(rtt);
        trace!(target: "node::routemgr", node = origin, rtt, latency = peer.latency, "pong");
    }

    /// A signed address migration: honoured only when the claim is about
    /// the signer itself.
    pub(crate) fn routemgr_recv_commandeer(&mut self, origin: NodeId, msg: &CommandeerMsg) {
        if origin != msg.node {
            self.set_negative(origin, "commandeered another node's address");
            return;
        }
        if !self.app.permit_net_id(&msg.identifier) {
            return;
        }
        let Some(peer) = self.peers.get_mut(&origin) else {
            return;
        };
        if peer.net_id == msg.identifier {
            return;
        }
        debug!(target: "node::routemgr", node = origin, "address commandeered");
        let old = peer.net_id.clone();
        peer.set_net_id(msg.identifier.clone());
        self.bus.delete_route(&old);
        self.bus.create_route(&msg.identifier);
    }
}
