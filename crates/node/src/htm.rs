// Path: crates/node/src/htm.rs
//! The hash-tree manager: snapshots of local history and the scan
//! protocol that detects and repairs missing history between peers.
//!
//! Repair is pull-based and bounded per frame: the local node compares
//! directory listings against a slightly aged snapshot of its own tree
//! (so traffic still in flight does not read as divergence), descends
//! into mismatching subdirectories, and fetches missing objects with
//! ranged queries. Fetched objects are raw signed envelopes and re-enter
//! the ordinary receive path, so repair and normal reception are the same
//! code.

use crate::app::Application;
use crate::system::System;
use std::collections::VecDeque;
use synod_storage::HashTree;
use synod_types::status::Disposition;
use synod_types::wire::{
    HtDirMsg, HtLsMsg, HtRangeMsg, HtReadMsg, HtSlot, Message, ReceivedMsg, HASH_SIZE,
};
use synod_types::{Instant, NodeId};
use tracing::{debug, trace};

/// Scan and snapshot state.
pub(crate) struct HtmMgr {
    /// Aged forks of the local tree, newest first, each tagged with the
    /// monotime it was taken at.
    pub snapshots: VecDeque<(Instant, HashTree)>,
    pub last_snapshot: Instant,
    pub last_root_query: Instant,
    pub last_range_round: Instant,
    pub next_range_id: u32,
    /// Range queries awaiting their terminating `Received`.
    pub pending_ranges: Vec<u32>,
    pub queries_issued: u32,
    pub queries_answered: u32,
}

impl HtmMgr {
    pub(crate) fn new() -> Self {
        Self {
            snapshots: VecDeque::new(),
            last_snapshot: 0,
            last_root_query: 0,
            last_range_round: 0,
            next_range_id: 0,
            pending_ranges: Vec::new(),
            queries_issued: 0,
            queries_answered: 0,
        }
    }

    pub(crate) fn trim_snapshots(&mut self, keep: usize) {
        self.snapshots.truncate(keep);
    }

    /// The newest snapshot at or before the given instant, if any.
    fn snapshot_at(&self, at: Instant) -> Option<&HashTree> {
        self.snapshots
            .iter()
            .find(|(taken, _)| *taken <= at)
            .map(|(_, tree)| tree)
    }
}

impl<A: Application> System<A> {
    /// The per-frame system half: snapshot on schedule and compare roots
    /// against granted peers.
    pub(crate) fn htm_update(&mut self) {
        let ticks = self.clock.ticks;

        if ticks - self.htm.last_snapshot >= self.cfg.ht_snapshot_interval {
            self.htm.last_snapshot = ticks;
            self.htm
                .snapshots
                .push_front((self.clock.monotime, self.hash_tree.fork()));
            let keep = self.cfg.ht_num_snapshots as usize;
            self.htm.trim_snapshots(keep);
        }

        if self.local_id == 0 {
            return;
        }

        if ticks - self.htm.last_root_query >= self.cfg.ht_root_query_interval {
            self.htm.last_root_query = ticks;
            let probe = Message::HtLs(HtLsMsg {
                hash: [0; HASH_SIZE],
                offset: 0,
            });
            let targets: Vec<NodeId> = self
                .peers
                .values()
                .filter(|p| {
                    !p.is_local && p.has_route && p.disposition == Disposition::Positive
                })
                .map(|p| p.id)
                .collect();
            for id in targets {
                if !self.node_has_grant(id) {
                    continue;
                }
                let result = self
                    .peers
                    .get_mut(&id)
                    .map(|p| p.rpc_out.append(&probe))
                    .unwrap_or(Ok(()));
                self.absorb(result);
                self.htm.queries_issued += 1;
            }
        }

        if self.htm.pending_ranges.is_empty()
            && self.join.phase == crate::join::JoinPhase::RequestingGrant
            && !self.info_complete_reported
        {
            self.info_complete_reported = true;
            self.app.information_complete();
        }
    }

    /// Answer a directory listing request from the current tree.
    pub(crate) fn htm_recv_ls(&mut self, origin: NodeId, msg: &HtLsMsg) {
        let slots = self
            .hash_tree
            .readdir(&msg.hash, msg.offset as usize)
            .unwrap_or([HtSlot::Empty; 16]);
        let reply = Message::HtDir(HtDirMsg {
            hash: msg.hash,
            offset: msg.offset,
            slots,
        });
        let result = self
            .peers
            .get_mut(&origin)
            .map(|p| p.rpc_out.append(&reply))
            .unwrap_or(Ok(()));
        self.absorb(result);
    }

    /// A peer's directory listing: diff it against the aged local
    /// snapshot, descending into differing subdirectories and fetching
    /// differing objects.
    pub(crate) fn htm_recv_dir(&mut self, origin: NodeId, msg: &HtDirMsg) {
        self.htm.queries_answered += 1;
        let (issued, answered) = (self.htm.queries_issued, self.htm.queries_answered);
        self.app.ht_scan_progress(answered, issued.max(answered));

        let compare_at = self
            .clock
            .monotime
            .saturating_sub(self.cfg.ht_root_query_offset);
        let local_slots = self
            .htm
            .snapshot_at(compare_at)
            .unwrap_or(&self.hash_tree)
            .readdir(&msg.hash, msg.offset as usize)
            .unwrap_or([HtSlot::Empty; 16]);

        let mut descents: Vec<Message> = Vec::new();
        let mut want_fetch = false;
        for (ix, theirs) in msg.slots.iter().enumerate() {
            let ours = &local_slots[ix];
            if theirs == ours {
                continue;
            }
            match theirs {
                HtSlot::Empty => {} // they lack something; they will fetch
                HtSlot::Dir(_) => {
                    if (msg.offset as usize) + 1 < HASH_SIZE * 2 {
                        let mut path = msg.hash;
                        set_nybble(&mut path, msg.offset as usize, ix as u8);
                        descents.push(Message::HtLs(HtLsMsg {
                            hash: path,
                            offset: msg.offset + 1,
                        }));
                    }
                }
                HtSlot::Object(_) => want_fetch = true,
            }
        }

        // Mismatching objects at this level are cheapest to repair with
        // one ranged fetch over the directory's prefix.
        if want_fetch && self.clock.ticks - self.htm.last_range_round
            >= self.cfg.ht_range_query_interval
        {
            self.htm.last_range_round = self.clock.ticks;
            let id = self.htm.next_range_id;
            self.htm.next_range_id = self.htm.next_range_id.wrapping_add(1);
            self.htm.pending_ranges.push(id);
            descents.push(Message::HtRange(HtRangeMsg {
                id,
                hash: msg.hash,
                hashlen: msg.offset,
                offset: 0,
                mask: 0,
            }));
            debug!(target: "node::htm", node = origin, range = id, "range repair issued");
        }

        for query in descents {
            self.htm.queries_issued += 1;
            let result = self
                .peers
                .get_mut(&origin)
                .map(|p| p.rpc_out.append(&query))
                .unwrap_or(Ok(()));
            self.absorb(result);
        }
    }

    /// Answer a single-object fetch with the raw stored envelope.
    pub(crate) fn htm_recv_read(&mut self, origin: NodeId, msg: &HtReadMsg) {
        let Some(found) = self.hash_tree.get_by_hash(&msg.hash) else {
            return;
        };
        if let Some(peer) = self.peers.get(&origin) {
            let netid = peer.net_id.clone();
            self.bus.unicast(&netid, &found.data);
        }
    }

    /// Answer a ranged fetch: raw envelopes in hash order, bounded by the
    /// configured maximum, terminated by a `Received` marker.
    pub(crate) fn htm_recv_range(&mut self, origin: NodeId, msg: &HtRangeMsg) {
        let objects = self.hash_tree.get_range(
            &msg.hash,
            msg.offset,
            msg.mask,
            self.cfg.ht_range_max as usize,
        );
        let count = objects.len() as u32;
        let Some(netid) = self.peers.get(&origin).map(|p| p.net_id.clone()) else {
            return;
        };
        for object in objects {
            self.bus.unicast(&netid, &object.data);
        }
        trace!(target: "node::htm", node = origin, count, "range answered");
        let done = Message::Received(ReceivedMsg { id: msg.id, count });
        let result = self
            .peers
            .get_mut(&origin)
            .map(|p| p.rpc_out.append(&done))
            .unwrap_or(Ok(()));
        self.absorb(result);
    }

    /// A range fetch completed.
    pub(crate) fn htm_recv_received(&mut self, _origin: NodeId, msg: &ReceivedMsg) {
        self.htm.pending_ranges.retain(|id| *id != msg.id);
    }
}

/// Writes one nybble of a hash path, high nibble first.
fn set_nybble(hash: &mut [u8; HASH_SIZE], index: usize, value: u8) {
    let byte = &mut hash[index / 2];
    if index % 2 == 0 {
        *byte = (*byte & 0x0F) | (value << 4);
    } else {
        *byte = (*byte & 0xF0) | (value & 0x0F);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nybble_writes_high_first() {
        let mut hash = [0u8; HASH_SIZE];
        set_nybble(&mut hash, 0, 0xA);
        set_nybble(&mut hash, 1, 0xB);
        set_nybble(&mut hash, 2, 0xC);
        assert_eq!(hash[0], 0xAB);
        assert_eq!(hash[1], 0xC0);
    }
}
