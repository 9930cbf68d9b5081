// Path: crates/storage/src/comchain.rs
//! Per-peer commit-chains.
//!
//! A peer periodically declares a commit: a hash over every committed-
//! redistributable message it produced in an instant range. The local node
//! independently reveals the hash of each such message it actually
//! received. A range whose revealed hashes reproduce the declared hash is
//! *validated*; a chain that can no longer be reconciled is *dead*, and
//! the peer is treated as having diverged.
//!
//! Reveals and commits arrive in any order relative to each other, and
//! commits routinely arrive before the gated messages they cover, so a
//! mismatching range stays pending and is re-checked on every reveal into
//! it. Divergence is only declared on hard evidence: overlapping or
//! inverted commit ranges, or a reveal landing inside a range that had
//! already validated without it.

use std::collections::{BTreeMap, BTreeSet};
use synod_crypto::hash::{HashAccumulator, MsgHash};
use synod_types::Instant;
use tracing::warn;

struct Range {
    end: Instant,
    declared: MsgHash,
    revealed: BTreeSet<(Instant, MsgHash)>,
    validated: bool,
}

impl Range {
    /// A range validates when the SHA-3 of its revealed hashes, in
    /// ascending `(instant, hash)` order, equals the declared hash.
    fn try_validate(&mut self) {
        if self.validated {
            return;
        }
        let mut acc = HashAccumulator::new();
        for (_, hash) in &self.revealed {
            acc.absorb(hash);
        }
        self.validated = acc.finish() == self.declared;
    }
}

/// The commit bookkeeping for one peer.
#[derive(Default)]
pub struct CommitChain {
    /// Declared ranges, keyed by start instant.
    ranges: BTreeMap<Instant, Range>,
    /// Revealed hashes not yet covered by any declared range.
    pending: BTreeSet<(Instant, MsgHash)>,
    dead: bool,
}

impl CommitChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the chain has irreconcilably diverged.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Records the hash of one message received at `instant`. Out-of-order
    /// reveals are permitted; reveals ahead of any declared range wait in
    /// a pending bucket.
    pub fn reveal(&mut self, instant: Instant, hash: MsgHash) {
        if self.dead {
            return;
        }

        let covering = self
            .ranges
            .range_mut(..=instant)
            .next_back()
            .filter(|(_, r)| r.end > instant);

        match covering {
            Some((start, range)) => {
                if range.validated {
                    // The peer committed this span without this message.
                    warn!(
                        target: "storage::comchain",
                        instant,
                        start,
                        hash = %hex::encode(hash),
                        "reveal inside validated range, chain dead"
                    );
                    self.dead = true;
                    return;
                }
                range.revealed.insert((instant, hash));
                range.try_validate();
            }
            None => {
                self.pending.insert((instant, hash));
            }
        }
    }

    /// Declares the commit `[start, end)` with the given hash. Returns
    /// whether the chain is still alive afterwards.
    pub fn commit(&mut self, start: Instant, end: Instant, hash: MsgHash) -> bool {
        if self.dead {
            return false;
        }
        if end <= start {
            warn!(target: "storage::comchain", start, end, "inverted commit range, chain dead");
            self.dead = true;
            return false;
        }

        // A byte-identical repeat of an existing declaration is harmless
        // (commits travel uncommitted and may be received twice).
        if let Some(existing) = self.ranges.get(&start) {
            if existing.end == end && existing.declared == hash {
                return true;
            }
        }

        let overlaps_prev = self
            .ranges
            .range(..=start)
            .next_back()
            .map(|(_, r)| r.end > start)
            .unwrap_or(false);
        let overlaps_next = self
            .ranges
            .range(start..)
            .next()
            .map(|(next_start, _)| *next_start < end)
            .unwrap_or(false);
        if overlaps_prev || overlaps_next {
            warn!(target: "storage::comchain", start, end, "overlapping commit range, chain dead");
            self.dead = true;
            return false;
        }

        let mut range = Range {
            end,
            declared: hash,
            revealed: BTreeSet::new(),
            validated: false,
        };

        // Adopt previously revealed hashes that fall into the new range.
        let covered: Vec<(Instant, MsgHash)> = self
            .pending
            .range((start, [0u8; 32])..(end, [0u8; 32]))
            .copied()
            .collect();
        for entry in covered {
            self.pending.remove(&entry);
            range.revealed.insert(entry);
        }

        range.try_validate();
        self.ranges.insert(start, range);
        true
    }

    /// Produces the commit hash over the local reveals in `[start, end)`;
    /// used by the local node's commit builder for its own outbound
    /// commits.
    pub fn create_commit(&self, start: Instant, end: Instant) -> MsgHash {
        let mut hashes: Vec<(Instant, MsgHash)> = self
            .pending
            .range((start, [0u8; 32])..(end, [0u8; 32]))
            .copied()
            .collect();
        for (range_start, range) in &self.ranges {
            if *range_start >= end {
                break;
            }
            for entry in &range.revealed {
                if entry.0 >= start && entry.0 < end {
                    hashes.push(*entry);
                }
            }
        }
        hashes.sort();

        let mut acc = HashAccumulator::new();
        for (_, hash) in &hashes {
            acc.absorb(hash);
        }
        acc.finish()
    }

    /// The highest instant `t` such that `[0, t)` is entirely covered by
    /// declared commits.
    pub fn committed(&self) -> Instant {
        let mut frontier = 0;
        for (start, range) in &self.ranges {
            if *start > frontier {
                break;
            }
            frontier = frontier.max(range.end);
        }
        frontier
    }

    /// The end of the contiguous run of declared ranges beginning at the
    /// earliest range seen, or 0 when nothing was declared.
    ///
    /// A node that joined late never observes a peer's pre-join commits
    /// until history repair backfills them; gating that peer on coverage
    /// from instant zero would wedge both sides. The frontier anchors at
    /// the first range instead and converges to [`Self::committed`] once
    /// the backfill arrives.
    pub fn committed_frontier(&self) -> Instant {
        let mut iter = self.ranges.iter();
        let Some((_, first)) = iter.next() else {
            return 0;
        };
        let mut frontier = first.end;
        for (start, range) in iter {
            if *start > frontier {
                break;
            }
            frontier = frontier.max(range.end);
        }
        frontier
    }

    /// Like [`Self::committed_frontier`], but stalling at the first range
    /// that has not validated.
    pub fn validated_frontier(&self) -> Instant {
        let mut frontier = match self.ranges.iter().next() {
            Some((start, _)) => *start,
            None => return 0,
        };
        for (start, range) in &self.ranges {
            if *start > frontier || !range.validated {
                break;
            }
            frontier = frontier.max(range.end);
        }
        frontier
    }

    /// The highest instant `t` such that `[0, t)` is entirely covered by
    /// validated commits.
    pub fn validated(&self) -> Instant {
        let mut frontier = 0;
        for (start, range) in &self.ranges {
            if *start > frontier || !range.validated {
                break;
            }
            frontier = frontier.max(range.end);
        }
        frontier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synod_crypto::hash::sha3;

    fn h(n: u8) -> MsgHash {
        sha3(&[n])
    }

    /// The declared hash for a set of (instant, hash) reveals.
    fn declared(reveals: &[(Instant, MsgHash)]) -> MsgHash {
        let mut sorted = reveals.to_vec();
        sorted.sort();
        let mut acc = HashAccumulator::new();
        for (_, hash) in &sorted {
            acc.absorb(hash);
        }
        acc.finish()
    }

    #[test]
    fn reveal_then_commit_validates() {
        let mut chain = CommitChain::new();
        let reveals = [(0, h(1)), (3, h(2)), (7, h(3))];
        for (instant, hash) in reveals {
            chain.reveal(instant, hash);
        }
        assert!(chain.commit(0, 8, declared(&reveals)));
        assert_eq!(chain.committed(), 8);
        assert_eq!(chain.validated(), 8);
        assert!(!chain.is_dead());
    }

    #[test]
    fn commit_then_reveal_validates_late() {
        let mut chain = CommitChain::new();
        let reveals = [(1, h(1)), (2, h(2))];
        assert!(chain.commit(0, 4, declared(&reveals)));
        assert_eq!(chain.committed(), 4);
        assert_eq!(chain.validated(), 0, "nothing revealed yet");

        chain.reveal(1, h(1));
        assert_eq!(chain.validated(), 0, "still one message short");
        chain.reveal(2, h(2));
        assert_eq!(chain.validated(), 4);
    }

    #[test]
    fn altered_reveal_keeps_range_unvalidated_then_dies() {
        let mut chain = CommitChain::new();
        let reveals = [(1, h(1)), (2, h(2))];
        chain.commit(0, 4, declared(&reveals));
        chain.reveal(1, h(1));
        chain.reveal(2, h(99)); // altered message
        assert_eq!(chain.validated(), 0);
        assert!(!chain.is_dead(), "the true message may still arrive");

        chain.reveal(2, h(2));
        assert_eq!(chain.validated(), 0, "the extra hash can never reconcile");

        // A message surfacing inside a *validated* span is hard proof.
        let second = [(5, h(5))];
        chain.commit(4, 6, declared(&second));
        chain.reveal(5, h(5));
        assert_eq!(chain.validated(), 0); // first range still stuck
        chain.reveal(5, h(50));
        assert!(chain.is_dead());
    }

    #[test]
    fn committed_frontier_requires_contiguity_from_zero() {
        let mut chain = CommitChain::new();
        chain.commit(4, 8, declared(&[]));
        assert_eq!(chain.committed(), 0, "a hole at [0,4) blocks the frontier");
        assert_eq!(chain.committed_frontier(), 8, "late observers anchor at the first range");
        chain.commit(0, 4, declared(&[]));
        assert_eq!(chain.committed(), 8);
        assert_eq!(chain.committed_frontier(), 8);
    }

    #[test]
    fn validated_frontier_stalls_at_the_first_unvalidated_range() {
        let mut chain = CommitChain::new();
        chain.commit(4, 8, declared(&[(5, h(5))]));
        assert_eq!(chain.validated_frontier(), 4, "declared but not yet validated");
        chain.reveal(5, h(5));
        assert_eq!(chain.validated_frontier(), 8);
        chain.commit(8, 12, declared(&[]));
        assert_eq!(chain.validated_frontier(), 12);
    }

    #[test]
    fn overlapping_commits_kill_the_chain() {
        let mut chain = CommitChain::new();
        assert!(chain.commit(0, 8, declared(&[])));
        assert!(!chain.commit(4, 12, declared(&[])));
        assert!(chain.is_dead());
    }

    #[test]
    fn duplicate_commit_declarations_are_harmless() {
        let mut chain = CommitChain::new();
        let hash = declared(&[]);
        assert!(chain.commit(0, 8, hash));
        assert!(chain.commit(0, 8, hash));
        assert!(!chain.is_dead());
    }

    #[test]
    fn inverted_ranges_kill_the_chain() {
        let mut chain = CommitChain::new();
        assert!(!chain.commit(8, 8, declared(&[])));
        assert!(chain.is_dead());
    }

    #[test]
    fn create_commit_matches_what_a_peer_would_validate() {
        // Two chains: ours builds, theirs checks.
        let mut builder = CommitChain::new();
        builder.reveal(1, h(1));
        builder.reveal(3, h(3));
        builder.reveal(9, h(9)); // outside the committed span

        let hash = builder.create_commit(0, 8);

        let mut peer = CommitChain::new();
        peer.reveal(1, h(1));
        peer.reveal(3, h(3));
        assert!(peer.commit(0, 8, hash));
        assert_eq!(peer.validated(), 8);
    }
}
