// Path: crates/node/src/clock.rs
//! Tolerance-based monotonic clock synchronisation.
//!
//! Every peer contributes a clock source: the instant observed on its
//! latest envelope plus the estimated one-way latency to it. The agreed
//! wall time (`systime`) chases the median of the live estimates, one
//! tick at a time within tolerance, jumping only when the deviation is
//! too large to slew away.

use std::collections::BTreeMap;
use synod_types::{Instant, NodeId};
use tracing::debug;

struct ClockSource {
    instant: Instant,
    latency: u32,
    sampled_at: Instant, // monotime of the sample
}

/// The local node's view of time.
pub struct Clock {
    /// Monotonic local ticks since the system was created.
    pub monotime: Instant,
    /// The agreed wall time all instants are expressed in.
    pub systime: Instant,
    /// Frames elapsed; drives every "every N ticks" schedule.
    pub ticks: Instant,
    /// Sources whose last sample is older than this many ticks are
    /// ignored.
    pub obsolescence_interval: u32,
    /// Deviations larger than this make systime jump instead of slewing.
    pub tolerance: u32,

    sources: BTreeMap<NodeId, ClockSource>,
    synced: bool,
}

impl Clock {
    /// Creates a clock at tick zero.
    pub fn new(obsolescence_interval: u32, tolerance: u32) -> Self {
        Self {
            monotime: 0,
            systime: 0,
            ticks: 0,
            obsolescence_interval,
            tolerance,
            sources: BTreeMap::new(),
            synced: false,
        }
    }

    /// Records a peer's latest observed instant and latency.
    pub fn sample(&mut self, node: NodeId, instant: Instant, latency: u32) {
        self.sources.insert(
            node,
            ClockSource {
                instant,
                latency,
                sampled_at: self.monotime,
            },
        );
    }

    /// Forgets a peer's source entirely.
    pub fn remove_source(&mut self, node: NodeId) {
        self.sources.remove(&node);
    }

    /// Whether systime has locked onto at least one live peer estimate.
    /// Latched: once synced, stays synced.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Advances local time by `delta` ticks and moves systime toward the
    /// median of the live estimates (the local monotime counts as one
    /// estimate).
    pub fn advance(&mut self, delta: u32) {
        self.monotime = self.monotime.saturating_add(delta);
        self.ticks = self.ticks.saturating_add(delta);

        let horizon = self.monotime.saturating_sub(self.obsolescence_interval);
        self.sources.retain(|_, s| s.sampled_at >= horizon);

        let mut estimates: Vec<Instant> = self
            .sources
            .values()
            .map(|s| s.instant.saturating_add(s.latency))
            .collect();
        estimates.push(self.monotime);
        estimates.sort_unstable();
        let proposed = estimates[estimates.len() / 2];

        let deviation = self.systime.abs_diff(proposed);
        if deviation > self.tolerance {
            debug!(target: "node::clock", from = self.systime, to = proposed, "clock jump");
            self.systime = proposed;
        } else if self.systime < proposed {
            self.systime += 1;
        } else if self.systime > proposed {
            self.systime -= 1;
        }

        if !self.synced && !self.sources.is_empty() && deviation <= self.tolerance {
            self.synced = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_clock_tracks_monotime() {
        let mut clock = Clock::new(40, 8);
        for _ in 0..20 {
            clock.advance(1);
        }
        assert_eq!(clock.monotime, 20);
        assert_eq!(clock.systime, 20);
        assert_eq!(clock.ticks, 20);
    }

    #[test]
    fn large_deviation_jumps_within_one_advance() {
        let mut clock = Clock::new(40, 8);
        clock.advance(1);
        // Two peers far ahead outvote the local monotime.
        clock.sample(2, 1000, 4);
        clock.sample(3, 1002, 4);
        clock.advance(1);
        assert_eq!(clock.systime, 1004, "median estimate wins outright");
    }

    #[test]
    fn small_deviation_slews_one_tick_at_a_time() {
        let mut clock = Clock::new(100, 8);
        for _ in 0..10 {
            clock.advance(1);
        }
        clock.sample(2, 13, 2); // estimate 15, deviation 5 <= tolerance
        clock.sample(3, 14, 2); // estimate 16
        clock.advance(1);
        // sorted estimates: [11, 15, 16] -> median 15; systime slews by 1.
        assert_eq!(clock.systime, 11);
    }

    #[test]
    fn obsolete_sources_are_discarded() {
        let mut clock = Clock::new(5, 2);
        clock.sample(2, 500, 1);
        for _ in 0..10 {
            clock.advance(1);
        }
        // The stale source no longer drags systime toward 501.
        assert_eq!(clock.systime, clock.monotime);
    }
}
