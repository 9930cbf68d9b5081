// Path: crates/types/src/config.rs
//! System tunables and their derivation from the standard latency.
//!
//! Nearly every interval in the protocol defaults to a multiple of the
//! "standard latency": the one-way latency, in instants, that the
//! application expects to commonly experience. Applications tune the few
//! fields they care about after construction.

use serde::{Deserialize, Serialize};

/// Defines the strategy for calculating default configuration values from
/// the standard latency of the system.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Profile {
    /// As strict as possible: every latency-compensation field that can
    /// meaningfully be zero is zero. Latency effects are amplified, but no
    /// node can gain unfair advance knowledge.
    Strict,
    /// Permissive: compensation fields default from the standard latency,
    /// reducing latency effects to roughly a one-way trip. Nodes whose true
    /// latency is below the standard latency may see slightly ahead.
    Lax,
}

/// The full set of tunables carried by a system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    /// The standard latency, in instants, that defaults derive from.
    pub std_latency: u32,
    /// The profile the defaults were derived with.
    pub profile: Profile,
    /// The MTU for envelope encoders.
    pub mtu: usize,

    /// Clock sources older than this many ticks are discarded.
    pub clock_obsolescence_interval: u32,
    /// Deviations beyond this many instants make the clock jump rather
    /// than slew.
    pub clock_tolerance: u32,

    /// How often the local node declares a commit.
    pub commit_interval: u32,
    /// A granted peer whose committed frontier lags further than this is
    /// voted against.
    pub max_commit_lag: u32,
    /// A granted peer whose validated frontier lags further than this is
    /// voted against.
    pub max_validated_lag: u32,
    /// Extra instants of visibility granted beyond a peer's committed
    /// frontier.
    pub commit_lag_laxness: u32,
    /// The local-latency compensation fraction, stored as a 16-bit fixed
    /// point (numerator * 65536 / denominator).
    pub self_commit_lag_compensation_16: u32,

    /// The maximum number of objects answered per hash-tree range query.
    pub ht_range_max: u32,
    /// The pacing interval for outstanding range queries.
    pub ht_range_query_interval: u32,
    /// How often a fork of the hash-tree is filed into the snapshot ring.
    pub ht_snapshot_interval: u32,
    /// How many snapshots the ring holds.
    pub ht_num_snapshots: u32,
    /// How often root directories are compared against granted peers.
    pub ht_root_query_interval: u32,
    /// How far back from the present the compared snapshot is taken.
    pub ht_root_query_offset: u32,

    /// How often an unanswered join-tree query is re-issued.
    pub join_tree_query_interval: u32,
    /// The minimum number of ticks between two Accepts issued locally.
    pub accept_interval: u32,
    /// Join requests are refused once this many nodes are alive.
    pub max_live_nodes: u32,

    /// How often an ungranted local node proposes its own GRANT.
    pub propose_grant_interval: u32,
    /// The width of the DENY voting window.
    pub vote_deny_interval: u32,
    /// How far in the future chmod votes take effect.
    pub vote_chmod_offset: u32,
    /// How far after its instant an optimistically admitted event loses
    /// its optimism.
    pub event_deadline_offset: u32,

    /// Route re-announcement interval for ungranted peers.
    pub ungranted_route_interval: u32,
    /// Route re-announcement interval for granted peers.
    pub granted_route_interval: u32,
    /// How often each peer is pinged.
    pub ping_interval: u32,
    /// How long a ping may go unanswered before the route is dropped.
    pub max_pong_silence: u32,
}

impl SystemConfig {
    /// Derives the default configuration for the given standard latency and
    /// profile.
    pub fn new(std_latency: u32, profile: Profile, mtu: usize) -> Self {
        let lat = std_latency.max(1);
        let lax = matches!(profile, Profile::Lax);
        Self {
            std_latency: lat,
            profile,
            mtu,
            clock_obsolescence_interval: 5 * lat,
            clock_tolerance: lat,
            commit_interval: (lat / 2).max(1),
            max_commit_lag: 8 * lat,
            max_validated_lag: 16 * lat,
            commit_lag_laxness: if lax { lat } else { 0 },
            self_commit_lag_compensation_16: if lax { 65536 } else { 0 },
            ht_range_max: 64,
            ht_range_query_interval: 4 * lat,
            ht_snapshot_interval: lat,
            ht_num_snapshots: 64,
            ht_root_query_interval: 16 * lat,
            ht_root_query_offset: 4 * lat,
            join_tree_query_interval: lat,
            accept_interval: 8 * lat,
            max_live_nodes: u32::MAX,
            propose_grant_interval: 16 * lat,
            vote_deny_interval: 2 * lat,
            vote_chmod_offset: 4 * lat,
            event_deadline_offset: 16 * lat,
            ungranted_route_interval: 4 * lat,
            granted_route_interval: 32 * lat,
            ping_interval: 16 * lat,
            max_pong_silence: 128 * lat,
        }
    }

    /// Sets the self-commit-lag compensation as a fraction. The numerator
    /// must be below 65536 and the denominator non-zero; the fraction is
    /// mapped to a 16-bit fixed point internally.
    pub fn set_self_commit_lag_compensation(&mut self, numerator: u32, denominator: u32) {
        debug_assert!(numerator < 65536);
        debug_assert!(denominator != 0);
        self.self_commit_lag_compensation_16 = numerator * 65536 / denominator.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_profile_zeroes_compensation() {
        let cfg = SystemConfig::new(8, Profile::Strict, 512);
        assert_eq!(cfg.commit_lag_laxness, 0);
        assert_eq!(cfg.self_commit_lag_compensation_16, 0);
    }

    #[test]
    fn lax_profile_derives_compensation_from_latency() {
        let cfg = SystemConfig::new(8, Profile::Lax, 512);
        assert_eq!(cfg.commit_lag_laxness, 8);
        assert_eq!(cfg.self_commit_lag_compensation_16, 65536);
        assert_eq!(cfg.commit_interval, 4);
        assert_eq!(cfg.max_commit_lag, 64);
    }

    #[test]
    fn commit_interval_never_reaches_zero() {
        let cfg = SystemConfig::new(1, Profile::Strict, 512);
        assert_eq!(cfg.commit_interval, 1);
    }

    #[test]
    fn compensation_fraction_maps_to_fixed_point() {
        let mut cfg = SystemConfig::new(8, Profile::Strict, 512);
        cfg.set_self_commit_lag_compensation(1, 2);
        assert_eq!(cfg.self_commit_lag_compensation_16, 32768);
    }
}
