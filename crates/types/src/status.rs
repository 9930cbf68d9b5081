// Path: crates/types/src/status.rs
//! Node status bits and the externally visible system status.

use bitflags::bitflags;
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

bitflags! {
    /// The two monotone status bits voted onto every node.
    ///
    /// Bits are only ever set, never cleared (except by rewinding history
    /// to before the vote that set them).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct NodeStatus: u8 {
        /// The node's events are admitted to the simulation.
        const GRANT = 1 << 0;
        /// The node has been expelled; its events are ignored from the
        /// effective instant onward.
        const DENY = 1 << 1;
    }
}

impl NodeStatus {
    /// Whether this status combination means the node is alive: granted
    /// and not denied.
    pub fn is_alive(self) -> bool {
        self == NodeStatus::GRANT
    }
}

/// One of the two status bits, as carried by chmod messages. The bit index
/// doubles as the chmod event's serial number, making the bit the
/// tie-breaker between co-instant chmods against the same node.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
pub enum StatusBit {
    /// The GRANT bit (index 0).
    Grant,
    /// The DENY bit (index 1).
    Deny,
}

impl StatusBit {
    /// The serial-number index of this bit.
    pub fn index(self) -> u32 {
        match self {
            StatusBit::Grant => 0,
            StatusBit::Deny => 1,
        }
    }

    /// The corresponding status flag.
    pub fn flag(self) -> NodeStatus {
        match self {
            StatusBit::Grant => NodeStatus::GRANT,
            StatusBit::Deny => NodeStatus::DENY,
        }
    }
}

/// The local node's opinion of a peer, driving routing effort and DENY
/// votes. Dispositions are local state and never serialised.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Disposition {
    /// The peer misbehaved or lags; the local node will vote DENY.
    Negative,
    /// No opinion yet; the default for nodes discovered second-hand.
    #[default]
    Neutral,
    /// The peer is in good standing.
    Positive,
}

/// The status of a system as reported by every advance call.
///
/// Any status other than `Ok` is abnormal; whether the abnormality is
/// permanent depends on the particular status.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SystemStatus {
    /// Normally connected.
    Ok,
    /// The local node has not received an identifier yet. Cleared by
    /// bootstrapping or a successful join.
    Anonymous,
    /// The local node is voting DENY on at least half of the live nodes,
    /// which usually indicates a network partition on the local side.
    Partitioned,
    /// The local node has gained DENY. Almost always permanent and fatal.
    Kicked,
    /// Memory was exhausted while following the protocol; the system can no
    /// longer keep up and should be destroyed.
    Oom,
    /// The instant counter saturated. Permanent and fatal.
    Overflow,
}

impl SystemStatus {
    /// Whether this status still permits normal operation.
    pub fn is_ok(self) -> bool {
        matches!(self, SystemStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_states_follow_the_bits() {
        assert!(!NodeStatus::empty().is_alive()); // UNBORN
        assert!(NodeStatus::GRANT.is_alive()); // ALIVE
        assert!(!NodeStatus::DENY.is_alive()); // STILLBORN
        assert!(!(NodeStatus::GRANT | NodeStatus::DENY).is_alive()); // KILLED
    }

    #[test]
    fn bit_indexes_are_stable() {
        assert_eq!(StatusBit::Grant.index(), 0);
        assert_eq!(StatusBit::Deny.index(), 1);
    }
}
