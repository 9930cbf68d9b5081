// Path: crates/net/src/bus.rs
//! The contract between the kernel and whatever moves its datagrams.

use synod_types::wire::NetworkIdentifierPair;

/// An abstract, unreliable datagram transport.
///
/// The kernel polls; nothing here blocks. Delivery is best-effort: the
/// protocol's retransmit and repair machinery sits above this, not below.
pub trait MessageBus {
    /// Registers a peer for unicast and broadcast. Idempotent.
    fn create_route(&mut self, netid: &NetworkIdentifierPair) -> bool;

    /// Unregisters a peer. Idempotent.
    fn delete_route(&mut self, netid: &NetworkIdentifierPair) -> bool;

    /// Sends to one peer.
    fn unicast(&mut self, netid: &NetworkIdentifierPair, data: &[u8]);

    /// Sends to one peer, additionally mirroring the datagram via the
    /// relay service when one is configured, so the first contact can
    /// punch through NAT.
    fn triangular_unicast(&mut self, netid: &NetworkIdentifierPair, data: &[u8]);

    /// Sends to every registered route.
    fn broadcast(&mut self, data: &[u8]);

    /// Reads the next pending datagram into `buf`, returning its size, or
    /// 0 when none is pending. Never blocks.
    fn recv(&mut self, buf: &mut [u8]) -> usize;
}
