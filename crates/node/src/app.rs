// Path: crates/node/src/app.rs
//! The callback interface between the kernel and the application.

use synod_timeline::{Context, SimEvent};
use synod_types::wire::{JoinRequestMsg, NetworkIdentifierPair};
use synod_types::{EventSerial, Instant, NodeId, ObjectId};

/// What the application must (and may) provide to a [`crate::System`].
///
/// Only two callbacks are required; everything else defaults to a no-op
/// or a permissive answer.
pub trait Application {
    /// A node has been admitted: construct its simulation object and
    /// register it in the given context. The object's id must equal `id`.
    fn create_node_object(&mut self, ctx: &mut Context, id: ObjectId);

    /// Parses an application event received from the node owning `object`.
    /// Returning `None` rejects the event (and marks the sender hostile).
    /// The returned event's key must be `(instant, object, serial)`.
    fn decode_event(
        &mut self,
        instant: Instant,
        object: ObjectId,
        serial: EventSerial,
        data: &[u8],
    ) -> Option<Box<dyn SimEvent>>;

    /// The local node has learned its own id.
    fn acquire_id(&mut self, _id: ObjectId) {}

    /// A new peer has been discovered at the given address.
    fn discover_node(&mut self, _netid: &NetworkIdentifierPair, _id: NodeId) {}

    /// A peer has been removed.
    fn remove_node(&mut self, _id: NodeId) {}

    /// The join-tree walk has completed; the node set is known.
    fn join_tree_traversed(&mut self) {}

    /// Progress of the hash-tree repair scan, as answered/issued queries.
    fn ht_scan_progress(&mut self, _num: u32, _denom: u32) {}

    /// Connected but still waiting for a peer's commits to stabilise.
    fn awaiting_stability(
        &mut self,
        _id: NodeId,
        _now: Instant,
        _committed: Instant,
        _validated: Instant,
    ) {
    }

    /// Joining is complete and history has been recovered.
    fn information_complete(&mut self) {}

    /// The clock has locked onto the peers' shared time.
    fn clock_synced(&mut self) {}

    /// The local node has gained GRANT and is a full participant.
    fn gained_grant(&mut self) {}

    /// Point-to-point application data arrived outside the simulation.
    fn receive_unicast(&mut self, _from: NodeId, _data: &[u8]) {}

    /// Produces authentication data for an outgoing join request.
    fn gen_auth(&mut self, _request: &JoinRequestMsg) -> Option<Vec<u8>> {
        None
    }

    /// Validates the authentication data of an incoming join request.
    fn is_auth_valid(&self, _request: &JoinRequestMsg) -> bool {
        true
    }

    /// Whether the given id may be assigned to a node. Ids 0 and 1 are
    /// always reserved regardless of this answer.
    fn permit_object_id(&self, _id: ObjectId) -> bool {
        true
    }

    /// Whether the given network identifier is acceptable in this system
    /// (e.g. enforcing a single address family).
    fn permit_net_id(&self, _netid: &NetworkIdentifierPair) -> bool {
        true
    }
}
