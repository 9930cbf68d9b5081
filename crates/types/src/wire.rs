// Path: crates/types/src/wire.rs
//! The wire message choice and network identifiers.
//!
//! Every datagram on the wire is a signed envelope carrying one or more
//! segments; each segment is the canonical encoding of one [`Message`].
//! The envelope's class (committed-redistributable, uncommitted-
//! redistributable or rpc) is determined by its flags byte, and every
//! segment inside an envelope must belong to that class.

use crate::id::{EventSerial, Instant, NodeId, ObjectId};
use crate::status::StatusBit;
use parity_scale_codec::{Decode, Encode};

/// The number of bytes in a message hash (SHA3-256).
pub const HASH_SIZE: usize = 32;
/// The number of bytes in an envelope signature (Ed25519).
pub const SIGNATURE_SIZE: usize = 64;
/// The number of bytes in a node public key (Ed25519).
pub const PUBKEY_SIZE: usize = 32;
/// The number of bytes in a system salt.
pub const SALT_SIZE: usize = 32;
/// The number of slots in one hash-tree directory.
pub const HTDIR_SIZE: usize = 16;
/// The upper bound on application-supplied join authentication data.
pub const AUTH_MAX: usize = 58;

/// An IPv4 or IPv6 address.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Encode, Decode)]
pub enum IpAddress {
    /// A 4-byte IPv4 address.
    V4([u8; 4]),
    /// A 16-byte IPv6 address.
    V6([u8; 16]),
}

/// A single network endpoint: an address and a port.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Encode, Decode)]
pub struct NetworkIdentifier {
    /// The UDP port.
    pub port: u16,
    /// The host address.
    pub address: IpAddress,
}

/// The full identity of a node on the network: its intranet endpoint, and
/// its Internet-visible endpoint when it has one.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Encode, Decode)]
pub struct NetworkIdentifierPair {
    /// The endpoint as seen from the local network segment.
    pub intranet: NetworkIdentifier,
    /// The endpoint as seen from the Internet, if distinct.
    pub internet: Option<NetworkIdentifier>,
}

/// The class of an envelope, encoded in the two low bits of its flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageClass {
    /// Tracked by commit-chains and the hash-tree; redistribution is gated
    /// behind each peer's visibility horizon.
    Committed,
    /// Redistributable immediately; does not contribute to commit hashing.
    Uncommitted,
    /// Point-to-point; never redistributed.
    Rpc,
}

impl MessageClass {
    /// The on-wire flags value of this class.
    pub fn flags(self) -> u8 {
        match self {
            MessageClass::Committed => 0,
            MessageClass::Uncommitted => 1,
            MessageClass::Rpc => 2,
        }
    }

    /// Decodes a flags byte; values above 2 are invalid.
    pub fn from_flags(flags: u8) -> Option<Self> {
        match flags & 0x03 {
            0 => Some(MessageClass::Committed),
            1 => Some(MessageClass::Uncommitted),
            2 => Some(MessageClass::Rpc),
            _ => None,
        }
    }
}

/// A route liveness probe. The id is derived from a secret salt, the peer
/// and a counter so that pongs cannot be forged ahead of time.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct PingMsg {
    /// The opaque correlation id echoed by the pong.
    pub id: u64,
}

/// The answer to a [`PingMsg`].
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct PongMsg {
    /// The id of the ping being answered.
    pub id: u64,
}

/// Asks a member of a system for the information needed to join it.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct GetNetworkInfoMsg {
    /// Where to send the [`NetworkInfoMsg`] reply.
    pub retaddr: NetworkIdentifierPair,
}

/// Describes a system to a prospective joiner.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct NetworkInfoMsg {
    /// The system salt chosen by the bootstrap node.
    pub salt: [u8; SALT_SIZE],
    /// The bootstrap node's signature over the salt.
    pub salt_sig: [u8; SIGNATURE_SIZE],
    /// The bootstrap node's public key.
    pub bootstrap_key: [u8; PUBKEY_SIZE],
    /// The bootstrap node's network identity.
    pub bootstrap_id: NetworkIdentifierPair,
}

/// A signed request to join the system.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct JoinRequestMsg {
    /// The public key the joiner will sign with.
    pub public_key: [u8; PUBKEY_SIZE],
    /// The joiner's claimed network identity; must match the sender.
    pub identifier: NetworkIdentifierPair,
    /// Application-defined authentication data, if the application
    /// requires any.
    pub auth: Option<Vec<u8>>,
}

/// Broadcast by a member to admit a joiner. Quotes the exact signed
/// request so that every recipient can independently verify it and derive
/// the same node id.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct JoinAcceptMsg {
    /// The instant of the envelope that carried the join request.
    pub instant: Instant,
    /// The signature of the original join-request envelope.
    pub signature: [u8; SIGNATURE_SIZE],
    /// The quoted request.
    pub request: JoinRequestMsg,
}

/// Asks for one child of a node's join-tree entry.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct JoinTreeMsg {
    /// The node whose join-tree children are being walked.
    pub node: NodeId,
    /// The zero-based child index requested.
    pub offset: u32,
}

/// One join-tree child, or end-of-list when `data` is absent.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct JoinTreeEntryMsg {
    /// The node whose children are being walked.
    pub node: NodeId,
    /// The child index this entry answers.
    pub offset: u32,
    /// The total number of children currently known to the responder.
    pub nkeys: u32,
    /// The full Accept envelope for this child, absent at end-of-list.
    pub data: Option<Vec<u8>>,
}

/// Acknowledges possession of a node's Accept message; used to spread
/// confidence in second-hand nodes.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct EndorsementMsg {
    /// The endorsed node.
    pub node: NodeId,
    /// The hash of that node's Accept envelope.
    pub accept_hash: [u8; HASH_SIZE],
}

/// A signed claim that a node now answers at a different address. Honoured
/// only when the envelope is signed by the named node itself.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct CommandeerMsg {
    /// The migrating node.
    pub node: NodeId,
    /// Its new network identity.
    pub identifier: NetworkIdentifierPair,
}

/// A vote to set one status bit on one node at one instant.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct ChmodMsg {
    /// The node whose status is being changed.
    pub node: NodeId,
    /// The instant at which the bit takes effect.
    pub effective: Instant,
    /// The bit to set.
    pub bit: StatusBit,
}

/// A vote in favour of admitting one application event.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct VoteMsg {
    /// The object the voted-for event applies to.
    pub object: ObjectId,
    /// The instant of the voted-for event.
    pub instant: Instant,
    /// The serial of the voted-for event.
    pub serial: EventSerial,
}

/// An application event produced by the sending node.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct AppEventMsg {
    /// The event serial, unique per origin node and instant.
    pub serial: EventSerial,
    /// The application-defined payload.
    pub data: Vec<u8>,
}

/// Point-to-point application data outside the simulation.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct AppUniMsg {
    /// The application-defined payload.
    pub data: Vec<u8>,
}

/// Declares the commit hash over the sender's committed-redistributable
/// messages in `[start, envelope instant]`.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct CommitMsg {
    /// The first instant the commit covers.
    pub start: Instant,
    /// SHA-3 over the ordered hashes of the covered messages.
    pub hash: [u8; HASH_SIZE],
}

/// Announces that the sender has a live route to a node.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct RouteMsg {
    /// The reachable node.
    pub node: NodeId,
}

/// Asks for the hash-tree directory at a nybble path.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct HtLsMsg {
    /// The hash whose prefix selects the path.
    pub hash: [u8; HASH_SIZE],
    /// How many nybbles of the hash to walk.
    pub offset: u8,
}

/// One slot of a hash-tree directory listing.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode)]
pub enum HtSlot {
    /// Nothing stored under this nybble.
    Empty,
    /// A single object; carries the low 64 bits of its hash.
    Object(u64),
    /// A subdirectory; carries its condensed hash.
    Dir(u64),
}

/// The answer to [`HtLsMsg`]: the sixteen slots of the directory.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct HtDirMsg {
    /// The path hash echoed from the query.
    pub hash: [u8; HASH_SIZE],
    /// The path length echoed from the query.
    pub offset: u8,
    /// The directory contents.
    pub slots: [HtSlot; HTDIR_SIZE],
}

/// Asks for the raw bytes of one stored message by full hash.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct HtReadMsg {
    /// The hash of the wanted message.
    pub hash: [u8; HASH_SIZE],
}

/// Asks for a run of stored messages in hash order.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct HtRangeMsg {
    /// Correlation id echoed by the terminating [`ReceivedMsg`].
    pub id: u32,
    /// The minimum hash to start from.
    pub hash: [u8; HASH_SIZE],
    /// The number of meaningful nybbles in `hash`.
    pub hashlen: u8,
    /// Only objects whose final hash byte ANDed with `mask` equals this
    /// are returned.
    pub offset: u8,
    /// The filter mask applied to the final hash byte.
    pub mask: u8,
}

/// Terminates a [`HtRangeMsg`] answer.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct ReceivedMsg {
    /// The correlation id of the range query.
    pub id: u32,
    /// How many objects were sent.
    pub count: u32,
}

/// The top-level wire message choice.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub enum Message {
    /// Route liveness probe (rpc).
    Ping(PingMsg),
    /// Probe answer (rpc).
    Pong(PongMsg),
    /// Join bootstrap query (rpc).
    GetNetworkInfo(GetNetworkInfoMsg),
    /// Join bootstrap answer (rpc).
    NetworkInfo(NetworkInfoMsg),
    /// Join request (rpc).
    JoinRequest(JoinRequestMsg),
    /// Join admission (uncommitted-redistributable).
    JoinAccept(JoinAcceptMsg),
    /// Join-tree walk query (rpc).
    JoinTree(JoinTreeMsg),
    /// Join-tree walk answer (rpc).
    JoinTreeEntry(JoinTreeEntryMsg),
    /// Accept-possession acknowledgment (uncommitted-redistributable).
    Endorsement(EndorsementMsg),
    /// Address migration claim (uncommitted-redistributable).
    Commandeer(CommandeerMsg),
    /// Status-bit vote (committed-redistributable).
    Chmod(ChmodMsg),
    /// Event admission vote (committed-redistributable).
    Vote(VoteMsg),
    /// Application event (committed-redistributable).
    AppEvent(AppEventMsg),
    /// Point-to-point application data (rpc).
    AppUni(AppUniMsg),
    /// Commit declaration (uncommitted-redistributable).
    Commit(CommitMsg),
    /// Route announcement (uncommitted-redistributable).
    Route(RouteMsg),
    /// Hash-tree directory query (rpc).
    HtLs(HtLsMsg),
    /// Hash-tree directory answer (rpc).
    HtDir(HtDirMsg),
    /// Hash-tree single-object fetch (rpc).
    HtRead(HtReadMsg),
    /// Hash-tree range fetch (rpc).
    HtRange(HtRangeMsg),
    /// Range-fetch terminator (rpc).
    Received(ReceivedMsg),
}

impl Message {
    /// The envelope class this message must travel in. Mixing classes
    /// inside one envelope is invalid.
    pub fn class(&self) -> MessageClass {
        match self {
            Message::Ping(_)
            | Message::Pong(_)
            | Message::GetNetworkInfo(_)
            | Message::NetworkInfo(_)
            | Message::JoinRequest(_)
            | Message::JoinTree(_)
            | Message::JoinTreeEntry(_)
            | Message::AppUni(_)
            | Message::HtLs(_)
            | Message::HtDir(_)
            | Message::HtRead(_)
            | Message::HtRange(_)
            | Message::Received(_) => MessageClass::Rpc,

            Message::JoinAccept(_)
            | Message::Endorsement(_)
            | Message::Commandeer(_)
            | Message::Commit(_)
            | Message::Route(_) => MessageClass::Uncommitted,

            Message::Chmod(_) | Message::Vote(_) | Message::AppEvent(_) => MessageClass::Committed,
        }
    }

    /// Message-level constraint checks, applied after structural decoding.
    pub fn check_constraints(&self) -> bool {
        match self {
            Message::JoinRequest(m) => m
                .auth
                .as_ref()
                .map(|auth| auth.len() <= AUTH_MAX)
                .unwrap_or(true),
            Message::JoinAccept(m) => m
                .request
                .auth
                .as_ref()
                .map(|auth| auth.len() <= AUTH_MAX)
                .unwrap_or(true),
            Message::AppEvent(m) => !m.data.is_empty(),
            Message::HtLs(m) => (m.offset as usize) < HASH_SIZE * 2,
            Message::HtDir(m) => (m.offset as usize) < HASH_SIZE * 2,
            Message::HtRange(m) => {
                (m.hashlen as usize) <= HASH_SIZE * 2 && m.offset & !m.mask == 0
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn classes_match_the_specification_table() {
        let rpc = Message::Ping(PingMsg { id: 1 });
        let ur = Message::Commit(CommitMsg {
            start: 0,
            hash: [0; HASH_SIZE],
        });
        let cr = Message::Chmod(ChmodMsg {
            node: 2,
            effective: 10,
            bit: StatusBit::Grant,
        });
        assert_eq!(rpc.class(), MessageClass::Rpc);
        assert_eq!(ur.class(), MessageClass::Uncommitted);
        assert_eq!(cr.class(), MessageClass::Committed);
    }

    #[test]
    fn flags_round_trip_and_reject_high_values() {
        for class in [
            MessageClass::Committed,
            MessageClass::Uncommitted,
            MessageClass::Rpc,
        ] {
            assert_eq!(MessageClass::from_flags(class.flags()), Some(class));
        }
        assert_eq!(MessageClass::from_flags(3), None);
    }

    #[test]
    fn messages_round_trip_through_the_canonical_codec() {
        let msg = Message::JoinRequest(JoinRequestMsg {
            public_key: [7; PUBKEY_SIZE],
            identifier: NetworkIdentifierPair {
                intranet: NetworkIdentifier {
                    port: 11000,
                    address: IpAddress::V4([127, 0, 0, 1]),
                },
                internet: None,
            },
            auth: Some(vec![1, 2, 3]),
        });
        let bytes = codec::to_bytes_canonical(&msg);
        let back: Message = codec::from_bytes_canonical(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn range_constraints_require_offset_within_mask() {
        let bad = Message::HtRange(HtRangeMsg {
            id: 0,
            hash: [0; HASH_SIZE],
            hashlen: 4,
            offset: 0x04,
            mask: 0x03,
        });
        assert!(!bad.check_constraints());
    }
}
