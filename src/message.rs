//! The closed set of messages exchanged on the bus.
//!
//! Every protocol interaction is one of these variants; node handlers
//! match exhaustively, so adding a message type is a compile-time
//! ripple, not a runtime surprise. Messages are ephemeral: created by a
//! sender action, consumed exactly once by the delivery event.

use crate::ring::RingId;
use crate::time::VirtualTime;

/// What a lookup should do once it reaches the key's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupAction {
    /// Resolve ownership only (joins, finger refresh, put phase one).
    Resolve,
    /// Read the value for `key`.
    Get { key: String },
    /// Remove `key` from the owner and its replicas.
    Delete { key: String },
}

/// How a lookup ended, carried back to the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The responder owns the target range.
    Resolved,
    /// Value found (get).
    Found { value: String },
    /// Owner reached but the key is absent everywhere it looked.
    NotFound { key: String },
    /// Key removed from the owner (delete).
    Deleted { key: String },
    /// The hop budget ran out before the owner was found.
    HopBudgetExhausted,
}

/// A cache line exported inside a piggyback block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheExport {
    /// Exclusive lower bound of the owned range.
    pub range_start: RingId,
    /// Owner of `(range_start, owner]`.
    pub owner: RingId,
    /// Replica set the exporter knew for that range.
    pub replicas: Vec<RingId>,
    /// Absolute expiry of the exported entry.
    pub expires_at: VirtualTime,
}

/// Routing metadata attached to replies (and forwarded lookups) so
/// that nodes on the path learn topology without extra round trips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Piggyback {
    /// Excerpt of the sender's finger table and long links.
    pub known_nodes: Vec<RingId>,
    /// Excerpt of the sender's lookup cache.
    pub cache: Vec<CacheExport>,
}

impl Piggyback {
    pub fn is_empty(&self) -> bool {
        self.known_nodes.is_empty() && self.cache.is_empty()
    }
}

/// A message on the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtMessage {
    /// A node asks to be inserted at its id; routed to the id's owner.
    JoinRequest { joiner: RingId, hops_left: u8 },
    /// The joiner's future successor hands back its ring position.
    JoinAccept {
        predecessor: RingId,
        successor: RingId,
        piggyback: Piggyback,
    },
    /// A departing node tells one neighbor how to re-link.
    LeaveNotice {
        departing: RingId,
        new_predecessor: Option<RingId>,
        new_successor: Option<RingId>,
    },
    /// Periodic successor check; the reply carries the successor's
    /// predecessor pointer so the sender can adopt a closer successor.
    Stabilize,
    StabilizeReply {
        predecessor: Option<RingId>,
        piggyback: Piggyback,
    },
    /// Liveness probe of a neighbor.
    Ping { token: u64 },
    Pong { token: u64 },
    /// A routed lookup for `target`, forwarded hop by hop.
    Lookup {
        op: u64,
        origin: RingId,
        target: RingId,
        action: LookupAction,
        hops_left: u8,
        hops_taken: u8,
        /// When set, answer from local data without forwarding.
        /// Used by the replica fallback path of `get`.
        direct: bool,
        piggyback: Piggyback,
    },
    /// Final answer of a lookup, sent straight back to the origin.
    LookupReply {
        op: u64,
        outcome: LookupOutcome,
        owner: RingId,
        /// Exclusive lower bound of the owner's range at reply time.
        range_start: RingId,
        replicas: Vec<RingId>,
        hops_taken: u8,
        piggyback: Piggyback,
    },
    /// Direct store request to a resolved owner (put phase two).
    Store {
        op: u64,
        origin: RingId,
        key: String,
        value: String,
        hops_left: u8,
    },
    /// Acknowledgment of a store. Replica → owner (`token` correlates
    /// the owner's pending write) and owner → origin (`op` correlates
    /// the origin's operation).
    StoreAck {
        op: u64,
        key: String,
        /// Replicas that acknowledged before the origin was answered.
        replicas_acked: usize,
        /// Set when fewer than the required replicas acknowledged.
        shortfall: bool,
    },
    /// Copy (or, with `value: None`, drop) a key on a replica holder.
    Replicate {
        key: String,
        value: Option<String>,
        /// Present when the owner is waiting on this ack for a
        /// synchronous put.
        ack_token: Option<u64>,
    },
    /// Bulk key movement on join/leave. `primaries` become the
    /// receiver's own keys; `replicas` enter its replica store.
    Transfer {
        primaries: Vec<(String, String)>,
        replicas: Vec<(String, String)>,
    },
    /// Announcement that `node` exists (join notify, pointer repair).
    /// Receivers fold it into fingers, long links and neighbor pointers.
    FingerUpdate { node: RingId },
}

impl DhtMessage {
    /// Short tag for traces and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            DhtMessage::JoinRequest { .. } => "JOIN_REQUEST",
            DhtMessage::JoinAccept { .. } => "JOIN_ACCEPT",
            DhtMessage::LeaveNotice { .. } => "LEAVE_NOTICE",
            DhtMessage::Stabilize => "STABILIZE",
            DhtMessage::StabilizeReply { .. } => "STABILIZE_REPLY",
            DhtMessage::Ping { .. } => "PING",
            DhtMessage::Pong { .. } => "PONG",
            DhtMessage::Lookup { .. } => "LOOKUP",
            DhtMessage::LookupReply { .. } => "LOOKUP_REPLY",
            DhtMessage::Store { .. } => "STORE",
            DhtMessage::StoreAck { .. } => "STORE_ACK",
            DhtMessage::Replicate { .. } => "REPLICATE",
            DhtMessage::Transfer { .. } => "TRANSFER",
            DhtMessage::FingerUpdate { .. } => "FINGER_UPDATE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(
            DhtMessage::JoinRequest {
                joiner: RingId::new(1),
                hops_left: 8
            }
            .tag(),
            "JOIN_REQUEST"
        );
        assert_eq!(DhtMessage::Stabilize.tag(), "STABILIZE");
        assert_eq!(
            DhtMessage::FingerUpdate {
                node: RingId::new(9)
            }
            .tag(),
            "FINGER_UPDATE"
        );
    }

    #[test]
    fn test_piggyback_empty() {
        assert!(Piggyback::default().is_empty());
        let pb = Piggyback {
            known_nodes: vec![RingId::new(3)],
            cache: Vec::new(),
        };
        assert!(!pb.is_empty());
    }
}
