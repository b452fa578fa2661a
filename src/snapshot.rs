//! Exportable views of a run: the ring snapshot and the event trace.
//!
//! Both are plain serializable data. Two runs of the same scenario with
//! the same seed produce byte-identical exports, which is how replay is
//! verified.

use crate::ring::RingId;
use crate::time::VirtualTime;

/// One line of the append-only run trace.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TraceEntry {
    pub time: u64,
    pub kind: String,
    pub detail: String,
}

impl TraceEntry {
    pub fn new(time: VirtualTime, kind: &str, detail: String) -> Self {
        TraceEntry {
            time: time.ticks(),
            kind: kind.to_string(),
            detail,
        }
    }
}

/// State of one node at snapshot time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeSnapshot {
    pub id: RingId,
    pub state: String,
    pub predecessor: Option<RingId>,
    pub successor: RingId,
    pub primary_keys: usize,
    pub replica_keys: usize,
    /// Distinct finger targets; empty under basic routing.
    pub fingers: Vec<RingId>,
    /// Long-link shortcuts, ascending.
    pub long_links: Vec<RingId>,
    /// Position on the ring as a fraction of a full turn, for layouts.
    pub angular_position: f64,
}

/// Full ring state plus the trace, ready for export.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RingSnapshot {
    pub time: u64,
    pub ring_bits: u8,
    /// Active nodes in ascending id order.
    pub nodes: Vec<NodeSnapshot>,
    pub trace: Vec<TraceEntry>,
}

impl RingSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Order-insensitive equality of membership, for replay checks
    /// where traces are compared separately.
    pub fn same_membership(&self, other: &RingSnapshot) -> bool {
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(other.nodes.iter())
                .all(|(a, b)| a.id == b.id && a.state == b.state)
    }
}
