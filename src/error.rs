//! Structured error types for toroid.
//!
//! Membership-layer faults (timeouts, stale pointers) are repaired by
//! stabilization and never surface here unless a hop or retry budget is
//! exhausted. Storage-layer faults always surface to the caller.

use crate::ring::RingId;

/// The errors a ring operation can surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// An operation was issued against a ring with zero active nodes.
    #[error("ring has no active nodes")]
    RingEmpty,

    /// A lookup did not converge within its hop budget.
    #[error("lookup for {target} exceeded the hop budget")]
    HopBudgetExceeded { target: RingId },

    /// The owner and all known replicas reported a miss.
    #[error("key {key:?} not found")]
    KeyNotFound { key: String },

    /// A routing or replication peer timed out.
    #[error("node {0} is unreachable")]
    NodeUnreachable(RingId),

    /// Fewer than the configured minimum replicas acknowledged a write.
    /// The write is not rolled back; this is a durability warning.
    #[error("write of {key:?} acknowledged by {acked} of {required} replicas")]
    ReplicationShortfall {
        key: String,
        acked: usize,
        required: usize,
    },

    /// An id was referenced that is not registered in the runtime.
    #[error("node {0} is not registered")]
    NodeNotFound(RingId),

    /// Two nodes derived the same id. Resolved internally by
    /// re-derivation; surfaces only if re-derivation is impossible.
    #[error("id {0} is already taken")]
    DuplicateId(RingId),
}

/// Convenience alias for `Result<T, RingError>`.
pub type RingResult<T> = Result<T, RingError>;
