//! toroid — a deterministic discrete-event simulator for a
//! consistent-hashing DHT ring.
//!
//! Nodes on an m-bit identifier ring join, stabilize, leave and fail
//! while clients put, get and delete keys. Everything runs inside a
//! single-threaded event loop over virtual time: message latencies,
//! drops and partitions come from a seeded generator, so a scenario and
//! a seed fully determine the run. Replaying with the same seed yields
//! the same trace, byte for byte.
//!
//! ```no_run
//! use toroid::{SimConfig, VirtualTime};
//!
//! let cfg = SimConfig::default();
//! let (mut sim, mut ring, _ids) = cfg.build();
//! sim.run_until(&mut ring, VirtualTime::new(1_000));
//! let snapshot = ring.snapshot(sim.now());
//! println!("{}", snapshot.to_json().unwrap());
//! ```

pub mod error;
pub mod event;
pub mod message;
pub mod network;
pub mod node;
pub mod ring;
pub mod routing;
pub mod runtime;
pub mod scenario;
pub mod scheduler;
pub mod simulation;
pub mod snapshot;
pub mod storage;
pub mod time;

pub use error::{RingError, RingResult};
pub use event::{EventId, EventType, TimerKind};
pub use message::{DhtMessage, LookupAction, LookupOutcome};
pub use network::{NetworkBus, NetworkConfig, NetworkDecision};
pub use node::{
    DhtNode, NodeState, OpCompletion, OpKind, OpOutcome, ProtocolConfig, ReplicationMode,
};
pub use ring::{RingId, RingSpace};
pub use routing::{Router, RoutingMode};
pub use runtime::RingRuntime;
pub use scenario::{ChurnAction, ChurnEvent, SimConfig};
pub use simulation::{EventHandler, Simulation, SimulationContext};
pub use snapshot::{NodeSnapshot, RingSnapshot, TraceEntry};
pub use time::VirtualTime;
