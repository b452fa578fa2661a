//! Scenario configuration: turns a declarative description of a run
//! into a seeded simulation.
//!
//! Node ids are derived from the seed, so the same [`SimConfig`]
//! always produces the same membership, the same schedule and, through
//! the seeded bus, the same run.

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::event::EventType;
use crate::network::NetworkConfig;
use crate::node::ProtocolConfig;
use crate::ring::{RingId, RingSpace};
use crate::runtime::RingRuntime;
use crate::simulation::Simulation;
use crate::time::VirtualTime;

/// One scheduled disturbance or client operation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChurnAction {
    /// A fresh node (id derived from the seed) joins.
    Join,
    Leave(RingId),
    Fail(RingId),
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    /// Isolate the listed nodes from the rest of the ring.
    Partition(Vec<RingId>),
    Heal,
}

/// A churn action at an absolute virtual time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChurnEvent {
    pub at: u64,
    pub action: ChurnAction,
}

/// Everything that defines a run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SimConfig {
    pub ring_bits: u8,
    /// Nodes joined during ramp-up, before any churn.
    pub node_count: usize,
    pub random_seed: u64,
    /// Ticks between consecutive ramp-up joins.
    pub join_spacing: u64,
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub churn: Vec<ChurnEvent>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            ring_bits: 16,
            node_count: 8,
            random_seed: 42,
            join_spacing: 10,
            network: NetworkConfig::default(),
            protocol: ProtocolConfig::default(),
            churn: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Materialize the scenario. Returns the engine, the ring model
    /// and the ramp-up node ids in join order.
    pub fn build(&self) -> (Simulation, RingRuntime, Vec<RingId>) {
        let space = RingSpace::new(self.ring_bits);
        let mut rng = ChaCha8Rng::seed_from_u64(self.random_seed);
        // Decorrelate the bus stream from the id stream.
        let bus_seed = self.random_seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let runtime = RingRuntime::new(space, self.protocol, self.network, bus_seed);
        let mut sim = Simulation::new();

        let mut taken = BTreeSet::new();
        let mut ids = Vec::with_capacity(self.node_count);
        let mut bootstrap = None;
        for i in 0..self.node_count {
            let id = derive_id(&mut rng, space, &taken);
            taken.insert(id);
            ids.push(id);
            sim.schedule_at(
                VirtualTime::new(i as u64 * self.join_spacing),
                EventType::NodeJoin { id, bootstrap },
            );
            if bootstrap.is_none() {
                bootstrap = Some(id);
            }
        }

        for ev in &self.churn {
            let via = if ids.is_empty() {
                RingId::new(0)
            } else {
                ids[rng.gen_range(0..ids.len())]
            };
            let event = match &ev.action {
                ChurnAction::Join => {
                    let id = derive_id(&mut rng, space, &taken);
                    taken.insert(id);
                    EventType::NodeJoin { id, bootstrap }
                }
                ChurnAction::Leave(id) => EventType::NodeLeave { id: *id },
                ChurnAction::Fail(id) => EventType::NodeFail { id: *id },
                ChurnAction::Put { key, value } => EventType::ClientPut {
                    via,
                    key: key.clone(),
                    value: value.clone(),
                },
                ChurnAction::Get { key } => EventType::ClientGet {
                    via,
                    key: key.clone(),
                },
                ChurnAction::Delete { key } => EventType::ClientDelete {
                    via,
                    key: key.clone(),
                },
                ChurnAction::Partition(group) => EventType::PartitionStart {
                    group: group.clone(),
                },
                ChurnAction::Heal => EventType::PartitionEnd,
            };
            sim.schedule_at(VirtualTime::new(ev.at), event);
        }

        // The runtime is configured but owns no nodes yet; the first
        // dispatched NodeJoin creates them.
        (sim, runtime, ids)
    }
}

fn derive_id(rng: &mut ChaCha8Rng, space: RingSpace, taken: &BTreeSet<RingId>) -> RingId {
    loop {
        let id = space.wrap(rng.gen());
        if !taken.contains(&id) {
            return id;
        }
    }
}
