//! The ring runtime: registry of nodes plus the event dispatch glue.
//!
//! Implements [`EventHandler`], so a [`Simulation`] drives it directly.
//! Deliveries to nodes that are failed, removed or unknown are dropped
//! here with a trace entry, which is what makes abrupt failures look
//! like silence to the rest of the ring.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::RingError;
use crate::event::EventType;
use crate::network::{NetworkBus, NetworkConfig};
use crate::node::{DhtNode, NodeCtx, OpCompletion, OpKind, ProtocolConfig};
use crate::ring::{RingId, RingSpace};
use crate::simulation::{EventHandler, SimulationContext};
use crate::snapshot::{NodeSnapshot, RingSnapshot, TraceEntry};
use crate::time::VirtualTime;

/// Owns every node of one simulated ring.
pub struct RingRuntime {
    space: RingSpace,
    cfg: ProtocolConfig,
    nodes: BTreeMap<RingId, DhtNode>,
    alive: BTreeSet<RingId>,
    bus: NetworkBus,
    trace: Vec<TraceEntry>,
    completions: Vec<OpCompletion>,
}

impl RingRuntime {
    pub fn new(space: RingSpace, cfg: ProtocolConfig, network: NetworkConfig, seed: u64) -> Self {
        RingRuntime {
            space,
            cfg,
            nodes: BTreeMap::new(),
            alive: BTreeSet::new(),
            bus: NetworkBus::new(network, seed),
            trace: Vec::new(),
            completions: Vec::new(),
        }
    }

    #[inline]
    pub fn space(&self) -> RingSpace {
        self.space
    }

    pub fn node(&self, id: RingId) -> Option<&DhtNode> {
        self.nodes.get(&id)
    }

    /// Ids of nodes currently able to receive traffic, ascending.
    pub fn alive_ids(&self) -> Vec<RingId> {
        self.alive.iter().copied().collect()
    }

    pub fn is_alive(&self, id: RingId) -> bool {
        self.alive.contains(&id)
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Every finished client operation so far, in completion order.
    pub fn completions(&self) -> &[OpCompletion] {
        &self.completions
    }

    /// Follow successor pointers once around the ring, starting from
    /// the smallest alive id. A healthy ring visits every alive node
    /// exactly once and in ascending rotated order.
    pub fn ring_walk(&self) -> Vec<RingId> {
        let Some(&start) = self.alive.first() else {
            return Vec::new();
        };
        let mut walk = vec![start];
        let mut cur = start;
        for _ in 0..self.alive.len() {
            let Some(node) = self.nodes.get(&cur) else {
                break;
            };
            let next = node.successor();
            if next == start {
                break;
            }
            walk.push(next);
            cur = next;
        }
        walk
    }

    /// Does the successor walk cover exactly the alive membership, in
    /// ring order?
    pub fn ring_is_consistent(&self) -> bool {
        let walk = self.ring_walk();
        if walk.len() != self.alive.len() {
            return false;
        }
        let expected: Vec<RingId> = self.alive.iter().copied().collect();
        // The walk starts at the minimum, so a sorted ring equals the
        // alive set in ascending order.
        walk == expected
    }

    /// Point-in-time export of ring state and the full trace.
    pub fn snapshot(&self, time: VirtualTime) -> RingSnapshot {
        let nodes = self
            .alive
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| NodeSnapshot {
                id: n.id(),
                state: n.state().as_str().to_string(),
                predecessor: n.predecessor(),
                successor: n.successor(),
                primary_keys: n.store().primary_len(),
                replica_keys: n.store().replica_len(),
                fingers: n.router().finger_links(),
                long_links: n.router().long_links(),
                angular_position: self.space.angular_position(n.id()),
            })
            .collect();
        RingSnapshot {
            time: time.ticks(),
            ring_bits: self.space.bits(),
            nodes,
            trace: self.trace.clone(),
        }
    }

    /// The node a client operation enters through: the requested one if
    /// it is alive, otherwise the lowest alive id.
    fn pick_via(&self, via: RingId) -> Option<RingId> {
        if self.alive.contains(&via) {
            Some(via)
        } else {
            self.alive.first().copied()
        }
    }

    fn reject_empty(&mut self, kind: OpKind, key: String, now: VirtualTime) {
        warn!(?kind, key, "operation against empty ring");
        self.completions.push(OpCompletion {
            origin: RingId::new(0),
            op: 0,
            kind,
            key,
            result: Err(RingError::RingEmpty),
            hops: 0,
            finished_at: now,
        });
    }
}

impl EventHandler for RingRuntime {
    fn handle(&mut self, event: EventType, sim: &mut SimulationContext<'_>) {
        match event {
            EventType::MessageDelivery { from, to, message } => {
                if !self.alive.contains(&to) {
                    self.trace.push(TraceEntry::new(
                        sim.now(),
                        "DROP_DEAD",
                        format!("{from}->{to} {}", message.tag()),
                    ));
                    return;
                }
                let Some(node) = self.nodes.get_mut(&to) else {
                    return;
                };
                let mut ctx = NodeCtx {
                    sim,
                    bus: &mut self.bus,
                    trace: &mut self.trace,
                };
                node.handle_message(from, message, &mut ctx);
                self.completions.extend(node.drain_completions());
            }
            EventType::TimerFired { node: id, timer } => {
                if !self.alive.contains(&id) {
                    return;
                }
                let Some(node) = self.nodes.get_mut(&id) else {
                    return;
                };
                let mut ctx = NodeCtx {
                    sim,
                    bus: &mut self.bus,
                    trace: &mut self.trace,
                };
                node.handle_timer(timer, &mut ctx);
                self.completions.extend(node.drain_completions());
            }
            EventType::NodeJoin { id, bootstrap } => {
                if self.nodes.contains_key(&id) {
                    warn!(node = %id, "duplicate id rejected");
                    self.trace
                        .push(TraceEntry::new(sim.now(), "DUP_ID", format!("{id}")));
                    return;
                }
                let peer = bootstrap
                    .filter(|b| self.alive.contains(b))
                    .or_else(|| self.alive.first().copied());
                self.trace.push(TraceEntry::new(
                    sim.now(),
                    "NODE_JOIN",
                    format!("{id} via {peer:?}"),
                ));
                let mut node = DhtNode::new(self.space, id, self.cfg);
                self.alive.insert(id);
                let mut ctx = NodeCtx {
                    sim,
                    bus: &mut self.bus,
                    trace: &mut self.trace,
                };
                node.start(peer, &mut ctx);
                self.nodes.insert(id, node);
            }
            EventType::NodeLeave { id } => {
                if !self.alive.remove(&id) {
                    return;
                }
                self.trace
                    .push(TraceEntry::new(sim.now(), "NODE_LEAVE", format!("{id}")));
                if let Some(node) = self.nodes.get_mut(&id) {
                    let mut ctx = NodeCtx {
                        sim,
                        bus: &mut self.bus,
                        trace: &mut self.trace,
                    };
                    node.begin_leave(&mut ctx);
                    self.completions.extend(node.drain_completions());
                }
            }
            EventType::NodeFail { id } => {
                if !self.alive.remove(&id) {
                    return;
                }
                self.trace
                    .push(TraceEntry::new(sim.now(), "NODE_FAIL", format!("{id}")));
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.fail();
                }
            }
            EventType::ClientPut { via, key, value } => match self.pick_via(via) {
                None => self.reject_empty(OpKind::Put, key, sim.now()),
                Some(entry) => {
                    if let Some(node) = self.nodes.get_mut(&entry) {
                        let mut ctx = NodeCtx {
                            sim,
                            bus: &mut self.bus,
                            trace: &mut self.trace,
                        };
                        let op = node.begin_put(key, value, &mut ctx);
                        debug!(via = %entry, op, "put started");
                        self.completions.extend(node.drain_completions());
                    }
                }
            },
            EventType::ClientGet { via, key } => match self.pick_via(via) {
                None => self.reject_empty(OpKind::Get, key, sim.now()),
                Some(entry) => {
                    if let Some(node) = self.nodes.get_mut(&entry) {
                        let mut ctx = NodeCtx {
                            sim,
                            bus: &mut self.bus,
                            trace: &mut self.trace,
                        };
                        let op = node.begin_get(key, &mut ctx);
                        debug!(via = %entry, op, "get started");
                        self.completions.extend(node.drain_completions());
                    }
                }
            },
            EventType::ClientDelete { via, key } => match self.pick_via(via) {
                None => self.reject_empty(OpKind::Delete, key, sim.now()),
                Some(entry) => {
                    if let Some(node) = self.nodes.get_mut(&entry) {
                        let mut ctx = NodeCtx {
                            sim,
                            bus: &mut self.bus,
                            trace: &mut self.trace,
                        };
                        let op = node.begin_delete(key, &mut ctx);
                        debug!(via = %entry, op, "delete started");
                        self.completions.extend(node.drain_completions());
                    }
                }
            },
            EventType::PartitionStart { group } => {
                self.trace.push(TraceEntry::new(
                    sim.now(),
                    "PARTITION",
                    format!("{} nodes isolated", group.len()),
                ));
                self.bus.split(group);
            }
            EventType::PartitionEnd => {
                self.trace
                    .push(TraceEntry::new(sim.now(), "HEAL", String::new()));
                self.bus.heal();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::OpOutcome;
    use crate::simulation::Simulation;

    fn quiet_net() -> NetworkConfig {
        NetworkConfig {
            base_latency: 1,
            jitter: 0,
            drop_probability: 0.0,
        }
    }

    fn runtime() -> RingRuntime {
        RingRuntime::new(
            RingSpace::new(8),
            ProtocolConfig::default(),
            quiet_net(),
            7,
        )
    }

    #[test]
    fn test_empty_ring_rejects_operations() {
        let mut sim = Simulation::new();
        let mut rt = runtime();
        sim.schedule_at(
            VirtualTime::ZERO,
            EventType::ClientGet {
                via: RingId::new(1),
                key: "k".into(),
            },
        );
        sim.run_to_completion(&mut rt, 100);

        assert_eq!(rt.completions().len(), 1);
        assert_eq!(rt.completions()[0].result, Err(RingError::RingEmpty));
    }

    #[test]
    fn test_two_nodes_link_up() {
        let mut sim = Simulation::new();
        let mut rt = runtime();
        sim.schedule_at(
            VirtualTime::ZERO,
            EventType::NodeJoin {
                id: RingId::new(10),
                bootstrap: None,
            },
        );
        sim.schedule_at(
            VirtualTime::new(5),
            EventType::NodeJoin {
                id: RingId::new(120),
                bootstrap: Some(RingId::new(10)),
            },
        );
        sim.run_until(&mut rt, VirtualTime::new(200));

        let a = rt.node(RingId::new(10)).unwrap();
        let b = rt.node(RingId::new(120)).unwrap();
        assert_eq!(a.successor(), RingId::new(120));
        assert_eq!(b.successor(), RingId::new(10));
        assert_eq!(a.predecessor(), Some(RingId::new(120)));
        assert_eq!(b.predecessor(), Some(RingId::new(10)));
        assert!(rt.ring_is_consistent());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut sim = Simulation::new();
        let mut rt = runtime();
        for t in [0u64, 5] {
            sim.schedule_at(
                VirtualTime::new(t),
                EventType::NodeJoin {
                    id: RingId::new(10),
                    bootstrap: None,
                },
            );
        }
        sim.run_until(&mut rt, VirtualTime::new(100));
        assert_eq!(rt.alive_ids(), vec![RingId::new(10)]);
        assert!(rt.trace().iter().any(|t| t.kind == "DUP_ID"));
    }

    #[test]
    fn test_sole_node_serves_storage_locally() {
        let mut sim = Simulation::new();
        let mut rt = runtime();
        sim.schedule_at(
            VirtualTime::ZERO,
            EventType::NodeJoin {
                id: RingId::new(10),
                bootstrap: None,
            },
        );
        sim.schedule_at(
            VirtualTime::new(1),
            EventType::ClientPut {
                via: RingId::new(10),
                key: "alpha".into(),
                value: "1".into(),
            },
        );
        sim.schedule_at(
            VirtualTime::new(2),
            EventType::ClientGet {
                via: RingId::new(10),
                key: "alpha".into(),
            },
        );
        sim.run_until(&mut rt, VirtualTime::new(100));

        let results: Vec<_> = rt.completions().iter().map(|c| &c.result).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(*results[0], Ok(OpOutcome::Stored { replicas_acked: 0 }));
        assert_eq!(*results[1], Ok(OpOutcome::Value("1".into())));
    }

    #[test]
    fn test_snapshot_lists_alive_nodes_sorted() {
        let mut sim = Simulation::new();
        let mut rt = runtime();
        sim.schedule_at(
            VirtualTime::ZERO,
            EventType::NodeJoin {
                id: RingId::new(120),
                bootstrap: None,
            },
        );
        sim.schedule_at(
            VirtualTime::new(5),
            EventType::NodeJoin {
                id: RingId::new(10),
                bootstrap: Some(RingId::new(120)),
            },
        );
        sim.run_until(&mut rt, VirtualTime::new(100));

        let snap = rt.snapshot(sim.now());
        let ids: Vec<u64> = snap.nodes.iter().map(|n| n.id.raw()).collect();
        assert_eq!(ids, vec![10, 120]);
        assert!(snap.nodes[0].angular_position < snap.nodes[1].angular_position);
    }

    #[test]
    fn test_snapshot_exports_routing_links() {
        let mut sim = Simulation::new();
        let cfg = ProtocolConfig {
            routing_mode: crate::routing::RoutingMode::Advanced,
            ..ProtocolConfig::default()
        };
        let mut rt = RingRuntime::new(RingSpace::new(8), cfg, quiet_net(), 7);
        for (t, id) in [(0u64, 10u64), (20, 120), (40, 200)] {
            sim.schedule_at(
                VirtualTime::new(t),
                EventType::NodeJoin {
                    id: RingId::new(id),
                    bootstrap: (id != 10).then(|| RingId::new(10)),
                },
            );
        }
        sim.run_until(&mut rt, VirtualTime::new(300));

        let snap = rt.snapshot(sim.now());
        for n in &snap.nodes {
            assert!(!n.fingers.is_empty(), "node {} exports no fingers", n.id);
            assert!(!n.long_links.is_empty(), "node {} exports no long links", n.id);
            assert!(!n.fingers.contains(&n.id));
        }
    }
}
