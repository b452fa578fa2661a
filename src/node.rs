//! A single DHT node: membership, storage and the message handlers.
//!
//! Nodes never call each other. Every interaction is a message handed
//! to [`NodeCtx::send`], which consults the bus and schedules a
//! delivery event; the runtime routes the delivery back into
//! [`DhtNode::handle_message`]. Timers work the same way. This keeps
//! each handler a plain synchronous function over node state, which is
//! what makes runs reproducible.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{RingError, RingResult};
use crate::event::{EventId, EventType, TimerKind};
use crate::message::{DhtMessage, LookupAction, LookupOutcome};
use crate::network::{NetworkBus, NetworkDecision};
use crate::ring::{RingId, RingSpace};
use crate::routing::{Router, RoutingMode};
use crate::simulation::SimulationContext;
use crate::snapshot::TraceEntry;
use crate::storage::KeyStore;
use crate::time::VirtualTime;

/// How writes propagate to replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReplicationMode {
    /// The client ack waits for at least `min_acks` replica acks
    /// (capped by the number of replicas that exist).
    Sync { min_acks: usize },
    /// The client is acked immediately; replicas catch up in the
    /// background.
    Eventual,
}

/// Protocol knobs shared by every node in a run.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolConfig {
    /// Neighbors each key is copied to (predecessor and successor).
    pub replication_factor: usize,
    pub replication_mode: ReplicationMode,
    pub routing_mode: RoutingMode,
    /// Ticks between maintenance rounds.
    pub stabilization_interval: u64,
    /// Forwards a routed message may take before aborting.
    pub hop_budget: u8,
    /// Ticks before a pending client operation gives up.
    pub op_timeout: u64,
    /// Ticks an owner waits for replica acks of a synchronous write.
    pub write_ack_timeout: u64,
    /// Ticks a lookup cache entry stays live.
    pub cache_ttl: u64,
    /// Ticks before an unanswered join request is re-sent.
    pub join_retry_interval: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            replication_factor: 2,
            replication_mode: ReplicationMode::Sync { min_acks: 1 },
            routing_mode: RoutingMode::Basic,
            stabilization_interval: 25,
            hop_budget: 64,
            op_timeout: 50,
            write_ack_timeout: 20,
            cache_ttl: 120,
            join_retry_interval: 30,
        }
    }
}

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Joining,
    Active,
    Leaving,
    Removed,
    Failed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Joining => "JOINING",
            NodeState::Active => "ACTIVE",
            NodeState::Leaving => "LEAVING",
            NodeState::Removed => "REMOVED",
            NodeState::Failed => "FAILED",
        }
    }
}

/// Kind of a client operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Get,
    Delete,
}

/// Successful result of a client operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Stored { replicas_acked: usize },
    Value(String),
    Deleted,
}

/// Final record of a client operation, drained by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct OpCompletion {
    pub origin: RingId,
    pub op: u64,
    pub kind: OpKind,
    pub key: String,
    pub result: RingResult<OpOutcome>,
    pub hops: u8,
    pub finished_at: VirtualTime,
}

/// A client operation this node originated and is waiting on.
#[derive(Debug)]
struct PendingOp {
    kind: OpKind,
    key: String,
    /// Put payload held until ownership is resolved.
    value: Option<String>,
    target: RingId,
    /// Replica holders still untried by the get fallback path.
    fallback: Vec<RingId>,
    /// The peer whose answer we are waiting for.
    last_peer: RingId,
    hops: u8,
    timeout: EventId,
}

/// A write this node owns and is collecting replica acks for.
#[derive(Debug)]
struct PendingWrite {
    origin: RingId,
    op: u64,
    key: String,
    acked: usize,
    required: usize,
}

/// Side-effect surface handed to node handlers by the runtime.
pub struct NodeCtx<'a, 'b> {
    pub sim: &'a mut SimulationContext<'b>,
    pub bus: &'a mut NetworkBus,
    pub trace: &'a mut Vec<TraceEntry>,
}

impl NodeCtx<'_, '_> {
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.sim.now()
    }

    /// Put a message on the bus. Dropped and partitioned messages are
    /// traced but otherwise vanish, exactly like on a real network.
    pub fn send(&mut self, from: RingId, to: RingId, message: DhtMessage) {
        match self.bus.decide(from, to) {
            NetworkDecision::Deliver { delay } => {
                self.trace.push(TraceEntry::new(
                    self.sim.now(),
                    "SEND",
                    format!("{from}->{to} {}", message.tag()),
                ));
                self.sim
                    .schedule_after(delay, EventType::MessageDelivery { from, to, message });
            }
            NetworkDecision::Drop => {
                self.trace.push(TraceEntry::new(
                    self.sim.now(),
                    "DROP",
                    format!("{from}->{to} {}", message.tag()),
                ));
            }
            NetworkDecision::Partitioned => {
                self.trace.push(TraceEntry::new(
                    self.sim.now(),
                    "PARTITIONED",
                    format!("{from}->{to} {}", message.tag()),
                ));
            }
        }
    }

    pub fn timer(&mut self, node: RingId, delay: u64, timer: TimerKind) -> EventId {
        self.sim
            .schedule_after(delay, EventType::TimerFired { node, timer })
    }

    pub fn cancel(&mut self, id: EventId) {
        self.sim.cancel(id);
    }

    /// Record a node-level transition in the trace.
    pub fn note(&mut self, kind: &str, detail: String) {
        self.trace
            .push(TraceEntry::new(self.sim.now(), kind, detail));
    }
}

/// One participant in the ring.
#[derive(Debug)]
pub struct DhtNode {
    id: RingId,
    space: RingSpace,
    cfg: ProtocolConfig,
    state: NodeState,
    predecessor: Option<RingId>,
    successor: RingId,
    router: Router,
    store: KeyStore,
    bootstrap: Option<RingId>,
    seq: u64,
    pending_ops: BTreeMap<u64, PendingOp>,
    pending_writes: BTreeMap<u64, PendingWrite>,
    pending_refresh: BTreeMap<u64, u8>,
    pending_pings: BTreeMap<u64, RingId>,
    /// Set when a stabilize round is in flight; still set at the next
    /// round means the successor never answered.
    stabilize_pending: bool,
    completions: Vec<OpCompletion>,
}

impl DhtNode {
    pub fn new(space: RingSpace, id: RingId, cfg: ProtocolConfig) -> Self {
        DhtNode {
            id,
            space,
            state: NodeState::Joining,
            predecessor: None,
            successor: id,
            router: Router::new(space, id, cfg.routing_mode, cfg.cache_ttl),
            store: KeyStore::new(space),
            bootstrap: None,
            seq: 0,
            pending_ops: BTreeMap::new(),
            pending_writes: BTreeMap::new(),
            pending_refresh: BTreeMap::new(),
            pending_pings: BTreeMap::new(),
            stabilize_pending: false,
            completions: Vec::new(),
            cfg,
        }
    }

    #[inline]
    pub fn id(&self) -> RingId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[inline]
    pub fn predecessor(&self) -> Option<RingId> {
        self.predecessor
    }

    #[inline]
    pub fn successor(&self) -> RingId {
        self.successor
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn drain_completions(&mut self) -> Vec<OpCompletion> {
        std::mem::take(&mut self.completions)
    }

    /// Does this node own identifier `k`?
    ///
    /// The owned range is `(predecessor, self]`. With no predecessor
    /// the successor stands in as the lower bound; a sole node (both
    /// pointers at itself) owns the whole ring.
    pub fn owns(&self, k: RingId) -> bool {
        let lower = self.predecessor.unwrap_or(self.successor);
        self.space.in_open_closed(k, lower, self.id)
    }

    /// Enter the ring. With no bootstrap the node starts a fresh ring
    /// by itself; otherwise it routes a join request to the owner of
    /// its id.
    pub fn start(&mut self, bootstrap: Option<RingId>, ctx: &mut NodeCtx<'_, '_>) {
        self.bootstrap = bootstrap;
        match bootstrap {
            None => {
                self.state = NodeState::Active;
                self.successor = self.id;
                self.predecessor = None;
                ctx.note("STATE", format!("{} JOINING->ACTIVE (first node)", self.id));
                ctx.timer(self.id, self.cfg.stabilization_interval, TimerKind::Stabilize);
            }
            Some(peer) => {
                debug!(node = %self.id, via = %peer, "joining ring");
                ctx.send(
                    self.id,
                    peer,
                    DhtMessage::JoinRequest {
                        joiner: self.id,
                        hops_left: self.cfg.hop_budget,
                    },
                );
                ctx.timer(self.id, self.cfg.join_retry_interval, TimerKind::JoinRetry);
            }
        }
    }

    /// Graceful departure: hand all keys to the successor and tell both
    /// neighbors how to re-link around us.
    pub fn begin_leave(&mut self, ctx: &mut NodeCtx<'_, '_>) {
        if self.state != NodeState::Active {
            self.state = NodeState::Removed;
            return;
        }
        self.state = NodeState::Leaving;
        ctx.note("STATE", format!("{} ACTIVE->LEAVING", self.id));

        // Replies to operations in flight can never reach us again;
        // abort them now rather than losing them silently.
        let abandoned = std::mem::take(&mut self.pending_ops);
        for (op, p) in abandoned {
            let err = if self.successor == self.id {
                RingError::RingEmpty
            } else {
                RingError::NodeUnreachable(self.id)
            };
            self.complete(op, p, Err(err), ctx);
        }

        let succ = self.successor;
        let pred = self.predecessor;
        if succ != self.id {
            let (primaries, replicas) = self.store.drain_all();
            if !primaries.is_empty() || !replicas.is_empty() {
                ctx.send(self.id, succ, DhtMessage::Transfer { primaries, replicas });
            }
            ctx.send(
                self.id,
                succ,
                DhtMessage::LeaveNotice {
                    departing: self.id,
                    new_predecessor: Some(pred.unwrap_or(succ)),
                    new_successor: None,
                },
            );
        }
        if let Some(p) = pred {
            if p != self.id {
                ctx.send(
                    self.id,
                    p,
                    DhtMessage::LeaveNotice {
                        departing: self.id,
                        new_predecessor: None,
                        new_successor: Some(if succ != self.id { succ } else { p }),
                    },
                );
            }
        }
        self.state = NodeState::Removed;
        ctx.note("STATE", format!("{} LEAVING->REMOVED", self.id));
    }

    /// Abrupt failure. No messages; neighbors find out on their own.
    pub fn fail(&mut self) {
        self.state = NodeState::Failed;
    }

    // ---- client operations -------------------------------------------

    /// Start a put. Returns the operation id under which the completion
    /// will be reported.
    pub fn begin_put(&mut self, key: String, value: String, ctx: &mut NodeCtx<'_, '_>) -> u64 {
        let op = self.next_seq();
        let target = self.space.key_id(&key);
        let timeout = ctx.timer(self.id, self.cfg.op_timeout, TimerKind::OpTimeout { op });

        if self.owns(target) {
            self.pending_ops.insert(
                op,
                PendingOp {
                    kind: OpKind::Put,
                    key: key.clone(),
                    value: None,
                    target,
                    fallback: Vec::new(),
                    last_peer: self.id,
                    hops: 0,
                    timeout,
                },
            );
            self.apply_store(self.id, op, key, value, ctx);
            return op;
        }

        let cached_owner = self
            .router
            .cache_lookup(target, ctx.now())
            .map(|e| e.owner);
        let (last_peer, value_slot) = match cached_owner {
            Some(owner) => {
                ctx.send(
                    self.id,
                    owner,
                    DhtMessage::Store {
                        op,
                        origin: self.id,
                        key: key.clone(),
                        value: value.clone(),
                        hops_left: self.cfg.hop_budget,
                    },
                );
                (owner, None)
            }
            None => {
                let hop = self.router.next_hop(target, self.successor);
                let pb = self.router.piggyback(ctx.now());
                ctx.send(
                    self.id,
                    hop,
                    DhtMessage::Lookup {
                        op,
                        origin: self.id,
                        target,
                        action: LookupAction::Resolve,
                        hops_left: self.cfg.hop_budget,
                        hops_taken: 1,
                        direct: false,
                        piggyback: pb,
                    },
                );
                (hop, Some(value))
            }
        };
        self.pending_ops.insert(
            op,
            PendingOp {
                kind: OpKind::Put,
                key,
                value: value_slot,
                target,
                fallback: Vec::new(),
                last_peer,
                hops: 0,
                timeout,
            },
        );
        op
    }

    /// Start a get. Cache hits go straight to the remembered owner;
    /// if that misses, the remembered replicas are tried in turn.
    pub fn begin_get(&mut self, key: String, ctx: &mut NodeCtx<'_, '_>) -> u64 {
        let op = self.next_seq();
        let target = self.space.key_id(&key);

        if self.owns(target) {
            let result = match self.store.get_any(&key) {
                Some(v) => Ok(OpOutcome::Value(v.to_string())),
                None => Err(RingError::KeyNotFound { key: key.clone() }),
            };
            self.completions.push(OpCompletion {
                origin: self.id,
                op,
                kind: OpKind::Get,
                key,
                result,
                hops: 0,
                finished_at: ctx.now(),
            });
            return op;
        }

        let timeout = ctx.timer(self.id, self.cfg.op_timeout, TimerKind::OpTimeout { op });
        let (peer, direct, fallback) = match self.router.cache_lookup(target, ctx.now()) {
            Some(entry) => {
                let fallback: Vec<RingId> = entry
                    .replicas
                    .iter()
                    .copied()
                    .filter(|r| *r != self.id && *r != entry.owner)
                    .collect();
                (entry.owner, true, fallback)
            }
            None => (self.router.next_hop(target, self.successor), false, Vec::new()),
        };
        let pb = self.router.piggyback(ctx.now());
        ctx.send(
            self.id,
            peer,
            DhtMessage::Lookup {
                op,
                origin: self.id,
                target,
                action: LookupAction::Get { key: key.clone() },
                hops_left: self.cfg.hop_budget,
                hops_taken: 1,
                direct,
                piggyback: pb,
            },
        );
        self.pending_ops.insert(
            op,
            PendingOp {
                kind: OpKind::Get,
                key,
                value: None,
                target,
                fallback,
                last_peer: peer,
                hops: 0,
                timeout,
            },
        );
        op
    }

    /// Start a delete. Always routed; a stale cached owner would
    /// otherwise report a false miss.
    pub fn begin_delete(&mut self, key: String, ctx: &mut NodeCtx<'_, '_>) -> u64 {
        let op = self.next_seq();
        let target = self.space.key_id(&key);

        if self.owns(target) {
            let result = self.apply_delete(&key, ctx);
            self.completions.push(OpCompletion {
                origin: self.id,
                op,
                kind: OpKind::Delete,
                key,
                result,
                hops: 0,
                finished_at: ctx.now(),
            });
            return op;
        }

        let timeout = ctx.timer(self.id, self.cfg.op_timeout, TimerKind::OpTimeout { op });
        let hop = self.router.next_hop(target, self.successor);
        let pb = self.router.piggyback(ctx.now());
        ctx.send(
            self.id,
            hop,
            DhtMessage::Lookup {
                op,
                origin: self.id,
                target,
                action: LookupAction::Delete { key: key.clone() },
                hops_left: self.cfg.hop_budget,
                hops_taken: 1,
                direct: false,
                piggyback: pb,
            },
        );
        self.pending_ops.insert(
            op,
            PendingOp {
                kind: OpKind::Delete,
                key,
                value: None,
                target,
                fallback: Vec::new(),
                last_peer: hop,
                hops: 0,
                timeout,
            },
        );
        op
    }

    // ---- dispatch ----------------------------------------------------

    pub fn handle_message(
        &mut self,
        from: RingId,
        message: DhtMessage,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        if matches!(self.state, NodeState::Removed | NodeState::Failed) {
            return;
        }
        match message {
            DhtMessage::JoinRequest { joiner, hops_left } => {
                self.on_join_request(joiner, hops_left, ctx)
            }
            DhtMessage::JoinAccept {
                predecessor,
                successor: _,
                piggyback,
            } => self.on_join_accept(from, predecessor, piggyback, ctx),
            DhtMessage::LeaveNotice {
                departing,
                new_predecessor,
                new_successor,
            } => self.on_leave_notice(departing, new_predecessor, new_successor, ctx),
            DhtMessage::Stabilize => self.on_stabilize(from, ctx),
            DhtMessage::StabilizeReply {
                predecessor,
                piggyback,
            } => self.on_stabilize_reply(from, predecessor, piggyback, ctx),
            DhtMessage::Ping { token } => {
                self.router.observe_node(from);
                ctx.send(self.id, from, DhtMessage::Pong { token });
            }
            DhtMessage::Pong { token } => {
                self.pending_pings.remove(&token);
            }
            DhtMessage::Lookup {
                op,
                origin,
                target,
                action,
                hops_left,
                hops_taken,
                direct,
                piggyback,
            } => {
                self.router.absorb(&piggyback, ctx.now());
                self.router.observe_node(from);
                self.router.observe_node(origin);
                self.on_lookup(op, origin, target, action, hops_left, hops_taken, direct, ctx)
            }
            DhtMessage::LookupReply {
                op,
                outcome,
                owner,
                range_start,
                replicas,
                hops_taken,
                piggyback,
            } => {
                self.router.absorb(&piggyback, ctx.now());
                self.on_lookup_reply(op, outcome, owner, range_start, replicas, hops_taken, ctx)
            }
            DhtMessage::Store {
                op,
                origin,
                key,
                value,
                hops_left,
            } => self.on_store(origin, op, key, value, hops_left, ctx),
            DhtMessage::StoreAck {
                op,
                key,
                replicas_acked,
                shortfall,
            } => self.on_store_ack(op, key, replicas_acked, shortfall, ctx),
            DhtMessage::Replicate {
                key,
                value,
                ack_token,
            } => self.on_replicate(from, key, value, ack_token, ctx),
            DhtMessage::Transfer { primaries, replicas } => {
                self.on_transfer(from, primaries, replicas, ctx)
            }
            DhtMessage::FingerUpdate { node } => self.on_finger_update(node, ctx),
        }
    }

    pub fn handle_timer(&mut self, timer: TimerKind, ctx: &mut NodeCtx<'_, '_>) {
        if matches!(self.state, NodeState::Removed | NodeState::Failed) {
            return;
        }
        match timer {
            TimerKind::Stabilize => self.on_stabilize_timer(ctx),
            TimerKind::JoinRetry => {
                if self.state == NodeState::Joining {
                    if let Some(peer) = self.bootstrap {
                        debug!(node = %self.id, "retrying join");
                        ctx.send(
                            self.id,
                            peer,
                            DhtMessage::JoinRequest {
                                joiner: self.id,
                                hops_left: self.cfg.hop_budget,
                            },
                        );
                        ctx.timer(self.id, self.cfg.join_retry_interval, TimerKind::JoinRetry);
                    }
                }
            }
            TimerKind::PingTimeout { token } => {
                if let Some(peer) = self.pending_pings.remove(&token) {
                    self.on_predecessor_failed(peer, ctx);
                }
            }
            TimerKind::PutAckTimeout { token } => {
                if let Some(w) = self.pending_writes.remove(&token) {
                    self.finish_write(w, true, ctx);
                }
            }
            TimerKind::OpTimeout { op } => self.on_op_timeout(op, ctx),
        }
    }

    // ---- membership --------------------------------------------------

    fn on_join_request(&mut self, joiner: RingId, hops_left: u8, ctx: &mut NodeCtx<'_, '_>) {
        if self.state != NodeState::Active {
            return;
        }
        if joiner == self.id {
            warn!(node = %self.id, "join request for own id");
            return;
        }
        if !self.owns(joiner) {
            if hops_left == 0 {
                ctx.note("JOIN_ABORT", format!("{joiner} exhausted hop budget"));
                return;
            }
            let hop = self.router.next_hop(joiner, self.successor);
            if hop == self.id {
                return;
            }
            ctx.send(
                self.id,
                hop,
                DhtMessage::JoinRequest {
                    joiner,
                    hops_left: hops_left - 1,
                },
            );
            return;
        }

        // We are the joiner's successor. Split off its share of keys,
        // keeping our copies as replicas, and point our predecessor at
        // the newcomer.
        let old_pred = self.predecessor;
        let lower = old_pred.unwrap_or(self.id);
        let moved = self.store.split_range(lower, joiner);
        self.predecessor = Some(joiner);
        self.router.invalidate(joiner);
        self.router.observe_node(joiner);

        let pb = self.router.piggyback(ctx.now());
        ctx.send(
            self.id,
            joiner,
            DhtMessage::JoinAccept {
                predecessor: lower,
                successor: self.id,
                piggyback: pb,
            },
        );
        if !moved.is_empty() {
            ctx.send(
                self.id,
                joiner,
                DhtMessage::Transfer {
                    primaries: moved,
                    replicas: Vec::new(),
                },
            );
        }
        // The new node is now in our replica set; seed it with our keys.
        self.replicate_all_to(joiner, ctx);
        if let Some(p) = old_pred {
            if p != joiner && p != self.id {
                ctx.send(self.id, p, DhtMessage::FingerUpdate { node: joiner });
            }
        }
        if self.successor == self.id {
            // Second node of the ring closes the circle.
            self.successor = joiner;
        }
        debug!(node = %self.id, joiner = %joiner, "accepted join");
    }

    fn on_join_accept(
        &mut self,
        from: RingId,
        predecessor: RingId,
        piggyback: crate::message::Piggyback,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        if self.state != NodeState::Joining {
            return;
        }
        self.state = NodeState::Active;
        self.successor = from;
        self.predecessor = Some(if predecessor == self.id { from } else { predecessor });
        self.router.absorb(&piggyback, ctx.now());
        self.router.observe_node(from);
        if let Some(p) = self.predecessor {
            self.router.observe_node(p);
        }
        ctx.note("STATE", format!("{} JOINING->ACTIVE", self.id));
        ctx.timer(self.id, self.cfg.stabilization_interval, TimerKind::Stabilize);
    }

    fn on_leave_notice(
        &mut self,
        departing: RingId,
        new_predecessor: Option<RingId>,
        new_successor: Option<RingId>,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        self.router.forget_node(departing);

        if let Some(ns) = new_successor {
            if self.successor == departing {
                self.successor = ns;
                if ns != self.id {
                    self.router.observe_node(ns);
                    self.replicate_all_to(ns, ctx);
                }
            }
        }
        if let Some(np) = new_predecessor {
            if self.predecessor == Some(departing) {
                self.predecessor = if np == self.id { None } else { Some(np) };
                if let Some(p) = self.predecessor {
                    self.router.observe_node(p);
                }
                // Our owned range just grew; claim the replicas in it.
                self.promote_and_replicate(ctx);
            }
        }
        if self.successor == self.id && self.predecessor == Some(self.id) {
            self.predecessor = None;
        }
    }

    fn on_finger_update(&mut self, node: RingId, ctx: &mut NodeCtx<'_, '_>) {
        if node == self.id {
            return;
        }
        self.router.invalidate(node);
        self.router.observe_node(node);
        if self.space.in_open_open(node, self.id, self.successor) || self.successor == self.id {
            self.successor = node;
            self.replicate_all_to(node, ctx);
        }
    }

    // ---- stabilization -----------------------------------------------

    fn on_stabilize_timer(&mut self, ctx: &mut NodeCtx<'_, '_>) {
        if self.state != NodeState::Active {
            return;
        }
        if self.stabilize_pending && self.successor != self.id {
            self.on_successor_failed(ctx);
        }
        self.stabilize_pending = false;

        if self.successor != self.id {
            ctx.send(self.id, self.successor, DhtMessage::Stabilize);
            self.stabilize_pending = true;
        }
        if let Some(p) = self.predecessor {
            if p != self.id {
                let token = self.next_seq();
                self.pending_pings.insert(token, p);
                ctx.send(self.id, p, DhtMessage::Ping { token });
                ctx.timer(
                    self.id,
                    self.cfg.op_timeout,
                    TimerKind::PingTimeout { token },
                );
            }
        }
        if let Some((index, target)) = self.router.refresh_target() {
            if !self.owns(target) {
                let hop = self.router.next_hop(target, self.successor);
                if hop != self.id {
                    let op = self.next_seq();
                    self.pending_refresh.insert(op, index);
                    let pb = self.router.piggyback(ctx.now());
                    ctx.send(
                        self.id,
                        hop,
                        DhtMessage::Lookup {
                            op,
                            origin: self.id,
                            target,
                            action: LookupAction::Resolve,
                            hops_left: self.cfg.hop_budget,
                            hops_taken: 1,
                            direct: false,
                            piggyback: pb,
                        },
                    );
                }
            }
        }
        self.router.purge_expired(ctx.now());
        ctx.timer(self.id, self.cfg.stabilization_interval, TimerKind::Stabilize);
    }

    fn on_stabilize(&mut self, from: RingId, ctx: &mut NodeCtx<'_, '_>) {
        self.router.observe_node(from);
        // The sender believes it precedes us; adopt it if it is closer
        // than what we have. This is also how a fresh ring of two
        // closes its predecessor pointers.
        let adopt = match self.predecessor {
            None => true,
            Some(p) => self.space.in_open_open(from, p, self.id),
        };
        if adopt && from != self.id {
            let changed = self.predecessor != Some(from);
            self.predecessor = Some(from);
            if changed {
                self.router.invalidate(from);
            }
        }
        if self.successor == self.id && from != self.id {
            self.successor = from;
        }
        let pb = self.router.piggyback(ctx.now());
        ctx.send(
            self.id,
            from,
            DhtMessage::StabilizeReply {
                predecessor: self.predecessor,
                piggyback: pb,
            },
        );
    }

    fn on_stabilize_reply(
        &mut self,
        from: RingId,
        predecessor: Option<RingId>,
        piggyback: crate::message::Piggyback,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        if from != self.successor {
            return;
        }
        self.stabilize_pending = false;
        self.router.absorb(&piggyback, ctx.now());
        if let Some(p) = predecessor {
            if p != self.id && self.space.in_open_open(p, self.id, self.successor) {
                // Someone slid in between us and our successor.
                self.successor = p;
                self.router.invalidate(p);
                self.router.observe_node(p);
                self.replicate_all_to(p, ctx);
            }
        }
    }

    fn on_successor_failed(&mut self, ctx: &mut NodeCtx<'_, '_>) {
        let failed = self.successor;
        ctx.note("SUCC_FAILED", format!("{} lost successor {failed}", self.id));
        self.router.forget_node(failed);
        let fallback = self
            .router
            .successor_candidate(failed)
            .or(self.predecessor.filter(|p| *p != failed))
            .unwrap_or(self.id);
        self.successor = fallback;
        if self.predecessor == Some(failed) {
            self.predecessor = None;
        }
        if fallback != self.id {
            self.replicate_all_to(fallback, ctx);
        }
    }

    fn on_predecessor_failed(&mut self, peer: RingId, ctx: &mut NodeCtx<'_, '_>) {
        if self.predecessor != Some(peer) {
            return;
        }
        ctx.note("PRED_FAILED", format!("{} lost predecessor {peer}", self.id));
        self.predecessor = None;
        self.router.forget_node(peer);
        if self.successor == peer {
            self.successor = self.id;
        }
        // The failed node's range folds into ours; its keys survive in
        // our replica store and get promoted here.
        self.promote_and_replicate(ctx);
    }

    // ---- storage plane -----------------------------------------------

    fn on_lookup(
        &mut self,
        op: u64,
        origin: RingId,
        target: RingId,
        action: LookupAction,
        hops_left: u8,
        hops_taken: u8,
        direct: bool,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        if direct {
            // Replica fallback read: answer from whatever we hold.
            let outcome = match &action {
                LookupAction::Get { key } => match self.store.get_any(key) {
                    Some(v) => LookupOutcome::Found {
                        value: v.to_string(),
                    },
                    None => LookupOutcome::NotFound { key: key.clone() },
                },
                _ => LookupOutcome::Resolved,
            };
            self.reply_lookup(origin, op, outcome, hops_taken, ctx);
            return;
        }

        let next = self.router.next_hop(target, self.successor);
        if self.owns(target) || next == self.id {
            let outcome = match action {
                LookupAction::Resolve => LookupOutcome::Resolved,
                LookupAction::Get { key } => match self.store.get_any(&key) {
                    Some(v) => LookupOutcome::Found {
                        value: v.to_string(),
                    },
                    None => LookupOutcome::NotFound { key },
                },
                LookupAction::Delete { key } => match self.apply_delete(&key, ctx) {
                    Ok(OpOutcome::Deleted) => LookupOutcome::Deleted { key },
                    _ => LookupOutcome::NotFound { key },
                },
            };
            self.reply_lookup(origin, op, outcome, hops_taken, ctx);
            return;
        }
        if hops_left == 0 {
            self.reply_lookup(origin, op, LookupOutcome::HopBudgetExhausted, hops_taken, ctx);
            return;
        }
        let pb = self.router.piggyback(ctx.now());
        ctx.send(
            self.id,
            next,
            DhtMessage::Lookup {
                op,
                origin,
                target,
                action,
                hops_left: hops_left - 1,
                hops_taken: hops_taken + 1,
                direct: false,
                piggyback: pb,
            },
        );
    }

    fn reply_lookup(
        &mut self,
        origin: RingId,
        op: u64,
        outcome: LookupOutcome,
        hops_taken: u8,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        let range_start = self.predecessor.unwrap_or(self.successor);
        let replicas = self.replica_targets();
        let pb = self.router.piggyback(ctx.now());
        ctx.send(
            self.id,
            origin,
            DhtMessage::LookupReply {
                op,
                outcome,
                owner: self.id,
                range_start,
                replicas,
                hops_taken,
                piggyback: pb,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn on_lookup_reply(
        &mut self,
        op: u64,
        outcome: LookupOutcome,
        owner: RingId,
        range_start: RingId,
        replicas: Vec<RingId>,
        hops_taken: u8,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        self.router.observe_node(owner);
        if outcome != LookupOutcome::HopBudgetExhausted {
            self.router
                .cache_insert(range_start, owner, replicas.clone(), ctx.now());
        }

        if let Some(index) = self.pending_refresh.remove(&op) {
            if outcome == LookupOutcome::Resolved {
                self.router.record_finger(index, owner);
            }
            return;
        }

        let Some(mut pending) = self.pending_ops.remove(&op) else {
            return;
        };
        pending.hops = pending.hops.max(hops_taken);

        match (pending.kind, outcome) {
            (OpKind::Put, LookupOutcome::Resolved) => {
                let value = pending.value.take().unwrap_or_default();
                ctx.send(
                    self.id,
                    owner,
                    DhtMessage::Store {
                        op,
                        origin: self.id,
                        key: pending.key.clone(),
                        value,
                        hops_left: self.cfg.hop_budget,
                    },
                );
                pending.last_peer = owner;
                self.pending_ops.insert(op, pending);
            }
            (OpKind::Get, LookupOutcome::Found { value }) => {
                self.complete(op, pending, Ok(OpOutcome::Value(value)), ctx);
            }
            (OpKind::Get, LookupOutcome::NotFound { key }) => {
                self.try_get_fallback(op, pending, RingError::KeyNotFound { key }, ctx);
            }
            (OpKind::Get, LookupOutcome::HopBudgetExhausted) => {
                let target = pending.target;
                self.try_get_fallback(op, pending, RingError::HopBudgetExceeded { target }, ctx);
            }
            (OpKind::Delete, LookupOutcome::Deleted { .. }) => {
                self.complete(op, pending, Ok(OpOutcome::Deleted), ctx);
            }
            (OpKind::Delete, LookupOutcome::NotFound { key }) => {
                self.complete(op, pending, Err(RingError::KeyNotFound { key }), ctx);
            }
            (_, LookupOutcome::HopBudgetExhausted) => {
                let target = pending.target;
                self.complete(op, pending, Err(RingError::HopBudgetExceeded { target }), ctx);
            }
            (kind, outcome) => {
                warn!(node = %self.id, ?kind, ?outcome, "mismatched lookup reply");
                self.pending_ops.insert(op, pending);
            }
        }
    }

    fn on_store(
        &mut self,
        origin: RingId,
        op: u64,
        key: String,
        value: String,
        hops_left: u8,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        let target = self.space.key_id(&key);
        if self.owns(target) {
            self.apply_store(origin, op, key, value, ctx);
            return;
        }
        // Stale resolution; route onward like a lookup would.
        if hops_left == 0 {
            self.reply_lookup(origin, op, LookupOutcome::HopBudgetExhausted, 0, ctx);
            return;
        }
        let next = self.router.next_hop(target, self.successor);
        if next == self.id {
            self.apply_store(origin, op, key, value, ctx);
            return;
        }
        ctx.send(
            self.id,
            next,
            DhtMessage::Store {
                op,
                origin,
                key,
                value,
                hops_left: hops_left - 1,
            },
        );
    }

    /// Owner-side write: install the key, fan out to replicas and
    /// either wait for acks (sync) or answer right away (eventual).
    fn apply_store(
        &mut self,
        origin: RingId,
        op: u64,
        key: String,
        value: String,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        self.store.put_primary(key.clone(), value.clone());
        let replicas = self.replica_targets();
        let required = match self.cfg.replication_mode {
            ReplicationMode::Sync { min_acks } => min_acks.min(replicas.len()),
            ReplicationMode::Eventual => 0,
        };

        if required == 0 {
            for r in &replicas {
                ctx.send(
                    self.id,
                    *r,
                    DhtMessage::Replicate {
                        key: key.clone(),
                        value: Some(value.clone()),
                        ack_token: None,
                    },
                );
            }
            self.ack_write(origin, op, key, 0, false, ctx);
            return;
        }

        let token = self.next_seq();
        for r in &replicas {
            ctx.send(
                self.id,
                *r,
                DhtMessage::Replicate {
                    key: key.clone(),
                    value: Some(value.clone()),
                    ack_token: Some(token),
                },
            );
        }
        self.pending_writes.insert(
            token,
            PendingWrite {
                origin,
                op,
                key,
                acked: 0,
                required,
            },
        );
        ctx.timer(
            self.id,
            self.cfg.write_ack_timeout,
            TimerKind::PutAckTimeout { token },
        );
    }

    fn on_replicate(
        &mut self,
        from: RingId,
        key: String,
        value: Option<String>,
        ack_token: Option<u64>,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        match value {
            Some(v) => self.store.put_replica(key.clone(), v),
            None => {
                self.store.remove_replica(&key);
            }
        }
        if let Some(token) = ack_token {
            ctx.send(
                self.id,
                from,
                DhtMessage::StoreAck {
                    op: token,
                    key,
                    replicas_acked: 0,
                    shortfall: false,
                },
            );
        }
    }

    fn on_store_ack(
        &mut self,
        op: u64,
        key: String,
        replicas_acked: usize,
        shortfall: bool,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        // Owner role: `op` is an ack token for a write in flight.
        if let Some(w) = self.pending_writes.get_mut(&op) {
            w.acked += 1;
            if w.acked >= w.required {
                if let Some(w) = self.pending_writes.remove(&op) {
                    self.finish_write(w, false, ctx);
                }
            }
            return;
        }
        // Origin role: the owner is answering our put.
        let Some(pending) = self.pending_ops.remove(&op) else {
            return;
        };
        let result = if shortfall {
            let required = match self.cfg.replication_mode {
                ReplicationMode::Sync { min_acks } => min_acks,
                ReplicationMode::Eventual => 0,
            };
            Err(RingError::ReplicationShortfall {
                key,
                acked: replicas_acked,
                required,
            })
        } else {
            Ok(OpOutcome::Stored { replicas_acked })
        };
        self.complete(op, pending, result, ctx);
    }

    fn finish_write(&mut self, w: PendingWrite, shortfall: bool, ctx: &mut NodeCtx<'_, '_>) {
        if w.origin == self.id {
            let Some(pending) = self.pending_ops.remove(&w.op) else {
                return;
            };
            let result = if shortfall {
                Err(RingError::ReplicationShortfall {
                    key: w.key,
                    acked: w.acked,
                    required: w.required,
                })
            } else {
                Ok(OpOutcome::Stored {
                    replicas_acked: w.acked,
                })
            };
            self.complete(w.op, pending, result, ctx);
        } else {
            ctx.send(
                self.id,
                w.origin,
                DhtMessage::StoreAck {
                    op: w.op,
                    key: w.key,
                    replicas_acked: w.acked,
                    shortfall,
                },
            );
        }
    }

    fn ack_write(
        &mut self,
        origin: RingId,
        op: u64,
        key: String,
        replicas_acked: usize,
        shortfall: bool,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        if origin == self.id {
            if let Some(pending) = self.pending_ops.remove(&op) {
                self.complete(
                    op,
                    pending,
                    Ok(OpOutcome::Stored { replicas_acked }),
                    ctx,
                );
            }
        } else {
            ctx.send(
                self.id,
                origin,
                DhtMessage::StoreAck {
                    op,
                    key,
                    replicas_acked,
                    shortfall,
                },
            );
        }
    }

    fn on_transfer(
        &mut self,
        from: RingId,
        primaries: Vec<(String, String)>,
        replicas: Vec<(String, String)>,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        let targets: Vec<RingId> = self
            .replica_targets()
            .into_iter()
            .filter(|t| *t != from)
            .collect();
        for (key, value) in primaries {
            self.store.put_primary(key.clone(), value.clone());
            for t in &targets {
                ctx.send(
                    self.id,
                    *t,
                    DhtMessage::Replicate {
                        key: key.clone(),
                        value: Some(value.clone()),
                        ack_token: None,
                    },
                );
            }
        }
        for (key, value) in replicas {
            self.store.put_replica(key, value);
        }
    }

    fn on_op_timeout(&mut self, op: u64, ctx: &mut NodeCtx<'_, '_>) {
        let Some(mut pending) = self.pending_ops.remove(&op) else {
            return;
        };
        // A get with untried replicas keeps going.
        if pending.kind == OpKind::Get {
            if let Some(next) = pending.fallback.pop() {
                let pb = self.router.piggyback(ctx.now());
                ctx.send(
                    self.id,
                    next,
                    DhtMessage::Lookup {
                        op,
                        origin: self.id,
                        target: pending.target,
                        action: LookupAction::Get {
                            key: pending.key.clone(),
                        },
                        hops_left: self.cfg.hop_budget,
                        hops_taken: pending.hops + 1,
                        direct: true,
                        piggyback: pb,
                    },
                );
                pending.last_peer = next;
                pending.timeout =
                    ctx.timer(self.id, self.cfg.op_timeout, TimerKind::OpTimeout { op });
                self.pending_ops.insert(op, pending);
                return;
            }
        }
        let peer = pending.last_peer;
        self.router.forget_node(peer);
        let result = Err(RingError::NodeUnreachable(peer));
        self.completions.push(OpCompletion {
            origin: self.id,
            op,
            kind: pending.kind,
            key: pending.key,
            result,
            hops: pending.hops,
            finished_at: ctx.now(),
        });
    }

    /// Send the get to the next untried replica holder, or give up
    /// with `fail` when none remain.
    fn try_get_fallback(
        &mut self,
        op: u64,
        mut pending: PendingOp,
        fail: RingError,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        while let Some(next) = pending.fallback.pop() {
            if next == self.id {
                continue;
            }
            let pb = self.router.piggyback(ctx.now());
            ctx.send(
                self.id,
                next,
                DhtMessage::Lookup {
                    op,
                    origin: self.id,
                    target: pending.target,
                    action: LookupAction::Get {
                        key: pending.key.clone(),
                    },
                    hops_left: self.cfg.hop_budget,
                    hops_taken: pending.hops + 1,
                    direct: true,
                    piggyback: pb,
                },
            );
            pending.last_peer = next;
            self.pending_ops.insert(op, pending);
            return;
        }
        self.complete(op, pending, Err(fail), ctx);
    }

    // ---- helpers -------------------------------------------------------

    fn apply_delete(&mut self, key: &str, ctx: &mut NodeCtx<'_, '_>) -> RingResult<OpOutcome> {
        let removed = self.store.remove_primary(key);
        self.store.remove_replica(key);
        if removed.is_none() {
            return Err(RingError::KeyNotFound {
                key: key.to_string(),
            });
        }
        for r in self.replica_targets() {
            ctx.send(
                self.id,
                r,
                DhtMessage::Replicate {
                    key: key.to_string(),
                    value: None,
                    ack_token: None,
                },
            );
        }
        Ok(OpOutcome::Deleted)
    }

    fn complete(
        &mut self,
        op: u64,
        pending: PendingOp,
        result: RingResult<OpOutcome>,
        ctx: &mut NodeCtx<'_, '_>,
    ) {
        ctx.cancel(pending.timeout);
        self.completions.push(OpCompletion {
            origin: self.id,
            op,
            kind: pending.kind,
            key: pending.key,
            result,
            hops: pending.hops,
            finished_at: ctx.now(),
        });
    }

    /// The nodes holding copies of our keys: predecessor and successor,
    /// deduplicated, capped by the replication factor.
    pub fn replica_targets(&self) -> Vec<RingId> {
        let mut out = Vec::with_capacity(2);
        if let Some(p) = self.predecessor {
            if p != self.id {
                out.push(p);
            }
        }
        if self.successor != self.id && !out.contains(&self.successor) {
            out.push(self.successor);
        }
        out.truncate(self.cfg.replication_factor);
        out
    }

    fn replicate_all_to(&mut self, target: RingId, ctx: &mut NodeCtx<'_, '_>) {
        for (key, value) in self.store.primary_entries() {
            ctx.send(
                self.id,
                target,
                DhtMessage::Replicate {
                    key,
                    value: Some(value),
                    ack_token: None,
                },
            );
        }
    }

    /// Claim replica keys that fall in our (grown) range and push fresh
    /// copies to the current neighbors.
    fn promote_and_replicate(&mut self, ctx: &mut NodeCtx<'_, '_>) {
        let space = self.space;
        let lower = self.predecessor.unwrap_or(self.successor);
        let me = self.id;
        let promoted = self
            .store
            .promote_owned(|k| space.in_open_closed(k, lower, me));
        if promoted.is_empty() {
            return;
        }
        ctx.note("PROMOTE", format!("{me} promoted {} keys", promoted.len()));
        let targets = self.replica_targets();
        for (key, value) in promoted {
            for t in &targets {
                ctx.send(
                    me,
                    *t,
                    DhtMessage::Replicate {
                        key: key.clone(),
                        value: Some(value.clone()),
                        ack_token: None,
                    },
                );
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    #[cfg(test)]
    fn set_links(&mut self, predecessor: Option<RingId>, successor: RingId) {
        self.predecessor = predecessor;
        self.successor = successor;
        self.state = NodeState::Active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64) -> DhtNode {
        DhtNode::new(RingSpace::new(8), RingId::new(id), ProtocolConfig::default())
    }

    #[test]
    fn test_sole_node_owns_everything() {
        let n = node(10);
        assert!(n.owns(RingId::new(10)));
        assert!(n.owns(RingId::new(0)));
        assert!(n.owns(RingId::new(255)));
    }

    #[test]
    fn test_owns_respects_predecessor_range() {
        let mut n = node(120);
        n.set_links(Some(RingId::new(50)), RingId::new(200));
        assert!(n.owns(RingId::new(60)));
        assert!(n.owns(RingId::new(120)));
        assert!(!n.owns(RingId::new(50)));
        assert!(!n.owns(RingId::new(150)));
        assert!(!n.owns(RingId::new(10)));
    }

    #[test]
    fn test_owns_wrapping_range() {
        let mut n = node(10);
        n.set_links(Some(RingId::new(200)), RingId::new(50));
        assert!(n.owns(RingId::new(250)));
        assert!(n.owns(RingId::new(5)));
        assert!(n.owns(RingId::new(10)));
        assert!(!n.owns(RingId::new(100)));
    }

    #[test]
    fn test_replica_targets_dedup_and_cap() {
        let mut n = node(10);
        n.set_links(Some(RingId::new(200)), RingId::new(50));
        assert_eq!(
            n.replica_targets(),
            vec![RingId::new(200), RingId::new(50)]
        );

        // Two-node ring: predecessor and successor are the same node.
        n.set_links(Some(RingId::new(50)), RingId::new(50));
        assert_eq!(n.replica_targets(), vec![RingId::new(50)]);

        // Sole node has nobody to copy to.
        n.set_links(None, RingId::new(10));
        assert!(n.replica_targets().is_empty());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(NodeState::Joining.as_str(), "JOINING");
        assert_eq!(NodeState::Failed.as_str(), "FAILED");
    }
}
