//! Per-node routing state: fingers, long links and the lookup cache.
//!
//! The two routing modes share one type; the mode is a run-time knob,
//! not a type split, so a scenario can flip it without touching the
//! rest of the node. `Basic` routes every lookup through the successor
//! pointer. `Advanced` keeps a finger table and a small set of long
//! links and forwards to the closest known node preceding the target.
//!
//! The lookup cache is independent of the mode. An entry remembers an
//! owned range `(range_start, owner]` with its replica set and expires
//! after a TTL; any membership change whose id lands inside a cached
//! range invalidates that entry immediately.

use std::collections::{BTreeMap, BTreeSet};

use crate::message::{CacheExport, Piggyback};
use crate::ring::{RingId, RingSpace};
use crate::time::VirtualTime;

/// Upper bound on long-link shortcuts kept per node.
const LONG_LINK_CAP: usize = 8;

/// How many known nodes / cache lines a piggyback block carries.
const PIGGYBACK_NODES: usize = 6;
const PIGGYBACK_CACHE: usize = 4;

/// Forwarding strategy, chosen per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RoutingMode {
    /// Successor-walk only.
    Basic,
    /// Finger table plus long links.
    Advanced,
}

/// One remembered lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Exclusive lower bound of the owned range.
    pub range_start: RingId,
    /// Owner of `(range_start, owner]`.
    pub owner: RingId,
    pub replicas: Vec<RingId>,
    pub expires_at: VirtualTime,
}

impl CacheEntry {
    fn covers(&self, space: RingSpace, id: RingId) -> bool {
        space.in_open_closed(id, self.range_start, self.owner)
    }

    fn live(&self, now: VirtualTime) -> bool {
        now.is_before(self.expires_at)
    }
}

/// Routing state owned by a single node.
#[derive(Debug)]
pub struct Router {
    space: RingSpace,
    id: RingId,
    mode: RoutingMode,
    cache_ttl: u64,
    /// `fingers[i]` targets `(id + 2^i) mod 2^m`. Advanced mode only.
    fingers: Vec<Option<RingId>>,
    long_links: BTreeSet<RingId>,
    /// Keyed by owner id; at most one cached range per owner.
    cache: BTreeMap<RingId, CacheEntry>,
    next_finger: u8,
}

impl Router {
    pub fn new(space: RingSpace, id: RingId, mode: RoutingMode, cache_ttl: u64) -> Self {
        Router {
            space,
            id,
            mode,
            cache_ttl,
            fingers: vec![None; space.bits() as usize],
            long_links: BTreeSet::new(),
            cache: BTreeMap::new(),
            next_finger: 0,
        }
    }

    #[inline]
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Where to forward a lookup for `target`.
    ///
    /// Advanced mode picks the known node closest to the target while
    /// still strictly preceding it, so each hop shrinks the remaining
    /// arc and the walk cannot overshoot the owner. Falls back to the
    /// successor when no shortcut applies.
    pub fn next_hop(&self, target: RingId, successor: RingId) -> RingId {
        if self.mode == RoutingMode::Basic {
            return successor;
        }
        let mut best = successor;
        for candidate in self.shortcut_nodes() {
            if candidate == self.id {
                continue;
            }
            if !self.space.in_open_open(candidate, self.id, target) {
                continue;
            }
            // Any preceding shortcut beats a successor that is not
            // itself preceding; among preceding nodes, take the one
            // covering the most ground.
            let best_precedes = self.space.in_open_open(best, self.id, target);
            if !best_precedes
                || self.space.distance(self.id, candidate) > self.space.distance(self.id, best)
            {
                best = candidate;
            }
        }
        best
    }

    /// Fold a sighting of `node` into the routing state.
    ///
    /// A sighted node strictly inside a cached range means that range
    /// has split since it was cached; the entry is stale and goes. The
    /// owner itself sits on the closed upper bound of its own range, so
    /// sighting it keeps the entry.
    pub fn observe_node(&mut self, node: RingId) {
        if node == self.id {
            return;
        }
        let space = self.space;
        self.cache
            .retain(|_, e| e.owner == node || !e.covers(space, node));

        if self.mode == RoutingMode::Basic {
            // No fingers to maintain, but the sighting still feeds the
            // known-node set that piggybacks and repair draw from.
            self.long_links.insert(node);
            self.trim_long_links();
            return;
        }
        for i in 0..self.fingers.len() {
            let start = self.space.finger_start(self.id, i as u8);
            let dist = self.space.distance(start, node);
            match self.fingers[i] {
                None => self.fingers[i] = Some(node),
                Some(cur) => {
                    if dist < self.space.distance(start, cur) {
                        self.fingers[i] = Some(node);
                    }
                }
            }
        }
        self.long_links.insert(node);
        self.trim_long_links();
    }

    fn trim_long_links(&mut self) {
        while self.long_links.len() > LONG_LINK_CAP {
            // Evict the nearest link; far shortcuts are the valuable ones.
            let nearest = self
                .long_links
                .iter()
                .copied()
                .min_by_key(|l| self.space.distance(self.id, *l));
            match nearest {
                Some(l) => self.long_links.remove(&l),
                None => break,
            };
        }
    }

    /// Erase every trace of a departed or failed node.
    pub fn forget_node(&mut self, node: RingId) {
        for slot in self.fingers.iter_mut() {
            if *slot == Some(node) {
                *slot = None;
            }
        }
        self.long_links.remove(&node);
        self.cache.remove(&node);
        self.invalidate(node);
    }

    /// The finger interval to refresh this round, round-robin.
    /// `None` in basic mode.
    pub fn refresh_target(&mut self) -> Option<(u8, RingId)> {
        if self.mode == RoutingMode::Basic {
            return None;
        }
        let i = self.next_finger;
        self.next_finger = (self.next_finger + 1) % self.space.bits();
        Some((i, self.space.finger_start(self.id, i)))
    }

    /// Install the resolved owner of a finger interval.
    pub fn record_finger(&mut self, index: u8, owner: RingId) {
        if let Some(slot) = self.fingers.get_mut(index as usize) {
            if owner != self.id {
                *slot = Some(owner);
            }
        }
    }

    /// Remember a resolved ownership range.
    pub fn cache_insert(
        &mut self,
        range_start: RingId,
        owner: RingId,
        replicas: Vec<RingId>,
        now: VirtualTime,
    ) {
        if owner == self.id {
            return;
        }
        let expires_at = match now.plus(self.cache_ttl) {
            Some(t) => t,
            None => return,
        };
        self.cache.insert(
            owner,
            CacheEntry {
                range_start,
                owner,
                replicas,
                expires_at,
            },
        );
    }

    /// A live cache entry whose range covers `target`, if any.
    pub fn cache_lookup(&self, target: RingId, now: VirtualTime) -> Option<&CacheEntry> {
        self.cache
            .values()
            .find(|e| e.live(now) && e.covers(self.space, target))
    }

    /// Drop every cached range that `changed` falls into. A node
    /// appearing or disappearing at that id changes the ownership of
    /// exactly those ranges.
    pub fn invalidate(&mut self, changed: RingId) {
        let space = self.space;
        self.cache.retain(|_, e| !e.covers(space, changed));
    }

    /// Drop entries whose TTL has passed.
    pub fn purge_expired(&mut self, now: VirtualTime) {
        self.cache.retain(|_, e| e.live(now));
    }

    /// Build the routing excerpt attached to outgoing replies.
    pub fn piggyback(&self, now: VirtualTime) -> Piggyback {
        let known_nodes: Vec<RingId> = self
            .shortcut_nodes()
            .filter(|n| *n != self.id)
            .take(PIGGYBACK_NODES)
            .collect();
        let cache: Vec<CacheExport> = self
            .cache
            .values()
            .filter(|e| e.live(now))
            .take(PIGGYBACK_CACHE)
            .map(|e| CacheExport {
                range_start: e.range_start,
                owner: e.owner,
                replicas: e.replicas.clone(),
                expires_at: e.expires_at,
            })
            .collect();
        Piggyback { known_nodes, cache }
    }

    /// Merge a received piggyback block into local state.
    pub fn absorb(&mut self, pb: &Piggyback, now: VirtualTime) {
        for node in &pb.known_nodes {
            self.observe_node(*node);
        }
        for entry in &pb.cache {
            if entry.owner == self.id || !now.is_before(entry.expires_at) {
                continue;
            }
            // Never trust a foreign entry longer than our own TTL.
            let cap = now.plus(self.cache_ttl).unwrap_or(entry.expires_at);
            self.cache.insert(
                entry.owner,
                CacheEntry {
                    range_start: entry.range_start,
                    owner: entry.owner,
                    replicas: entry.replicas.clone(),
                    expires_at: entry.expires_at.min(cap),
                },
            );
        }
    }

    /// Closest known live candidate to succeed `self` when the current
    /// successor is gone. `exclude` is the failed node.
    pub fn successor_candidate(&self, exclude: RingId) -> Option<RingId> {
        self.shortcut_nodes()
            .chain(self.cache.keys().copied())
            .filter(|n| *n != self.id && *n != exclude)
            .min_by_key(|n| self.space.distance(self.id, *n))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn finger(&self, index: u8) -> Option<RingId> {
        self.fingers.get(index as usize).copied().flatten()
    }

    /// Distinct finger targets in table order, for snapshot export.
    pub fn finger_links(&self) -> Vec<RingId> {
        let mut out = Vec::new();
        for f in self.fingers.iter().copied().flatten() {
            if !out.contains(&f) {
                out.push(f);
            }
        }
        out
    }

    /// Long-link shortcuts in ascending id order, for snapshot export.
    pub fn long_links(&self) -> Vec<RingId> {
        self.long_links.iter().copied().collect()
    }

    fn shortcut_nodes(&self) -> impl Iterator<Item = RingId> + '_ {
        self.fingers
            .iter()
            .copied()
            .flatten()
            .chain(self.long_links.iter().copied())
    }
}
