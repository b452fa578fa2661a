//! Per-node key storage.
//!
//! Keys a node owns live in the primary map; copies held for neighbors
//! live in the replica map. The two never mix: ownership movement is an
//! explicit demotion or promotion, so at any instant a key has exactly
//! one primary holder among correctly-pointed nodes.

use std::collections::BTreeMap;

use crate::ring::{RingId, RingSpace};

/// Primary and replica key-value stores of one node.
#[derive(Debug)]
pub struct KeyStore {
    space: RingSpace,
    primary: BTreeMap<String, String>,
    replicas: BTreeMap<String, String>,
}

impl KeyStore {
    pub fn new(space: RingSpace) -> Self {
        KeyStore {
            space,
            primary: BTreeMap::new(),
            replicas: BTreeMap::new(),
        }
    }

    pub fn put_primary(&mut self, key: String, value: String) {
        self.replicas.remove(&key);
        self.primary.insert(key, value);
    }

    pub fn get_primary(&self, key: &str) -> Option<&str> {
        self.primary.get(key).map(String::as_str)
    }

    pub fn remove_primary(&mut self, key: &str) -> Option<String> {
        self.primary.remove(key)
    }

    pub fn put_replica(&mut self, key: String, value: String) {
        if !self.primary.contains_key(&key) {
            self.replicas.insert(key, value);
        }
    }

    pub fn remove_replica(&mut self, key: &str) -> Option<String> {
        self.replicas.remove(key)
    }

    /// Primary value if owned, replica copy otherwise. The fallback
    /// read path of `get` goes through this.
    pub fn get_any(&self, key: &str) -> Option<&str> {
        self.primary
            .get(key)
            .or_else(|| self.replicas.get(key))
            .map(String::as_str)
    }

    /// Hand off the primary keys hashing into `(from, to]`.
    ///
    /// The handed-off keys stay behind as replicas: the old owner is a
    /// ring neighbor of the new one, which makes it a natural member of
    /// the new owner's replica set.
    pub fn split_range(&mut self, from: RingId, to: RingId) -> Vec<(String, String)> {
        let space = self.space;
        let moving: Vec<String> = self
            .primary
            .keys()
            .filter(|k| space.in_open_closed(space.key_id(k), from, to))
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(moving.len());
        for key in moving {
            if let Some(value) = self.primary.remove(&key) {
                self.replicas.insert(key.clone(), value.clone());
                out.push((key, value));
            }
        }
        out
    }

    /// Take everything, for a graceful departure.
    pub fn drain_all(&mut self) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let primaries = std::mem::take(&mut self.primary).into_iter().collect();
        let replicas = std::mem::take(&mut self.replicas).into_iter().collect();
        (primaries, replicas)
    }

    /// Promote replica keys that `owns` now claims into the primary
    /// map. Returns the promoted pairs so the caller can re-replicate
    /// them to its current neighbors.
    pub fn promote_owned(&mut self, owns: impl Fn(RingId) -> bool) -> Vec<(String, String)> {
        let space = self.space;
        let promoting: Vec<String> = self
            .replicas
            .keys()
            .filter(|k| owns(space.key_id(k)))
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(promoting.len());
        for key in promoting {
            if let Some(value) = self.replicas.remove(&key) {
                self.primary.insert(key.clone(), value.clone());
                out.push((key, value));
            }
        }
        out
    }

    /// Snapshot of all primary pairs, for re-replication to a new
    /// neighbor.
    pub fn primary_entries(&self) -> Vec<(String, String)> {
        self.primary
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    pub fn replica_len(&self) -> usize {
        self.replicas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KeyStore {
        KeyStore::new(RingSpace::new(8))
    }

    #[test]
    fn test_primary_roundtrip() {
        let mut s = store();
        s.put_primary("a".into(), "1".into());
        assert_eq!(s.get_primary("a"), Some("1"));
        assert_eq!(s.remove_primary("a"), Some("1".into()));
        assert_eq!(s.get_primary("a"), None);
    }

    #[test]
    fn test_replica_never_shadows_primary() {
        let mut s = store();
        s.put_primary("a".into(), "owned".into());
        s.put_replica("a".into(), "copy".into());
        assert_eq!(s.get_any("a"), Some("owned"));
        assert_eq!(s.replica_len(), 0);
    }

    #[test]
    fn test_promotion_replaces_replica() {
        let mut s = store();
        s.put_replica("a".into(), "copy".into());
        assert_eq!(s.get_any("a"), Some("copy"));
        s.put_primary("a".into(), "owned".into());
        assert_eq!(s.replica_len(), 0);
        assert_eq!(s.primary_len(), 1);
    }

    #[test]
    fn test_split_range_demotes_moved_keys() {
        let mut s = store();
        let space = RingSpace::new(8);
        // Find two keys on opposite sides of a split point.
        let keys = ["k0", "k1", "k2", "k3", "k4", "k5", "k6", "k7"];
        for k in keys {
            s.put_primary(k.into(), format!("v-{k}"));
        }
        let from = RingId::new(0);
        let to = RingId::new(127);
        let moved = s.split_range(from, to);
        let moved_count = keys
            .iter()
            .filter(|k| space.in_open_closed(space.key_id(k), from, to))
            .count();
        assert_eq!(moved.len(), moved_count);
        // Moved keys stay as replicas, unmoved keys stay primary.
        assert_eq!(s.replica_len(), moved_count);
        assert_eq!(s.primary_len(), keys.len() - moved_count);
        for (k, _) in &moved {
            assert_eq!(s.get_primary(k), None);
            assert!(s.get_any(k).is_some());
        }
    }

    #[test]
    fn test_drain_all_empties_both_maps() {
        let mut s = store();
        s.put_primary("a".into(), "1".into());
        s.put_replica("b".into(), "2".into());
        let (p, r) = s.drain_all();
        assert_eq!(p, vec![("a".into(), "1".into())]);
        assert_eq!(r, vec![("b".into(), "2".into())]);
        assert_eq!(s.primary_len() + s.replica_len(), 0);
    }

    #[test]
    fn test_promote_owned_moves_matching_replicas() {
        let mut s = store();
        s.put_replica("a".into(), "1".into());
        s.put_replica("b".into(), "2".into());
        let space = RingSpace::new(8);
        let a_id = space.key_id("a");
        let promoted = s.promote_owned(|id| id == a_id);
        assert_eq!(promoted, vec![("a".into(), "1".into())]);
        assert_eq!(s.get_primary("a"), Some("1"));
        assert_eq!(s.get_any("b"), Some("2"));
        assert_eq!(s.replica_len(), 1);
    }
}
