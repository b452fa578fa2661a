//! The simulated message bus.
//!
//! Every send is turned into a [`NetworkDecision`] — deliver after a
//! latency drawn from a seeded generator, or drop. The generator is the
//! only source of randomness on the bus, so a seed fully determines
//! every latency and every drop across a run. Partitions silently
//! swallow traffic between the isolated group and the rest.

use std::collections::BTreeSet;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::ring::RingId;

/// Latency and loss model for the bus.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetworkConfig {
    /// Minimum one-way latency in ticks.
    pub base_latency: u64,
    /// Uniform jitter added on top, `0..=jitter` ticks.
    pub jitter: u64,
    /// Probability a message is lost, `0.0..=1.0`.
    pub drop_probability: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            base_latency: 3,
            jitter: 2,
            drop_probability: 0.0,
        }
    }
}

/// What the bus decided to do with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDecision {
    Deliver { delay: u64 },
    Drop,
    /// Sender and receiver are on opposite sides of a partition.
    Partitioned,
}

/// Seeded latency, loss and partition model.
#[derive(Debug)]
pub struct NetworkBus {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    /// When set, nodes in the group can only reach each other.
    partition: Option<BTreeSet<RingId>>,
}

impl NetworkBus {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        NetworkBus {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            partition: None,
        }
    }

    /// Decide the fate of one message.
    ///
    /// Loopback sends deliver instantly and never consume randomness,
    /// so a node talking to itself does not perturb the latency stream
    /// of real traffic.
    pub fn decide(&mut self, from: RingId, to: RingId) -> NetworkDecision {
        if from == to {
            return NetworkDecision::Deliver { delay: 0 };
        }
        if !self.reachable(from, to) {
            return NetworkDecision::Partitioned;
        }
        if self.config.drop_probability > 0.0
            && self.rng.gen::<f64>() < self.config.drop_probability
        {
            return NetworkDecision::Drop;
        }
        let jitter = if self.config.jitter > 0 {
            self.rng.gen_range(0..=self.config.jitter)
        } else {
            0
        };
        NetworkDecision::Deliver {
            delay: self.config.base_latency + jitter,
        }
    }

    /// Isolate `group` from everything outside it. Replaces any
    /// partition already in place.
    pub fn split(&mut self, group: impl IntoIterator<Item = RingId>) {
        self.partition = Some(group.into_iter().collect());
    }

    /// Remove the partition.
    pub fn heal(&mut self) {
        self.partition = None;
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition.is_some()
    }

    fn reachable(&self, from: RingId, to: RingId) -> bool {
        match &self.partition {
            None => true,
            Some(group) => group.contains(&from) == group.contains(&to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<RingId> {
        raw.iter().copied().map(RingId::new).collect()
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let cfg = NetworkConfig {
            base_latency: 5,
            jitter: 4,
            drop_probability: 0.2,
        };
        let mut a = NetworkBus::new(cfg, 42);
        let mut b = NetworkBus::new(cfg, 42);
        for i in 0..200u64 {
            let from = RingId::new(i % 7);
            let to = RingId::new((i + 1) % 7);
            assert_eq!(a.decide(from, to), b.decide(from, to));
        }
    }

    #[test]
    fn test_latency_within_bounds() {
        let cfg = NetworkConfig {
            base_latency: 5,
            jitter: 3,
            drop_probability: 0.0,
        };
        let mut bus = NetworkBus::new(cfg, 7);
        for _ in 0..100 {
            match bus.decide(RingId::new(1), RingId::new(2)) {
                NetworkDecision::Deliver { delay } => {
                    assert!((5..=8).contains(&delay), "delay {delay} out of range");
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn test_loopback_is_instant() {
        let mut bus = NetworkBus::new(NetworkConfig::default(), 1);
        assert_eq!(
            bus.decide(RingId::new(9), RingId::new(9)),
            NetworkDecision::Deliver { delay: 0 }
        );
    }

    #[test]
    fn test_drops_roughly_match_probability() {
        let cfg = NetworkConfig {
            base_latency: 1,
            jitter: 0,
            drop_probability: 0.5,
        };
        let mut bus = NetworkBus::new(cfg, 99);
        let drops = (0..1000)
            .filter(|_| bus.decide(RingId::new(1), RingId::new(2)) == NetworkDecision::Drop)
            .count();
        assert!((350..650).contains(&drops), "got {drops} drops");
    }

    #[test]
    fn test_partition_blocks_cross_traffic() {
        let mut bus = NetworkBus::new(NetworkConfig::default(), 3);
        bus.split(ids(&[1, 2]));

        assert_eq!(
            bus.decide(RingId::new(1), RingId::new(5)),
            NetworkDecision::Partitioned
        );
        assert_eq!(
            bus.decide(RingId::new(5), RingId::new(2)),
            NetworkDecision::Partitioned
        );
        // Inside the group and outside it, traffic still flows.
        assert!(matches!(
            bus.decide(RingId::new(1), RingId::new(2)),
            NetworkDecision::Deliver { .. }
        ));
        assert!(matches!(
            bus.decide(RingId::new(5), RingId::new(6)),
            NetworkDecision::Deliver { .. }
        ));

        bus.heal();
        assert!(matches!(
            bus.decide(RingId::new(1), RingId::new(5)),
            NetworkDecision::Deliver { .. }
        ));
    }
}
