//! Bounded set of gossip peers

use crate::identity::AgentId;
use crate::protocol::messages::{Endpoint, HopTarget};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Peers this node pushes deltas to, keyed by endpoint. Bootstrap peers have
/// no known agent id until one of their records arrives.
#[derive(Debug)]
pub struct PeerSet {
    own_endpoint: Endpoint,
    peers: DashMap<Endpoint, Option<AgentId>>,
    /// Slots taken, reserved before an insert so concurrent adds respect
    /// `max_peers`
    occupied: AtomicUsize,
    max_peers: usize,
}

impl PeerSet {
    pub fn new(own_endpoint: Endpoint, max_peers: usize) -> Self {
        Self {
            own_endpoint,
            peers: DashMap::new(),
            occupied: AtomicUsize::new(0),
            max_peers,
        }
    }

    /// Peer set seeded from bootstrap endpoints
    pub fn with_bootstrap(own_endpoint: Endpoint, max_peers: usize, bootstrap: &[Endpoint]) -> Self {
        let set = Self::new(own_endpoint, max_peers);
        for endpoint in bootstrap {
            set.add(endpoint.clone(), None);
        }
        set
    }

    /// Add a peer. Returns false for our own endpoint, or when the set is full
    /// and the peer is new.
    pub fn add(&self, endpoint: Endpoint, agent_id: Option<AgentId>) -> bool {
        if endpoint == self.own_endpoint {
            return false;
        }
        match self.peers.entry(endpoint) {
            Entry::Occupied(mut known) => {
                if agent_id.is_some() {
                    known.insert(agent_id);
                }
                true
            }
            Entry::Vacant(slot) => {
                let reserved = self
                    .occupied
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                        (taken < self.max_peers).then_some(taken + 1)
                    })
                    .is_ok();
                if reserved {
                    debug!(peer = %slot.key(), "Added gossip peer");
                    slot.insert(agent_id);
                }
                reserved
            }
        }
    }

    /// Add routers discovered in the index; returns how many were new
    pub fn extend_from_routers(&self, routers: &[HopTarget], own_id: &AgentId) -> usize {
        routers
            .iter()
            .filter(|target| &target.agent_id != own_id)
            .filter(|target| {
                let known = self.contains(&target.endpoint);
                self.add(target.endpoint.clone(), Some(target.agent_id.clone())) && !known
            })
            .count()
    }

    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let removed = self.peers.remove(endpoint).is_some();
        if removed {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.peers.contains_key(endpoint)
    }

    /// Up to `fanout` distinct peers chosen uniformly at random
    pub fn sample(&self, fanout: usize) -> Vec<Endpoint> {
        let mut rng = rand::thread_rng();
        self.endpoints()
            .into_iter()
            .choose_multiple(&mut rng, fanout)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.peers.iter().map(|peer| peer.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use std::collections::HashSet;

    fn endpoint(n: u16) -> Endpoint {
        Endpoint::parse(&format!("tcp://127.0.0.1:{}", 7000 + n)).unwrap()
    }

    #[test]
    fn test_bounded_and_ignores_self() {
        let peers = PeerSet::new(endpoint(0), 3);
        assert!(!peers.add(endpoint(0), None));
        assert!(peers.add(endpoint(1), None));
        assert!(peers.add(endpoint(2), None));
        assert!(peers.add(endpoint(3), None));
        assert!(!peers.add(endpoint(4), None));
        // Re-adding a known peer is fine when full
        assert!(peers.add(endpoint(1), None));
        assert_eq!(peers.len(), 3);
    }

    #[test]
    fn test_concurrent_adds_stay_within_bound() {
        let peers = PeerSet::new(endpoint(0), 8);
        std::thread::scope(|scope| {
            for worker in 0..8u16 {
                let peers = &peers;
                scope.spawn(move || {
                    for n in 1..=16u16 {
                        peers.add(endpoint(worker * 100 + n), None);
                    }
                });
            }
        });
        assert_eq!(peers.len(), 8);

        // A removal frees exactly one slot
        let gone = peers.endpoints()[0].clone();
        assert!(peers.remove(&gone));
        assert!(peers.add(endpoint(999), None));
        assert!(!peers.add(endpoint(998), None));
        assert_eq!(peers.len(), 8);
    }

    #[test]
    fn test_sample_is_distinct_and_bounded() {
        let bootstrap: Vec<Endpoint> = (1..=8).map(endpoint).collect();
        let peers = PeerSet::with_bootstrap(endpoint(0), 16, &bootstrap);

        let sample = peers.sample(3);
        assert_eq!(sample.len(), 3);
        let distinct: HashSet<_> = sample.iter().collect();
        assert_eq!(distinct.len(), 3);

        assert_eq!(peers.sample(20).len(), 8);
        assert!(PeerSet::new(endpoint(0), 4).sample(3).is_empty());
    }

    #[test]
    fn test_extend_from_routers_skips_self() {
        let own = NodeIdentity::from_seed(&[1; 32]);
        let other = NodeIdentity::from_seed(&[2; 32]);
        let peers = PeerSet::new(endpoint(0), 16);

        let routers = vec![
            HopTarget {
                agent_id: own.agent_id().clone(),
                endpoint: endpoint(5),
            },
            HopTarget {
                agent_id: other.agent_id().clone(),
                endpoint: endpoint(6),
            },
        ];
        assert_eq!(peers.extend_from_routers(&routers, own.agent_id()), 1);
        assert_eq!(peers.extend_from_routers(&routers, own.agent_id()), 0);
        assert!(peers.contains(&endpoint(6)));
        assert!(!peers.contains(&endpoint(5)));
    }
}
