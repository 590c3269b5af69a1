//! Client-side load balancing over provider nodes.
//!
//! Two policies: a consistent-hash ring with 150 virtual nodes per real
//! node, and a user-stable "round robin" (`user_id mod len`). Both key
//! selection on the user id so a given user keeps routing to the same
//! node while the node set is unchanged.

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Virtual ring positions per real node.
pub const VIRTUAL_NODES_PER_NODE: usize = 150;

/// The ring hash. `h = h*31 + byte`, wrapping u32. Frozen: changing it
/// changes every route across a rolling upgrade.
pub fn ring_hash(key: &str) -> u32 {
    key.bytes().fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
}

/// Node-selection policy seam shared by the RPC channel.
pub trait LoadBalancer: Send + Sync {
    fn add_node(&self, node: &str);
    fn remove_node(&self, node: &str);
    /// `None` when no nodes are registered.
    fn select_node(&self, user_id: i32) -> Option<String>;
    fn nodes(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
struct RingState {
    nodes: Vec<String>,
    ring: BTreeMap<u32, String>,
}

/// Consistent-hash balancer. Removing a node only remaps the users that
/// hashed onto that node's ring segments.
#[derive(Debug, Default)]
pub struct ConsistentHashBalancer {
    state: RwLock<RingState>,
}

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn add_node(&self, node: &str) {
        let mut state = self.state.write().expect("balancer lock");
        if state.nodes.iter().any(|n| n == node) {
            return;
        }
        state.nodes.push(node.to_string());
        for i in 0..VIRTUAL_NODES_PER_NODE {
            let key = format!("{node}&&VN{i}");
            state.ring.insert(ring_hash(&key), node.to_string());
        }
        tracing::info!(node, "balancer: node added");
    }

    fn remove_node(&self, node: &str) {
        let mut state = self.state.write().expect("balancer lock");
        state.nodes.retain(|n| n != node);
        state.ring.retain(|_, v| v != node);
        tracing::info!(node, "balancer: node removed");
    }

    fn select_node(&self, user_id: i32) -> Option<String> {
        let state = self.state.read().expect("balancer lock");
        if state.ring.is_empty() {
            return None;
        }
        let h = ring_hash(&user_id.to_string());
        state
            .ring
            .range(h..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, node)| node.clone())
    }

    fn nodes(&self) -> Vec<String> {
        self.state.read().expect("balancer lock").nodes.clone()
    }
}

/// Insertion-order balancer selecting `nodes[user_id mod len]`.
///
/// Despite the name this is deliberately user-stable, not a rotating
/// cursor: the same user always lands on the same node.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    nodes: RwLock<Vec<String>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn add_node(&self, node: &str) {
        let mut nodes = self.nodes.write().expect("balancer lock");
        if !nodes.iter().any(|n| n == node) {
            nodes.push(node.to_string());
        }
    }

    fn remove_node(&self, node: &str) {
        self.nodes.write().expect("balancer lock").retain(|n| n != node);
    }

    fn select_node(&self, user_id: i32) -> Option<String> {
        let nodes = self.nodes.read().expect("balancer lock");
        if nodes.is_empty() {
            return None;
        }
        let idx = user_id.rem_euclid(nodes.len() as i32) as usize;
        Some(nodes[idx].clone())
    }

    fn nodes(&self) -> Vec<String> {
        self.nodes.read().expect("balancer lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_hash_is_frozen() {
        // h = ((0*31 + 'a')*31 + 'b')*31 + 'c'
        assert_eq!(ring_hash("abc"), 97 * 31 * 31 + 98 * 31 + 99);
        assert_eq!(ring_hash(""), 0);
    }

    #[test]
    fn empty_set_yields_none() {
        let lb = ConsistentHashBalancer::new();
        assert_eq!(lb.select_node(42), None);
        let rr = RoundRobinBalancer::new();
        assert_eq!(rr.select_node(42), None);
    }

    #[test]
    fn selection_is_stable_for_fixed_node_set() {
        let lb = ConsistentHashBalancer::new();
        lb.add_node("10.0.0.1:8000");
        lb.add_node("10.0.0.2:8000");
        lb.add_node("10.0.0.3:8000");
        for uid in 0..500 {
            let first = lb.select_node(uid).unwrap();
            assert_eq!(lb.select_node(uid).unwrap(), first);
        }
    }

    #[test]
    fn removing_a_node_only_remaps_its_own_users() {
        let lb = ConsistentHashBalancer::new();
        for n in ["a:1", "b:1", "c:1"] {
            lb.add_node(n);
        }
        let before: Vec<(i32, String)> =
            (1..=2000).map(|uid| (uid, lb.select_node(uid).unwrap())).collect();

        lb.remove_node("b:1");
        for (uid, node) in &before {
            let now = lb.select_node(*uid).unwrap();
            if node != "b:1" {
                assert_eq!(&now, node, "user {uid} moved off surviving node {node}");
            } else {
                assert_ne!(now, "b:1");
            }
        }
    }

    #[test]
    fn readding_a_node_restores_identical_routing() {
        let lb = ConsistentHashBalancer::new();
        for n in ["a:1", "b:1", "c:1"] {
            lb.add_node(n);
        }
        let before: Vec<String> = (1..=1000).map(|uid| lb.select_node(uid).unwrap()).collect();

        lb.remove_node("b:1");
        lb.add_node("b:1");
        let after: Vec<String> = (1..=1000).map(|uid| lb.select_node(uid).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn round_robin_is_the_mod_formula() {
        let rr = RoundRobinBalancer::new();
        rr.add_node("n0");
        rr.add_node("n1");
        rr.add_node("n2");
        let nodes = rr.nodes();
        for uid in 0..100 {
            assert_eq!(rr.select_node(uid).unwrap(), nodes[uid as usize % nodes.len()]);
        }
        // Negative ids still land in range.
        assert!(rr.select_node(-7).is_some());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let rr = RoundRobinBalancer::new();
        rr.add_node("n0");
        rr.add_node("n0");
        assert_eq!(rr.nodes().len(), 1);
    }
}
