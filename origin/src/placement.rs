//! Rendezvous (highest random weight) placement of keys onto nodes.

use sha2::{Digest as _, Sha256};

use crate::node::NodeId;

fn score(node: &NodeId, token: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(node.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(token.as_bytes());
    let hash = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(prefix)
}

/// Every node index, ordered from most to least preferred for `token`.
///
/// Adding or removing a node only moves the keys that node wins or loses.
pub fn rank(nodes: &[NodeId], token: &str) -> Vec<usize> {
    let mut ranked: Vec<(u64, usize)> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| (score(node, token), index))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| nodes[a.1].cmp(&nodes[b.1])));
    ranked.into_iter().map(|(_, index)| index).collect()
}

/// The first `replicas` nodes of [`rank`].
pub fn replica_set(nodes: &[NodeId], token: &str, replicas: usize) -> Vec<usize> {
    let mut ranked = rank(nodes, token);
    ranked.truncate(replicas);
    ranked
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("origin-{i}"))).collect()
    }

    #[test]
    fn replica_sets_are_stable_and_distinct() {
        let nodes = nodes(5);
        let set = replica_set(&nodes, "sha256:abc", 3);
        assert_eq!(set.len(), 3);
        assert_eq!(set, replica_set(&nodes, "sha256:abc", 3));

        let mut unique = set.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn removing_a_node_only_moves_its_keys() {
        let all = nodes(4);
        let fewer: Vec<NodeId> = all[..3].to_vec();

        for i in 0..200 {
            let token = format!("repository:app-{i}");
            let before = all[rank(&all, &token)[0]].clone();
            let after = fewer[rank(&fewer, &token)[0]].clone();
            if before != all[3] {
                assert_eq!(before, after, "{token} moved off a surviving node");
            }
        }
    }

    #[test]
    fn load_spreads_over_nodes() {
        let nodes = nodes(3);
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for i in 0..300 {
            *counts.entry(rank(&nodes, &format!("sha256:{i}"))[0]).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c > 50), "{counts:?}");
    }
}
