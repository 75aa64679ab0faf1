//! SHA3-256 Merkle trees over transaction and checkpoint sets.
//!
//! Leaves and internal nodes use distinct domains so a leaf can never be
//! reinterpreted as an internal node. Trees are padded to the next power of
//! two with zero hashes so authentication paths have uniform depth.

use serde::{Deserialize, Serialize};

use crate::Hash;

/// A node in a Merkle authentication path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MerkleNode {
    pub hash: Hash,
    /// True if this sibling is on the left (current node is right child).
    pub is_left: bool,
}

/// Hash a leaf's canonical encoding into the tree.
pub fn leaf_hash(data: &[u8]) -> Hash {
    crate::hash_domain(b"tempora.merkle.leaf", data)
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    crate::hash_concat(&[b"tempora.merkle.node", left, right])
}

/// Compute a Merkle root from a leaf hash and its authentication path.
pub fn compute_merkle_root(leaf: &Hash, path: &[MerkleNode]) -> Hash {
    let mut current = *leaf;
    for node in path {
        current = if node.is_left {
            node_hash(&node.hash, &current)
        } else {
            node_hash(&current, &node.hash)
        };
    }
    current
}

/// Build a Merkle tree from leaf hashes and return `(root, paths)`.
///
/// The tree is padded to the next power of 2 with zero leaves. The empty
/// set has the all-zero root.
pub fn build_merkle_tree(leaves: &[Hash]) -> (Hash, Vec<Vec<MerkleNode>>) {
    if leaves.is_empty() {
        return ([0u8; 32], vec![]);
    }
    if leaves.len() == 1 {
        return (leaves[0], vec![vec![]]);
    }

    let n = leaves.len().next_power_of_two();
    let mut layer: Vec<Hash> = leaves.to_vec();
    layer.resize(n, [0u8; 32]);

    let mut all_layers = vec![layer.clone()];
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2);
        for chunk in layer.chunks(2) {
            next.push(node_hash(&chunk[0], &chunk[1]));
        }
        all_layers.push(next.clone());
        layer = next;
    }
    let root = layer[0];

    let mut paths = Vec::with_capacity(leaves.len());
    for i in 0..leaves.len() {
        let mut path = Vec::new();
        let mut idx = i;
        for layer in &all_layers[..all_layers.len() - 1] {
            let sibling_idx = idx ^ 1;
            path.push(MerkleNode {
                hash: layer[sibling_idx],
                is_left: sibling_idx < idx,
            });
            idx /= 2;
        }
        paths.push(path);
    }

    (root, paths)
}

/// Convenience: the root over a list of already-hashed items.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    build_merkle_tree(leaves).0
}
