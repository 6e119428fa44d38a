//! Hashing helpers and the Merkle tree used for audit exports.

use sha2::Sha256;
use sha3::{Digest, Sha3_256};

use crate::types::MerkleProof;

/// SHA3-256 hash helper.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 hash helper.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Merkle tree over 32-byte leaves (audit entry hashes).
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// All nodes in the tree (leaves at the end, root at index 0)
    nodes: Vec<[u8; 32]>,
    num_leaves: usize,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[[u8; 32]]) -> Self {
        let num_leaves = leaves.len();
        if num_leaves == 0 {
            return Self {
                nodes: vec![[0u8; 32]],
                num_leaves: 0,
            };
        }

        // Pad to next power of 2
        let padded_size = num_leaves.next_power_of_two();
        let mut padded = leaves.to_vec();
        padded.resize(padded_size, [0u8; 32]);

        let leaf_start = padded_size - 1;
        let mut nodes = vec![[0u8; 32]; 2 * padded_size - 1];
        for (i, leaf) in padded.iter().enumerate() {
            nodes[leaf_start + i] = *leaf;
        }

        for i in (0..leaf_start).rev() {
            nodes[i] = hash_pair(&nodes[2 * i + 1], &nodes[2 * i + 2]);
        }

        Self { nodes, num_leaves }
    }

    pub fn root(&self) -> [u8; 32] {
        self.nodes.first().copied().unwrap_or([0u8; 32])
    }

    pub fn len(&self) -> usize {
        self.num_leaves
    }

    pub fn is_empty(&self) -> bool {
        self.num_leaves == 0
    }

    /// Inclusion proof for the leaf at `leaf_index`.
    pub fn prove(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.num_leaves {
            return None;
        }

        let leaf_start = self.num_leaves.next_power_of_two() - 1;
        let mut node_index = leaf_start + leaf_index;
        let leaf_hash = self.nodes[node_index];
        let mut siblings = Vec::new();

        while node_index > 0 {
            let sibling_index = if node_index % 2 == 1 {
                node_index + 1
            } else {
                node_index - 1
            };
            if sibling_index < self.nodes.len() {
                siblings.push(self.nodes[sibling_index]);
            }
            node_index = (node_index - 1) / 2;
        }

        Some(MerkleProof::new(siblings, leaf_index, leaf_hash))
    }

    pub fn verify_proof(root: &[u8; 32], proof: &MerkleProof) -> bool {
        let mut current = proof.leaf_hash;
        let mut index = proof.leaf_index;

        for sibling in &proof.siblings {
            current = if index % 2 == 0 {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
            index /= 2;
        }

        &current == root
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
