//! Merkle roots over audit event hashes
//!
//! Export receipts commit to the exact batch that left the store by its
//! Merkle root, so an archived batch can later be checked against the
//! receipt without re-reading the live chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::chain::DIGEST_PREFIX;
use crate::audit::event::AuditEvent;

/// Leaf and interior hashes carry distinct prefixes so an interior node can
/// never be presented as a leaf.
const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

fn hash_leaf(leaf: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(leaf.as_bytes());
    format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize()))
}

fn hash_pair(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize()))
}

/// One level up. Odd levels duplicate their last node.
fn parent_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Merkle root over leaf hashes
pub fn merkle_root(leaves: &[String]) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }

    let mut level: Vec<String> = leaves.iter().map(|leaf| hash_leaf(leaf)).collect();
    while level.len() > 1 {
        level = parent_level(&level);
    }
    level.pop()
}

/// Merkle root over the `current_hash` of each event
pub fn events_merkle_root(events: &[AuditEvent]) -> Option<String> {
    let leaves: Vec<String> = events.iter().map(|e| e.current_hash.clone()).collect();
    merkle_root(&leaves)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Inclusion proof for a single leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: String,
    /// Sibling hashes from the leaf upwards, with the side each sibling is on
    pub path: Vec<(Side, String)>,
    pub root_hash: String,
}

impl MerkleProof {
    pub fn generate(leaves: &[String], index: usize) -> Option<Self> {
        if index >= leaves.len() {
            return None;
        }

        let mut path = Vec::new();
        let mut level: Vec<String> = leaves.iter().map(|leaf| hash_leaf(leaf)).collect();
        let mut position = index;

        while level.len() > 1 {
            let sibling = if position % 2 == 0 {
                let sibling = level.get(position + 1).unwrap_or(&level[position]);
                (Side::Right, sibling.clone())
            } else {
                (Side::Left, level[position - 1].clone())
            };
            path.push(sibling);

            level = parent_level(&level);
            position /= 2;
        }

        Some(Self {
            leaf_hash: leaves[index].clone(),
            path,
            root_hash: level.pop()?,
        })
    }

    pub fn verify(&self) -> bool {
        let computed = self
            .path
            .iter()
            .fold(hash_leaf(&self.leaf_hash), |acc, (side, sibling)| match side {
                Side::Left => hash_pair(sibling, &acc),
                Side::Right => hash_pair(&acc, sibling),
            });
        computed == self.root_hash
    }
}
