//! Merkle tree helpers
//!
//! Bitcoin-style merkle roots (odd levels duplicate their last hash) and the
//! per-level node computation used when building partial merkle trees for
//! filtered blocks.

use super::hash::Hash;

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }

    let mut current_level: Vec<Hash> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| {
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                Hash::digest_pair(&chunk[0], right)
            })
            .collect();
    }

    current_level[0]
}

/// Width of the tree at `height` (0 = leaves) for `num_leaves` leaves
pub fn tree_width(num_leaves: usize, height: u32) -> usize {
    (num_leaves + (1 << height) - 1) >> height
}

/// Hash of the node at (`height`, `pos`) of the tree over `leaves`
pub fn tree_node_hash(leaves: &[Hash], height: u32, pos: usize) -> Hash {
    if height == 0 {
        return leaves[pos];
    }

    let left = tree_node_hash(leaves, height - 1, pos * 2);
    let right = if pos * 2 + 1 < tree_width(leaves.len(), height - 1) {
        tree_node_hash(leaves, height - 1, pos * 2 + 1)
    } else {
        left
    };

    Hash::digest_pair(&left, &right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash> {
        (0..n).map(|i| Hash::digest(&[i])).collect()
    }

    #[test]
    fn test_single_leaf_is_root() {
        let hashes = leaves(1);
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let hashes = leaves(3);
        let left = Hash::digest_pair(&hashes[0], &hashes[1]);
        let right = Hash::digest_pair(&hashes[2], &hashes[2]);
        assert_eq!(
            calculate_merkle_root(&hashes),
            Hash::digest_pair(&left, &right)
        );
    }

    #[test]
    fn test_tree_node_hash_matches_root() {
        let hashes = leaves(5);
        let mut height = 0;
        while tree_width(hashes.len(), height) > 1 {
            height += 1;
        }
        assert_eq!(
            tree_node_hash(&hashes, height, 0),
            calculate_merkle_root(&hashes)
        );
    }
}
