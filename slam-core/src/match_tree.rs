//! Construction of the per-frame descriptor forest.
//!
//! Each tree is built over a random shuffle of the frame's keypoints: up to
//! `branch_size` representatives per level in shuffle order, every remaining
//! keypoint bucketed under its Hamming-nearest representative, recursing
//! until a bucket fits `leaf_size`.

use std::collections::BTreeMap;

use rand::rngs::SmallRng;
use rand::Rng;

use slam_types::{Descriptor, IndexNode, SlamConfig};

fn pop_random<T>(vec: &mut Vec<T>, rng: &mut SmallRng) -> T {
    let i = rng.gen_range(0..vec.len());
    vec.swap_remove(i)
}

fn populate(
    nodes: &mut Vec<IndexNode>,
    mut pending: Vec<usize>,
    descs: &[Descriptor],
    branch_size: usize,
    leaf_size: usize,
    rng: &mut SmallRng,
) {
    let max_size = if pending.len() < leaf_size {
        pending.len()
    } else {
        branch_size.min(pending.len())
    };
    for _ in 0..max_size {
        let index = pop_random(&mut pending, rng);
        nodes.push(IndexNode::new(index));
    }
    if pending.is_empty() {
        return;
    }

    let mut buckets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in pending {
        let mut min_distance = u32::MAX;
        let mut min_node = 0usize;
        for (ni, node) in nodes.iter().enumerate() {
            let distance = descs[index].hamming(&descs[node.index]);
            if distance < min_distance {
                min_distance = distance;
                min_node = ni;
            }
        }
        buckets.entry(min_node).or_default().push(index);
    }
    for (ni, bucket) in buckets {
        populate(&mut nodes[ni].children, bucket, descs, branch_size, leaf_size, rng);
    }
}

/// Build `tree_size` independent trees over the descriptors.
pub fn build_forest(
    descs: &[Descriptor],
    cfg: &SlamConfig,
    rng: &mut SmallRng,
) -> Vec<Vec<IndexNode>> {
    let mut forest = Vec::with_capacity(cfg.tree_size);
    for _ in 0..cfg.tree_size {
        let pending: Vec<usize> = (0..descs.len()).collect();
        let mut roots = Vec::new();
        populate(&mut roots, pending, descs, cfg.branch_size, cfg.leaf_size, rng);
        forest.push(roots);
    }
    forest
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use slam_types::{expand_tree, flatten_tree};

    fn descriptors(n: usize) -> Vec<Descriptor> {
        (0..n)
            .map(|i| {
                let mut d = [0u8; 32];
                d[0] = i as u8;
                d[1] = (i * 7) as u8;
                Descriptor(d)
            })
            .collect()
    }

    fn count_nodes(nodes: &[IndexNode]) -> usize {
        nodes
            .iter()
            .map(|n| 1 + count_nodes(&n.children))
            .sum::<usize>()
    }

    fn max_width(nodes: &[IndexNode]) -> usize {
        nodes
            .iter()
            .map(|n| max_width(&n.children))
            .max()
            .unwrap_or(0)
            .max(nodes.len())
    }

    #[test]
    fn test_forest_covers_all_keypoints() {
        let descs = descriptors(120);
        let mut cfg = SlamConfig::default();
        cfg.tree_size = 3;
        cfg.branch_size = 8;
        cfg.leaf_size = 8;
        let mut rng = SmallRng::seed_from_u64(1);
        let forest = build_forest(&descs, &cfg, &mut rng);
        assert_eq!(forest.len(), 3);
        for tree in &forest {
            assert_eq!(count_nodes(tree), descs.len());
            assert!(max_width(tree) <= cfg.branch_size.max(cfg.leaf_size));
            let mut seen = vec![false; descs.len()];
            fn mark(nodes: &[IndexNode], seen: &mut [bool]) {
                for n in nodes {
                    assert!(!seen[n.index]);
                    seen[n.index] = true;
                    mark(&n.children, seen);
                }
            }
            mark(tree, &mut seen);
            assert!(seen.iter().all(|s| *s));
        }
    }

    #[test]
    fn test_small_input_is_single_leaf_group() {
        let descs = descriptors(4);
        let mut cfg = SlamConfig::default();
        cfg.tree_size = 1;
        cfg.branch_size = 10;
        cfg.leaf_size = 10;
        let mut rng = SmallRng::seed_from_u64(2);
        let forest = build_forest(&descs, &cfg, &mut rng);
        assert_eq!(forest[0].len(), 4);
        assert!(forest[0].iter().all(|n| n.children.is_empty()));
    }

    #[test]
    fn test_forest_survives_flattening() {
        let descs = descriptors(60);
        let cfg = SlamConfig::default();
        let mut rng = SmallRng::seed_from_u64(3);
        let forest = build_forest(&descs, &cfg, &mut rng);
        for tree in &forest {
            let flat = flatten_tree(tree);
            let back = expand_tree(&flat, descs.len()).unwrap();
            assert_eq!(&back, tree);
        }
    }
}
