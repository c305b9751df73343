//! Keypoint exchange format between feature extraction and the pose core.
//!
//! The match trees travel as flattened index sequences: sibling groups in
//! stack order, `-1` terminating each group and `-2` terminating each tree.

use crate::{Descriptor, Result, TypesError};

/// Keypoint budget per frame.
pub const MAX_KPS: usize = 1500;
/// Match-tree budget per frame.
pub const MAX_TREES: usize = 5;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Keypoint {
    /// Pixel x coordinate.
    pub x: f32,
    /// Pixel y coordinate.
    pub y: f32,
    pub desc: Descriptor,
}

/// One node of a serializable match tree; `index` refers into the keypoint
/// list of the same frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    pub index: usize,
    pub children: Vec<IndexNode>,
}

impl IndexNode {
    pub fn new(index: usize) -> Self {
        IndexNode {
            index,
            children: Vec::new(),
        }
    }

    /// Total number of nodes in this subtree.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(|c| c.count()).sum::<usize>()
    }
}

/// Per-frame output of feature extraction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportData {
    pub img_width: f32,
    pub img_height: f32,
    pub keypoints: Vec<Keypoint>,
    /// Flattened match trees, one sequence per tree.
    pub trees: Vec<Vec<i32>>,
}

impl ExportData {
    pub fn new(
        img_width: f32,
        img_height: f32,
        keypoints: Vec<Keypoint>,
        forest: &[Vec<IndexNode>],
    ) -> Result<ExportData> {
        if keypoints.len() > MAX_KPS {
            return Err(TypesError::TooManyKeypoints(keypoints.len()));
        }
        if forest.len() > MAX_TREES {
            return Err(TypesError::TooManyTrees(forest.len()));
        }
        let trees = forest.iter().map(|tree| flatten_tree(tree)).collect();
        Ok(ExportData {
            img_width,
            img_height,
            keypoints,
            trees,
        })
    }

    /// Reconstruct the match forest from the flattened sequences.
    pub fn expand_forest(&self) -> Result<Vec<Vec<IndexNode>>> {
        self.trees
            .iter()
            .map(|tree| expand_tree(tree, self.keypoints.len()))
            .collect()
    }
}

/// Flatten one tree: root sibling group first, then, for every node popped
/// from the work stack, its child group. `-1` closes a group, `-2` the tree.
pub fn flatten_tree(roots: &[IndexNode]) -> Vec<i32> {
    let mut out = Vec::new();
    let mut stack: Vec<&IndexNode> = Vec::new();
    for node in roots {
        out.push(node.index as i32);
        stack.push(node);
    }
    out.push(-1);
    while let Some(node) = stack.pop() {
        for child in &node.children {
            out.push(child.index as i32);
            stack.push(child);
        }
        out.push(-1);
    }
    out.push(-2);
    out
}

/// Inverse of [flatten_tree]. `kp_count` bounds both the node indices and the
/// total node count.
pub fn expand_tree(data: &[i32], kp_count: usize) -> Result<Vec<IndexNode>> {
    // Slot arena; children are attached by slot id and the tree is built at
    // the end, because the traversal order interleaves sibling groups.
    let mut slots: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut roots: Vec<usize> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut pos = 0usize;

    let read_index = |pos: &mut usize| -> Result<Option<usize>> {
        let val = *data
            .get(*pos)
            .ok_or(TypesError::MalformedTree("unterminated tree"))?;
        *pos += 1;
        match val {
            -1 => Ok(None),
            v if v >= 0 && (v as usize) < kp_count => Ok(Some(v as usize)),
            _ => Err(TypesError::MalformedTree("index out of range")),
        }
    };

    while let Some(index) = read_index(&mut pos)? {
        let slot = slots.len();
        slots.push((index, Vec::new()));
        roots.push(slot);
        stack.push(slot);
    }
    let mut node_count = roots.len();
    while !stack.is_empty() && node_count < kp_count {
        let parent = stack.pop().expect("stack nonempty");
        while let Some(index) = read_index(&mut pos)? {
            if node_count >= kp_count {
                break;
            }
            let slot = slots.len();
            slots.push((index, Vec::new()));
            slots[parent].1.push(slot);
            stack.push(slot);
            node_count += 1;
        }
    }

    fn build(slot: usize, slots: &[(usize, Vec<usize>)]) -> IndexNode {
        IndexNode {
            index: slots[slot].0,
            children: slots[slot].1.iter().map(|c| build(*c, slots)).collect(),
        }
    }
    Ok(roots.iter().map(|r| build(*r, &slots)).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(index: usize, children: Vec<IndexNode>) -> IndexNode {
        IndexNode { index, children }
    }

    #[test]
    fn test_flatten_expand_roundtrip() {
        let tree = vec![
            node(0, vec![node(3, vec![]), node(4, vec![node(6, vec![])])]),
            node(1, vec![node(5, vec![])]),
            node(2, vec![]),
        ];
        let total: usize = tree.iter().map(|n| n.count()).sum();
        assert_eq!(total, 7);
        let flat = flatten_tree(&tree);
        assert_eq!(*flat.last().unwrap(), -2);
        let back = expand_tree(&flat, total).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_flat_shape() {
        let tree = vec![node(0, vec![]), node(1, vec![])];
        let flat = flatten_tree(&tree);
        // Root group, terminator, one empty child group per node, tree end.
        assert_eq!(flat, vec![0, 1, -1, -1, -1, -2]);
    }

    #[test]
    fn test_expand_rejects_bad_index() {
        let flat = vec![0, 9, -1, -2];
        assert!(expand_tree(&flat, 2).is_err());
    }

    #[test]
    fn test_export_data_caps() {
        let kps: Vec<Keypoint> = (0..MAX_KPS + 1)
            .map(|i| Keypoint {
                x: i as f32,
                y: 0.0,
                desc: Descriptor([0u8; 32]),
            })
            .collect();
        assert!(ExportData::new(640.0, 480.0, kps, &[]).is_err());
    }
}
