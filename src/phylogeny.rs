/*!
# Dated phylogenies

A [`TimedPhylogeny`] is the immutable input of one dataset: a rooted binary
tree whose nodes carry absolute dates (time increases from the root towards
the leaves) and whose leaves carry the label of the sampled host.

Nodes live in a flat arena and are referenced by [`NodeId`]. Trees are put
together with a [`PhylogenyBuilder`], which validates the topology and the
dates when [`PhylogenyBuilder::build`] is called.

```rust
use transtree_mcmc::phylogeny::PhylogenyBuilder;

let mut b = PhylogenyBuilder::new();
let a = b.leaf(2.0, "A");
let c = b.leaf(2.5, "C");
let root = b.join(1.0, a, c);
let phy = b.build(root).unwrap();
assert_eq!(phy.n_leaves(), 2);
assert_eq!(phy.root(), root);
```
*/

use crate::error::PhylogenyError;
use std::collections::HashSet;

/// Index into the phylogeny's node arena.
pub type NodeId = usize;

/// A single node of a [`TimedPhylogeny`].
#[derive(Debug, Clone, PartialEq)]
pub enum PhyloNode {
    /// A sampled host.
    Leaf {
        /// Sampling date.
        time: f64,
        /// Host identifier.
        label: String,
    },
    /// A bifurcation.
    Internal {
        /// Coalescence date.
        time: f64,
        /// First child.
        left: NodeId,
        /// Second child.
        right: NodeId,
    },
}

impl PhyloNode {
    /// Date of the node.
    pub fn time(&self) -> f64 {
        match self {
            PhyloNode::Leaf { time, .. } | PhyloNode::Internal { time, .. } => *time,
        }
    }
}

/// A validated, rooted, dated binary tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedPhylogeny {
    nodes: Vec<PhyloNode>,
    parents: Vec<Option<NodeId>>,
    root: NodeId,
    leaves: Vec<NodeId>,
}

impl TimedPhylogeny {
    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: empty phylogenies are rejected by the builder.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of leaves (sampled hosts).
    pub fn n_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Leaf ids in arena order.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// Access a node.
    pub fn node(&self, id: NodeId) -> &PhyloNode {
        &self.nodes[id]
    }

    /// Date of a node.
    pub fn time(&self, id: NodeId) -> f64 {
        self.nodes[id].time()
    }

    /// Parent of a node (`None` for the root).
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents[id]
    }

    /// True if the node is a leaf.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        matches!(self.nodes[id], PhyloNode::Leaf { .. })
    }

    /// Children of a node (empty for leaves).
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes[id] {
            PhyloNode::Leaf { .. } => Vec::new(),
            PhyloNode::Internal { left, right, .. } => vec![left, right],
        }
    }

    /// Host label of a leaf.
    pub fn label(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id] {
            PhyloNode::Leaf { label, .. } => Some(label),
            PhyloNode::Internal { .. } => None,
        }
    }

    /// Latest sampling date.
    pub fn last_sample_time(&self) -> f64 {
        self.leaves
            .iter()
            .map(|&l| self.time(l))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Sum of all branch lengths (the root has no branch).
    pub fn total_length(&self) -> f64 {
        (0..self.nodes.len())
            .filter_map(|id| self.parents[id].map(|p| self.time(id) - self.time(p)))
            .sum()
    }

    /// Node ids in pre-order (parents before children).
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let PhyloNode::Internal { left, right, .. } = self.nodes[id] {
                stack.push(right);
                stack.push(left);
            }
        }
        order
    }
}

/// Incremental constructor for [`TimedPhylogeny`].
#[derive(Debug, Clone, Default)]
pub struct PhylogenyBuilder {
    nodes: Vec<PhyloNode>,
}

impl PhylogenyBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a leaf sampled at `time` from host `label`.
    pub fn leaf(&mut self, time: f64, label: impl Into<String>) -> NodeId {
        self.nodes.push(PhyloNode::Leaf {
            time,
            label: label.into(),
        });
        self.nodes.len() - 1
    }

    /// Adds an internal node at `time` joining `left` and `right`.
    pub fn join(&mut self, time: f64, left: NodeId, right: NodeId) -> NodeId {
        self.nodes.push(PhyloNode::Internal { time, left, right });
        self.nodes.len() - 1
    }

    /// Validates the nodes added so far and freezes them into a phylogeny rooted at `root`.
    pub fn build(self, root: NodeId) -> Result<TimedPhylogeny, PhylogenyError> {
        let nodes = self.nodes;
        if nodes.is_empty() {
            return Err(PhylogenyError::Empty);
        }
        if root >= nodes.len() {
            return Err(PhylogenyError::UnknownNode(root));
        }

        let mut parents: Vec<Option<NodeId>> = vec![None; nodes.len()];
        for (id, node) in nodes.iter().enumerate() {
            if !node.time().is_finite() {
                return Err(PhylogenyError::NonFiniteTime(id));
            }
            if let PhyloNode::Internal { left, right, .. } = *node {
                for child in [left, right] {
                    if child >= nodes.len() {
                        return Err(PhylogenyError::UnknownNode(child));
                    }
                    if parents[child].is_some() || child == id || left == right {
                        return Err(PhylogenyError::MultipleParents(child));
                    }
                    parents[child] = Some(id);
                }
            }
        }
        if parents[root].is_some() {
            return Err(PhylogenyError::NotARoot(root));
        }

        // Walk from the root; with unique parents this visits each reachable node once.
        let mut seen = vec![false; nodes.len()];
        let mut stack = vec![root];
        let mut reached = 0;
        while let Some(id) = stack.pop() {
            if seen[id] {
                return Err(PhylogenyError::MultipleParents(id));
            }
            seen[id] = true;
            reached += 1;
            if let PhyloNode::Internal { left, right, .. } = nodes[id] {
                stack.push(left);
                stack.push(right);
            }
        }
        if reached != nodes.len() {
            return Err(PhylogenyError::Disconnected {
                root,
                unreachable: nodes.len() - reached,
            });
        }

        for (child, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                let (pt, ct) = (nodes[p].time(), nodes[child].time());
                if ct <= pt {
                    return Err(PhylogenyError::NonIncreasingTime {
                        parent: p,
                        parent_time: pt,
                        child,
                        child_time: ct,
                    });
                }
            }
        }

        let mut labels = HashSet::new();
        let mut leaves = Vec::new();
        for (id, node) in nodes.iter().enumerate() {
            if let PhyloNode::Leaf { label, .. } = node {
                if !labels.insert(label.clone()) {
                    return Err(PhylogenyError::DuplicateLabel(label.clone()));
                }
                leaves.push(id);
            }
        }

        Ok(TimedPhylogeny {
            nodes,
            parents,
            root,
            leaves,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_leaves() -> (PhylogenyBuilder, NodeId) {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(3.0, "A");
        let c = b.leaf(2.5, "B");
        let d = b.leaf(2.8, "C");
        let inner = b.join(2.0, a, c);
        let root = b.join(1.0, inner, d);
        (b, root)
    }

    #[test]
    fn builds_valid_tree() {
        let (b, root) = three_leaves();
        let phy = b.build(root).unwrap();
        assert_eq!(phy.len(), 5);
        assert_eq!(phy.n_leaves(), 3);
        assert_eq!(phy.parent(0), Some(3));
        assert_eq!(phy.parent(root), None);
        assert_eq!(phy.label(1), Some("B"));
        assert!((phy.total_length() - (1.0 + 0.5 + 1.0 + 1.8)).abs() < 1e-12);
        assert!((phy.last_sample_time() - 3.0).abs() < 1e-12);
        let order = phy.preorder();
        assert_eq!(order[0], root);
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn single_leaf_is_a_tree() {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(1.0, "solo");
        let phy = b.build(a).unwrap();
        assert_eq!(phy.n_leaves(), 1);
        assert_eq!(phy.total_length(), 0.0);
    }

    #[test]
    fn rejects_non_increasing_times() {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(1.0, "A");
        let c = b.leaf(2.0, "B");
        let root = b.join(1.0, a, c);
        assert!(matches!(
            b.build(root),
            Err(PhylogenyError::NonIncreasingTime { child: 0, .. })
        ));
    }

    #[test]
    fn rejects_disconnected_nodes() {
        let (mut b, root) = three_leaves();
        b.leaf(4.0, "stray");
        assert!(matches!(
            b.build(root),
            Err(PhylogenyError::Disconnected { unreachable: 1, .. })
        ));
    }

    #[test]
    fn rejects_shared_children_and_duplicate_labels() {
        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(2.0, "A");
        let c = b.leaf(2.0, "B");
        let x = b.join(1.0, a, c);
        let y = b.join(1.5, a, c);
        let _ = (x, y);
        assert!(matches!(
            b.build(x),
            Err(PhylogenyError::MultipleParents(_))
        ));

        let mut b = PhylogenyBuilder::new();
        let a = b.leaf(2.0, "A");
        let c = b.leaf(2.0, "A");
        let root = b.join(1.0, a, c);
        assert_eq!(
            b.build(root),
            Err(PhylogenyError::DuplicateLabel("A".into()))
        );
    }

    #[test]
    fn rejects_empty_and_non_root() {
        assert_eq!(PhylogenyBuilder::new().build(0), Err(PhylogenyError::Empty));
        let (b, _) = three_leaves();
        assert_eq!(b.build(0), Err(PhylogenyError::NotARoot(0)));
    }
}
