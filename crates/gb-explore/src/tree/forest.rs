//! Arena-backed tree forest.

use std::collections::HashSet;

use crate::error::{ExploreError, ExploreResult};

use super::node::{NodeId, TreeNode, TreeNodeType};

/// Owner of every tree node.
///
/// Each node is stored once and referenced by [`NodeId`]. A node is the
/// child of at most one parent; `applied_concept` links are indices only
/// and are never followed for ownership.
///
/// # Example
///
/// ```rust
/// use gb_explore::{TreeForest, TreeNode, TreeNodeType};
///
/// let mut forest = TreeForest::new();
/// let roots = forest.attach_roots(vec![TreeNode::new("/A/", "A", TreeNodeType::Unknown)]);
/// let children = forest
///     .attach_child_tree(roots[0], vec![Some(TreeNode::new("/A/B/", "B", TreeNodeType::Concept)), None])
///     .unwrap();
/// assert_eq!(children.len(), 1);
/// assert!(forest.get(roots[0]).unwrap().has_children());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TreeForest {
    nodes: Vec<TreeNode>,
    roots: Vec<NodeId>,
    generation: u64,
}

impl TreeForest {
    /// Creates an empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every node and starts a new generation.
    ///
    /// Ids handed out before the reset may be reused and must not be
    /// followed afterwards.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.roots.clear();
        self.generation += 1;
    }

    /// Number of resets so far. Compare before and after an await to tell
    /// whether an id taken earlier still names the same node.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the forest holds no node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stores a detached node and returns its id.
    pub fn insert(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Returns the node, if present.
    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0)
    }

    /// Returns the node mutably, if present.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id.0)
    }

    /// Returns the node or [`ExploreError::NodeNotFound`].
    pub fn node(&self, id: NodeId) -> ExploreResult<&TreeNode> {
        self.get(id).ok_or(ExploreError::NodeNotFound(id))
    }

    /// Returns the node mutably or [`ExploreError::NodeNotFound`].
    pub fn node_mut(&mut self, id: NodeId) -> ExploreResult<&mut TreeNode> {
        self.get_mut(id).ok_or(ExploreError::NodeNotFound(id))
    }

    /// Root node ids in load order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Appends nodes as roots.
    pub fn attach_roots(&mut self, nodes: Vec<TreeNode>) -> Vec<NodeId> {
        let ids: Vec<NodeId> = nodes.into_iter().map(|n| self.insert(n)).collect();
        self.roots.extend_from_slice(&ids);
        ids
    }

    /// Attaches the present entries of `nodes` as children of `parent`,
    /// in input order, and marks the parent's children as attached.
    ///
    /// `nodes` is consumed.
    pub fn attach_child_tree(
        &mut self,
        parent: NodeId,
        nodes: Vec<Option<TreeNode>>,
    ) -> ExploreResult<Vec<NodeId>> {
        self.node(parent)?;
        let ids: Vec<NodeId> = nodes.into_iter().flatten().map(|n| self.insert(n)).collect();
        let parent_node = self.node_mut(parent)?;
        parent_node.children.extend_from_slice(&ids);
        parent_node.children_attached = true;
        Ok(ids)
    }

    /// Links every modifier among `children` to the concept it applies to:
    /// the parent's own applied concept if the parent is a modifier,
    /// otherwise the parent itself.
    pub fn attach_modifier_data(&mut self, parent: NodeId, children: &[NodeId]) -> ExploreResult<()> {
        let parent_node = self.node(parent)?;
        let applied = if parent_node.is_modifier() {
            parent_node.applied_concept
        } else {
            Some(parent)
        };
        for &child in children {
            let node = self.node_mut(child)?;
            if node.is_modifier() {
                node.applied_concept = applied;
            }
        }
        Ok(())
    }

    /// Returns true if node `a` lies strictly above node `b`.
    pub fn is_parent_of(&self, a: NodeId, b: NodeId) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(a), Some(b)) => a.is_parent_of(b),
            _ => false,
        }
    }

    /// Every node id reachable from the roots, depth first.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for &root in &self.roots {
            self.walk_from(root, &mut out);
        }
        out
    }

    /// Every node id below and including `id`, depth first.
    pub fn walk_from(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let Some(node) = self.get(id) else {
            return;
        };
        out.push(id);
        for &child in &node.children {
            self.walk_from(child, out);
        }
    }

    /// Leaf descendants of `id` whose type is not in `excluded`.
    ///
    /// Children that have children of their own are descended into
    /// regardless of their type.
    pub fn descendants_with_excluded_types(
        &self,
        id: NodeId,
        excluded: &[TreeNodeType],
    ) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_descendants(id, excluded, &mut out);
        out
    }

    fn collect_descendants(&self, id: NodeId, excluded: &[TreeNodeType], out: &mut Vec<NodeId>) {
        let Some(node) = self.get(id) else {
            return;
        };
        for &child_id in &node.children {
            let Some(child) = self.get(child_id) else {
                continue;
            };
            if child.has_children() {
                self.collect_descendants(child_id, excluded, out);
            } else if !excluded.contains(&child.node_type) {
                out.push(child_id);
            }
        }
    }

    /// Descendants `depth - 1` levels below `id`.
    ///
    /// Depth 2 yields the direct children; depths below 2 yield nothing.
    pub fn descendants_with_depth(&self, id: NodeId, depth: usize) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_at_depth(id, depth, &mut out);
        out
    }

    fn collect_at_depth(&self, id: NodeId, depth: usize, out: &mut Vec<NodeId>) {
        let Some(node) = self.get(id) else {
            return;
        };
        if !node.has_children() {
            return;
        }
        match depth {
            2 => out.extend_from_slice(&node.children),
            d if d > 2 => {
                for &child in &node.children {
                    self.collect_at_depth(child, d - 1, out);
                }
            }
            _ => {}
        }
    }

    /// Keeps only the nodes that are topmost in their branch.
    ///
    /// Given `A\B\C`, `A\B`, `A\D\E`, `A\D\E\F` and `A\E`, returns
    /// `A\B`, `A\D\E` and `A\E`.
    pub fn top_tree_nodes(&self, ids: &[NodeId]) -> Vec<NodeId> {
        let mut result: Vec<(NodeId, &str)> = Vec::new();
        for &id in ids {
            let Some(node) = self.get(id) else {
                continue;
            };
            let path = node.path.as_str();
            if result.iter().any(|(_, kept)| path.starts_with(kept)) {
                continue;
            }
            result.retain(|(_, kept)| !kept.starts_with(path));
            result.push((id, path));
        }
        result.into_iter().map(|(id, _)| id).collect()
    }

    /// First node with the given path.
    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|&id| self.get(id).is_some_and(|n| n.path == path))
    }

    /// Nodes whose path is in `paths`, in tree order.
    pub fn find_by_paths(&self, paths: &[String]) -> Vec<NodeId> {
        let wanted: HashSet<&str> = paths.iter().map(String::as_str).collect();
        self.walk()
            .into_iter()
            .filter(|&id| self.get(id).is_some_and(|n| wanted.contains(n.path.as_str())))
            .collect()
    }
}

/// Paths of the ancestors of a backslash-separated tree path.
///
/// `\a\b\c\` yields `\a\` and `\a\b\`.
pub fn parent_tree_node_paths(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('\\').collect();
    let mut paths = Vec::new();
    if parts.len() > 3 {
        let mut parent = String::from("\\");
        for part in &parts[1..parts.len() - 2] {
            parent.push_str(part);
            parent.push('\\');
            paths.push(parent.clone());
        }
    }
    paths
}
