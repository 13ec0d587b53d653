//! Concept tree model: nodes and the forest that owns them.

mod forest;
mod node;

pub use forest::{parent_tree_node_paths, TreeForest};
pub use node::{ChildLoadState, DataType, NodeId, TreeNode, TreeNodeType, ValueMetadata};
