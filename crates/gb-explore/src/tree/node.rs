//! Tree node model.

use std::fmt;

use gb_constraint::{EncryptionDescriptor, ValueType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index of a node in its [`TreeForest`](super::TreeForest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreeNodeType {
    /// A concept leaf.
    Concept,
    /// A concept that also has children.
    ConceptFolder,
    /// A container of concepts.
    ConceptContainer,
    /// A modifier leaf.
    Modifier,
    /// A modifier that also has children.
    ModifierFolder,
    /// A container of modifiers.
    ModifierContainer,
    /// A study.
    Study,
    /// A genomic annotation.
    GenomicAnnotation,
    /// Anything else, usually a plain folder.
    #[default]
    Unknown,
}

impl TreeNodeType {
    /// Returns true for modifier, modifier container and modifier folder.
    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            TreeNodeType::Modifier | TreeNodeType::ModifierContainer | TreeNodeType::ModifierFolder
        )
    }

    /// Returns true for concept and concept folder.
    pub fn is_concept(&self) -> bool {
        matches!(self, TreeNodeType::Concept | TreeNodeType::ConceptFolder)
    }
}

/// Data type announced in a node's value metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    /// Positive integers.
    PosInteger,
    /// Positive floats.
    PosFloat,
    /// Integers.
    Integer,
    /// Floats.
    Float,
    /// Free text.
    String,
    /// Enumerated values.
    Enum,
}

/// Value metadata of a node (unit and data type).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMetadata {
    /// Normal unit of the values.
    pub unit: Option<String>,
    /// Data type of the values.
    pub data_type: Option<DataType>,
}

/// Loading state of a node's children.
///
/// `Unloaded -> NamesLoading -> NamesLoaded -> CountsAggregating -> CountsReady`.
/// A node whose user may not aggregate counts stops at `NamesLoaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChildLoadState {
    /// Children never requested.
    #[default]
    Unloaded,
    /// Child names requested.
    NamesLoading,
    /// Children attached, without counts.
    NamesLoaded,
    /// Subject-count fan-out in flight.
    CountsAggregating,
    /// Subject counts applied to the children.
    CountsReady,
}

/// A node of the concept tree.
///
/// Nodes live in a [`TreeForest`](super::TreeForest) and refer to each
/// other by [`NodeId`]. `children` is owned by this node; `applied_concept`
/// is a non-owning back-reference used by modifier nodes only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TreeNode {
    /// Unique tree path, e.g. `/I2B2/Demographics/`.
    pub path: String,
    /// Short name.
    pub name: String,
    /// Name shown to the user.
    pub display_name: String,
    /// Free-form description.
    pub description: String,
    /// Applied path pattern of a modifier.
    pub applied_path: String,
    /// Concept a modifier node applies to.
    #[serde(skip)]
    pub applied_concept: Option<NodeId>,
    /// Kind of node.
    pub node_type: TreeNodeType,
    /// Value type when the node is a concept.
    pub concept_type: Option<ValueType>,
    /// Concept code, e.g. `DEM:AGE`.
    pub concept_code: Option<String>,
    /// Value metadata.
    pub metadata: Option<ValueMetadata>,
    /// Depth in the tree.
    pub depth: usize,
    /// Decrypted subject count.
    pub subject_count: Option<u64>,
    /// Subject count as received from the backend.
    pub subject_count_encrypted: Option<String>,
    /// Whether children were requested and attached.
    pub children_attached: bool,
    /// Owned children.
    #[serde(skip)]
    pub children: Vec<NodeId>,
    /// Medco encryption metadata.
    pub encryption_descriptor: Option<EncryptionDescriptor>,
    /// Display label, derived from `display_name` and `subject_count`.
    pub label: String,
    /// No children can be loaded.
    pub leaf: bool,
    /// Expanded in the UI.
    pub expanded: bool,
    /// Study id of a study node.
    pub study_id: Option<String>,
    /// Query object selecting this node, when the backend provides one.
    pub constraint: Option<Value>,
    /// Guard against overlapping child loads.
    #[serde(skip)]
    pub children_loading_started: bool,
    /// Loading state of the children.
    #[serde(skip)]
    pub load_state: ChildLoadState,
    /// Patient count of the current selection.
    #[serde(skip)]
    pub patient_count: Option<u64>,
}

impl TreeNode {
    /// Creates a node with a path, display name and type.
    pub fn new(path: impl Into<String>, display_name: impl Into<String>, node_type: TreeNodeType) -> Self {
        let display_name = display_name.into();
        Self {
            path: path.into(),
            name: display_name.clone(),
            label: display_name.clone(),
            display_name,
            node_type,
            ..Default::default()
        }
    }

    /// Sets the short name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the concept type.
    pub fn with_concept_type(mut self, concept_type: ValueType) -> Self {
        self.concept_type = Some(concept_type);
        self
    }

    /// Sets the concept code.
    pub fn with_concept_code(mut self, code: impl Into<String>) -> Self {
        self.concept_code = Some(code.into());
        self
    }

    /// Sets the applied path.
    pub fn with_applied_path(mut self, applied_path: impl Into<String>) -> Self {
        self.applied_path = applied_path.into();
        self
    }

    /// Sets the value metadata.
    pub fn with_metadata(mut self, metadata: ValueMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the encrypted subject count.
    pub fn with_encrypted_count(mut self, cipher: impl Into<String>) -> Self {
        self.subject_count_encrypted = Some(cipher.into());
        self
    }

    /// Sets the study id.
    pub fn with_study_id(mut self, study_id: impl Into<String>) -> Self {
        self.study_id = Some(study_id.into());
        self
    }

    /// Sets the query object.
    pub fn with_constraint(mut self, constraint: Value) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Sets the depth.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Marks the node as a leaf.
    pub fn as_leaf(mut self) -> Self {
        self.leaf = true;
        self
    }

    /// Returns true if `other` lies strictly below this node.
    ///
    /// This is a prefix relation over paths, not membership in `children`.
    pub fn is_parent_of(&self, other: &TreeNode) -> bool {
        other.path.starts_with(&self.path) && other.path.len() > self.path.len()
    }

    /// Returns true for modifier, modifier container and modifier folder nodes.
    pub fn is_modifier(&self) -> bool {
        self.node_type.is_modifier()
    }

    /// Returns true if children were attached and at least one is present.
    pub fn has_children(&self) -> bool {
        self.children_attached && !self.children.is_empty()
    }

    /// Copies the node without its children and its applied concept.
    pub fn detached_clone(&self) -> TreeNode {
        TreeNode {
            children: Vec::new(),
            applied_concept: None,
            children_loading_started: false,
            load_state: ChildLoadState::Unloaded,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_parent_of() {
        let a = TreeNode::new("\\A\\", "A", TreeNodeType::Unknown);
        let ab = TreeNode::new("\\A\\B\\", "B", TreeNodeType::Concept);
        let b = TreeNode::new("\\B\\", "B", TreeNodeType::Unknown);

        assert!(a.is_parent_of(&ab));
        assert!(!a.is_parent_of(&a));
        assert!(!a.is_parent_of(&b));
        assert!(!ab.is_parent_of(&a));
    }

    #[test]
    fn test_is_modifier() {
        for t in [
            TreeNodeType::Modifier,
            TreeNodeType::ModifierFolder,
            TreeNodeType::ModifierContainer,
        ] {
            assert!(TreeNode::new("/m/", "m", t).is_modifier());
        }
        for t in [
            TreeNodeType::Concept,
            TreeNodeType::ConceptFolder,
            TreeNodeType::Study,
            TreeNodeType::Unknown,
        ] {
            assert!(!TreeNode::new("/c/", "c", t).is_modifier());
        }
    }

    #[test]
    fn test_has_children_requires_attachment() {
        let mut node = TreeNode::new("/a/", "a", TreeNodeType::Unknown);
        node.children.push(NodeId(1));
        assert!(!node.has_children());
        node.children_attached = true;
        assert!(node.has_children());
    }

    #[test]
    fn test_detached_clone_drops_links() {
        let mut node = TreeNode::new("/a/m/", "m", TreeNodeType::Modifier)
            .with_concept_code("M")
            .with_encrypted_count("c");
        node.children = vec![NodeId(4)];
        node.children_attached = true;
        node.applied_concept = Some(NodeId(0));
        node.children_loading_started = true;

        let copy = node.detached_clone();
        assert!(copy.children.is_empty());
        assert_eq!(copy.applied_concept, None);
        assert!(!copy.children_loading_started);
        assert_eq!(copy.concept_code.as_deref(), Some("M"));
        assert_eq!(copy.path, node.path);
    }

    #[test]
    fn test_deserialize_from_backend_shape() {
        let node: TreeNode = serde_json::from_value(serde_json::json!({
            "path": "/I2B2/Demographics/Age/",
            "name": "Age",
            "displayName": "Age",
            "nodeType": "CONCEPT",
            "conceptType": "NUMERIC",
            "conceptCode": "DEM:AGE",
            "leaf": true,
            "metadata": {"unit": "years", "dataType": "POS_INTEGER"}
        }))
        .unwrap();
        assert_eq!(node.node_type, TreeNodeType::Concept);
        assert_eq!(node.concept_type, Some(ValueType::Numeric));
        assert_eq!(
            node.metadata.and_then(|m| m.data_type),
            Some(DataType::PosInteger)
        );
        assert!(node.leaf);
    }
}
