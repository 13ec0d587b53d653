//! Collaborator traits.
//!
//! Transport, cryptography and network topology live outside this crate.
//! The services only need the operations below; implement them over your
//! HTTP client and crypto library of choice.
//!
//! # Example: an in-memory concept search
//!
//! ```ignore
//! use async_trait::async_trait;
//! use gb_explore::{AggregationTarget, ConceptSearch, ExploreResult, TreeNode};
//!
//! struct StaticSearch(std::collections::HashMap<String, Vec<TreeNode>>);
//!
//! #[async_trait]
//! impl ConceptSearch for StaticSearch {
//!     async fn explore_search_concept_children(
//!         &self,
//!         path: &str,
//!         _target: Option<&AggregationTarget>,
//!     ) -> ExploreResult<Vec<TreeNode>> {
//!         Ok(self.0.get(path).cloned().unwrap_or_default())
//!     }
//!
//!     async fn explore_search_modifier_children(
//!         &self,
//!         path: &str,
//!         _applied_path: &str,
//!         _applied_concept_path: &str,
//!         _target: Option<&AggregationTarget>,
//!     ) -> ExploreResult<Vec<TreeNode>> {
//!         Ok(self.0.get(path).cloned().unwrap_or_default())
//!     }
//! }
//! ```

use async_trait::async_trait;
use gb_constraint::Constraint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::counts::{SavedQuery, StudyConceptCounts};
use crate::error::ExploreResult;
use crate::survival::{SurvivalAnalysisRequest, SurvivalAnalysisResponse};
use crate::tree::TreeNode;

// =============================================================================
// Resource service
// =============================================================================

/// Backend calls issued by the count pipeline and saved-query handling.
#[async_trait]
pub trait ResourceService: Send + Sync {
    /// Patients matching the constraint. `label` tags the call in backend logs.
    async fn get_patients(
        &self,
        constraint: &Constraint,
        label: Option<&str>,
    ) -> ExploreResult<Vec<String>>;

    /// Number of observations matching the constraint.
    async fn get_observation_count(&self, constraint: &Constraint) -> ExploreResult<u64>;

    /// Counts per study and concept for the constraint.
    async fn get_counts_per_study_and_concept(
        &self,
        constraint: &Constraint,
    ) -> ExploreResult<StudyConceptCounts>;

    /// Export data formats available for the constraint.
    async fn get_export_data_formats(&self, constraint: &Constraint) -> ExploreResult<Vec<String>>;

    /// Saves a query and returns it as stored (with its id).
    async fn save_query(&self, query: &SavedQuery) -> ExploreResult<SavedQuery>;

    /// Updates fields of a saved query.
    async fn update_query(&self, query_id: &str, body: &Value) -> ExploreResult<()>;

    /// Deletes a saved query.
    async fn delete_query(&self, query_id: &str) -> ExploreResult<()>;
}

// =============================================================================
// Concept search
// =============================================================================

/// Parameters of a subject-count aggregation request to one network node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationTarget {
    /// URL of the node.
    pub node_url: String,
    /// Ephemeral public key the counts are encrypted for.
    pub public_key: String,
    /// Identifier shared by all requests of one fan-out.
    pub query_id: String,
}

/// Child lookups in the concept tree.
///
/// Without a target, only names and structure are returned. With a target,
/// the node also aggregates encrypted subject counts for every child.
#[async_trait]
pub trait ConceptSearch: Send + Sync {
    /// Children of a concept or folder path.
    async fn explore_search_concept_children(
        &self,
        path: &str,
        target: Option<&AggregationTarget>,
    ) -> ExploreResult<Vec<TreeNode>>;

    /// Children of a modifier path.
    async fn explore_search_modifier_children(
        &self,
        path: &str,
        applied_path: &str,
        applied_concept_path: &str,
        target: Option<&AggregationTarget>,
    ) -> ExploreResult<Vec<TreeNode>>;
}

// =============================================================================
// Crypto and network
// =============================================================================

/// Opaque decryption service.
#[async_trait]
pub trait CryptoService: Send + Sync {
    /// Public key results should be encrypted for.
    fn ephemeral_public_key(&self) -> String;

    /// Decrypts a batch of ciphertexts, preserving order.
    async fn decrypt_integers_with_ephemeral_key(&self, ciphers: &[String]) -> ExploreResult<Vec<i64>>;
}

/// A collaborating node of the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Position of the node in the network.
    pub index: usize,
    /// Node name.
    pub name: String,
    /// Base URL of the node.
    pub url: String,
}

/// Topology of the network, used for fan-outs.
pub trait NetworkTopology: Send + Sync {
    /// Every collaborating node, in network order.
    fn nodes(&self) -> Vec<NodeMetadata>;
}

/// Single-node survival analysis call.
#[async_trait]
pub trait SurvivalAnalysisApi: Send + Sync {
    /// Runs the analysis on one node.
    async fn survival_analysis_single_node(
        &self,
        node_url: &str,
        request: &SurvivalAnalysisRequest,
    ) -> ExploreResult<SurvivalAnalysisResponse>;
}
