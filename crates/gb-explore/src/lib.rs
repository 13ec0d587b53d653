//! # gb-explore
//!
//! Cohort exploration services for the medco explore client.
//!
//! This crate drives the two stateful halves of cohort exploration over
//! pluggable backends:
//!
//! - **Tree node service**: lazily loads the concept tree one level at a
//!   time, aggregates encrypted subject counts across every network node
//!   and decrypts them in one batch
//! - **Constraint service**: keeps the inclusion and exclusion criteria and
//!   runs the two-stage count pipeline, discarding responses that a newer
//!   call has superseded
//! - **Survival analysis**: fans a request out to every node under a
//!   deadline
//!
//! Backends are injected as trait objects: [`ResourceService`] and
//! [`ConceptSearch`] for HTTP, [`CryptoService`] for decryption and
//! [`NetworkTopology`] for the node list.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gb_explore::{ConstraintService, ExploreConfig, ExploreQueryType, TreeNodeService};
//!
//! let config = ExploreConfig::builder()
//!     .with_query_type(ExploreQueryType::CountPerSiteShuffled)
//!     .build();
//! let tree = TreeNodeService::new(config.clone(), search, crypto, network);
//! let service = ConstraintService::new(config, resources, tree);
//!
//! service.load_tree().await?;
//! let root = service.tree().root_tree_nodes()[0];
//! service.load_children_nodes(root).await?;
//!
//! if let Some(constraint) = service.generate_constraint_from_selected_node(root)? {
//!     service.add_inclusion_constraint(constraint);
//! }
//! service.update_counts_1().await;
//! println!("{} patients", service.selection_counts().patient_count);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        gb-explore                             │
//! │                                                               │
//! │  ConstraintService                                            │
//! │  ├── inclusion / exclusion roots (gb-constraint)              │
//! │  ├── stage 1: selection counts      ─┐ CallQueue per stage    │
//! │  ├── stage 2: projection counts     ─┘                        │
//! │  └── ConceptRegistry ◄── filled by tree processing            │
//! │                                                               │
//! │  TreeNodeService                                              │
//! │  ├── TreeForest (arena of TreeNode, NodeId handles)           │
//! │  ├── names phase ─── ConceptSearch (no target)                │
//! │  └── count phase ─── ConceptSearch × NetworkTopology nodes    │
//! │                      └── CryptoService batch decryption       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod call_queue;
mod config;
mod constraint_service;
mod counts;
mod error;
mod registry;
mod survival;
mod traits;
mod tree;
mod tree_service;

pub use call_queue::{CallQueue, CallToken};
pub use config::{ExploreConfig, ExploreConfigBuilder, ExploreQueryType};
pub use constraint_service::{
    generate_exclusion_constraint, generate_inclusion_constraint, projection_constraint,
    put_selection, selection_constraint, ConstraintService, LoadingState, ProjectionCounts,
    SelectionCounts,
};
pub use counts::{
    AlertMessage, CountItem, CountSummary, ExportDataFormat, FileFormat, ObservationsQuery,
    SavedQuery, Severity, StudyConceptCounts,
};
pub use error::{ExploreError, ExploreResult};
pub use registry::{ConceptRegistry, GenomicAnnotation, SharedRegistry};
pub use survival::{SurvivalAnalysisRequest, SurvivalAnalysisResponse, SurvivalAnalysisService};
pub use traits::{
    AggregationTarget, ConceptSearch, CryptoService, NetworkTopology, NodeMetadata,
    ResourceService, SurvivalAnalysisApi,
};
pub use tree::{
    parent_tree_node_paths, ChildLoadState, DataType, NodeId, TreeForest, TreeNode, TreeNodeType,
    ValueMetadata,
};
pub use tree_service::{
    concept_from_modifier_tree_node, concept_from_tree_node, generate_query_id,
    process_tree_node, process_tree_nodes, tree_node_label, ChildrenLoad, TreeNodeService,
};

// Re-export the constraint model for convenience
pub use gb_constraint::{Concept, Constraint};
