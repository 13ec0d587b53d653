//! Registry of the concepts and constraints discovered while processing
//! tree nodes.
//!
//! The registry belongs to the [`ConstraintService`](crate::ConstraintService)
//! and is handed to the tree node service explicitly, so every write made
//! during tree processing goes through an argument.

use std::collections::HashSet;
use std::sync::Arc;

use gb_constraint::{Concept, ConceptConstraint, Constraint};
use parking_lot::Mutex;

/// A genomic annotation found in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomicAnnotation {
    /// Annotation name.
    pub name: String,
    /// Name shown to the user.
    pub display_name: String,
    /// Tree path.
    pub path: String,
}

/// Concepts, their constraints and genomic annotations.
#[derive(Debug, Clone, Default)]
pub struct ConceptRegistry {
    concepts: Vec<Concept>,
    concept_labels: HashSet<String>,
    concept_constraints: Vec<ConceptConstraint>,
    all_constraints: Vec<Constraint>,
    genomic_annotations: Vec<GenomicAnnotation>,
}

/// Registry shared between the services.
pub type SharedRegistry = Arc<Mutex<ConceptRegistry>>;

impl ConceptRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty shared registry.
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Empties the registry.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Registers a concept and its constraint, once per label.
    ///
    /// Returns false if a concept with the same label was already registered.
    pub fn register_concept(&mut self, concept: Concept) -> bool {
        if !self.concept_labels.insert(concept.label.clone()) {
            return false;
        }
        let constraint = ConceptConstraint::new(concept.clone());
        self.concepts.push(concept);
        self.all_constraints.push(Constraint::Concept(constraint.clone()));
        self.concept_constraints.push(constraint);
        true
    }

    /// Registers a genomic annotation, once per name.
    pub fn register_genomic_annotation(&mut self, annotation: GenomicAnnotation) -> bool {
        if self.genomic_annotations.iter().any(|a| a.name == annotation.name) {
            return false;
        }
        self.genomic_annotations.push(annotation);
        true
    }

    /// Returns true if a concept with this label is registered.
    pub fn contains_label(&self, label: &str) -> bool {
        self.concept_labels.contains(label)
    }

    /// Registered concepts, in registration order.
    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    /// Constraints of the registered concepts.
    pub fn concept_constraints(&self) -> &[ConceptConstraint] {
        &self.concept_constraints
    }

    /// Every constraint offered to the user.
    pub fn all_constraints(&self) -> &[Constraint] {
        &self.all_constraints
    }

    /// Registered genomic annotations.
    pub fn genomic_annotations(&self) -> &[GenomicAnnotation] {
        &self.genomic_annotations
    }
}
