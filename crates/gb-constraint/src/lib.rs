//! # gb-constraint
//!
//! Cohort constraint model for the medco explore client.
//!
//! This crate provides:
//! - **Constraint tree**: a tagged union of true, concept, combination,
//!   negation, study and patient-set constraints
//! - **Wire rendering**: every constraint renders to the JSON query object
//!   the backend understands, or to nothing when it contributes nothing
//! - **Optimizer**: strips meaningless envelopes from incoming query objects
//! - **Parser**: rebuilds constraints from query objects
//!
//! ## Usage
//!
//! ```rust
//! use gb_constraint::{
//!     generate_constraint_from_constraint_object, Concept, Constraint, ValueType,
//! };
//!
//! let age = Concept::new("/demo/age/", Some(ValueType::Numeric)).with_label("/demo/age/");
//! let sex = Concept::new("/demo/sex/", Some(ValueType::Categorical)).with_label("/demo/sex/");
//! let selection = Constraint::and(vec![Constraint::concept(age), Constraint::concept(sex)]);
//!
//! let wire = selection.to_query_object().unwrap();
//! let parsed = generate_constraint_from_constraint_object(&wire).unwrap();
//! assert_eq!(parsed, selection);
//! ```
//!
//! ## Wire Types
//!
//! | `type` | Constraint |
//! |--------|------------|
//! | `true` | [`Constraint::True`] |
//! | `concept` | [`Constraint::Concept`] |
//! | `and` / `or` / `combination` | [`Constraint::Combination`] |
//! | `negation` | [`Constraint::Negation`] |
//! | `study_name` | [`Constraint::Study`] |
//! | `patient_set` | [`Constraint::PatientSet`] |
//! | `subselection` (patient) | its inner constraint |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod ast;
mod concept;
mod error;
mod optimizer;
mod parser;

pub use ast::{
    CombinationConstraint, CombinationState, ConceptConstraint, Constraint, NegationConstraint,
    PatientSetConstraint, Study, StudyConstraint, TimeConstraint, TimeOperator,
    TrialVisitConstraint, ValueConstraint,
};
pub use concept::{Aggregate, Concept, EncryptionDescriptor, Modifier, ValueType};
pub use error::{ConstraintError, ConstraintResult};
pub use optimizer::optimize_constraint_object;
pub use parser::generate_constraint_from_constraint_object;
