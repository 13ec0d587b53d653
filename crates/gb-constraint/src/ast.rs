//! Constraint variants and their translation to the backend query AST.
//!
//! Every variant knows how to render itself as a wire query object
//! (`{"type": ..., ...}`). A variant that has nothing to contribute renders
//! as `None` and is left out by the enclosing combination.

use std::fmt;

use serde_json::{json, Map, Value};

use crate::concept::{Concept, ValueType};

// =============================================================================
// Value restrictions attached to concept constraints
// =============================================================================

/// A restriction on observation values: `{type: 'value', valueType, operator, value}`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueConstraint {
    /// Value type of the restriction (`NUMERIC`, `STRING`, `DATE`).
    pub value_type: String,
    /// Comparison operator, e.g. `<`, `>=`, `=`.
    pub operator: String,
    /// The value compared against.
    pub value: Value,
}

impl ValueConstraint {
    /// Creates a value restriction.
    pub fn new(value_type: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            value_type: value_type.into(),
            operator: operator.into(),
            value,
        }
    }

    /// Renders the wire object.
    pub fn to_query_object(&self) -> Value {
        json!({
            "type": "value",
            "valueType": self.value_type,
            "operator": self.operator,
            "value": self.value,
        })
    }
}

/// Operators of an observation date restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeOperator {
    /// Before the first date: `<-`
    Before,
    /// After the first date: `->`
    #[default]
    After,
    /// Between the two dates: `<-->`
    Between,
    /// Outside the two dates: `!<-->`
    NotBetween,
}

impl TimeOperator {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOperator::Before => "<-",
            TimeOperator::After => "->",
            TimeOperator::Between => "<-->",
            TimeOperator::NotBetween => "!<-->",
        }
    }

    /// Parses the wire representation.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "<-" => Some(TimeOperator::Before),
            "->" => Some(TimeOperator::After),
            "<-->" => Some(TimeOperator::Between),
            "!<-->" => Some(TimeOperator::NotBetween),
            _ => None,
        }
    }
}

/// Observation date restriction of a concept constraint.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeConstraint {
    /// Date comparison operator.
    pub operator: TimeOperator,
    /// ISO-8601 dates; two for the range operators.
    pub values: Vec<String>,
}

impl TimeConstraint {
    /// Renders the wire object.
    pub fn to_query_object(&self) -> Value {
        json!({
            "type": "time",
            "field": {
                "dimension": "start time",
                "fieldName": "startDate",
                "type": "DATE",
            },
            "operator": self.operator.as_str(),
            "values": self.values,
        })
    }
}

/// Trial visit restriction of a concept constraint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrialVisitConstraint {
    /// Identifiers of the accepted trial visits.
    pub visit_ids: Vec<i64>,
}

impl TrialVisitConstraint {
    /// Renders the wire object.
    pub fn to_query_object(&self) -> Value {
        json!({
            "type": "field",
            "field": {
                "dimension": "trial visit",
                "fieldName": "id",
                "type": "NUMERIC",
            },
            "operator": "in",
            "value": self.visit_ids,
        })
    }
}

// =============================================================================
// Constraint variants
// =============================================================================

/// Selects observations of one concept, optionally restricted by value,
/// observation date and trial visit.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConceptConstraint {
    /// The concept; `None` until the user picks one.
    pub concept: Option<Concept>,
    /// Value restrictions.
    pub values: Vec<ValueConstraint>,
    /// Whether `obs_date_constraint` is part of the query.
    pub apply_obs_date_constraint: bool,
    /// Observation date restriction.
    pub obs_date_constraint: TimeConstraint,
    /// Whether `trial_visit_constraint` is part of the query.
    pub apply_trial_visit_constraint: bool,
    /// Trial visit restriction.
    pub trial_visit_constraint: TrialVisitConstraint,
}

impl ConceptConstraint {
    /// Creates a constraint on the given concept.
    pub fn new(concept: Concept) -> Self {
        Self {
            concept: Some(concept),
            ..Default::default()
        }
    }

    /// Renders the wire object, or `None` when no concept is set.
    ///
    /// The result is always an `and` node whose first argument is the
    /// concept itself. Numerical value restrictions are direct siblings of
    /// the concept; categorical ones are wrapped in a nested `or`.
    ///
    /// The concept node is `{type, path, valueType}`, plus `conceptCode`
    /// when the concept has a code so that parsing the object back keeps it.
    pub fn to_query_object(&self) -> Option<Value> {
        let concept = self.concept.as_ref()?;

        let mut concept_obj = Map::new();
        concept_obj.insert("type".into(), json!("concept"));
        concept_obj.insert("path".into(), json!(concept.path));
        if let Some(vt) = concept.value_type {
            concept_obj.insert("valueType".into(), json!(vt.as_str()));
        }
        if let Some(code) = &concept.code {
            concept_obj.insert("conceptCode".into(), json!(code));
        }

        let mut args = vec![Value::Object(concept_obj)];

        if !self.values.is_empty() {
            match concept.value_type {
                Some(ValueType::Numeric) => {
                    args.extend(self.values.iter().map(ValueConstraint::to_query_object));
                }
                Some(ValueType::Categorical) => {
                    let alternatives: Vec<Value> =
                        self.values.iter().map(ValueConstraint::to_query_object).collect();
                    args.push(json!({ "type": "or", "args": alternatives }));
                }
                _ => {}
            }
        }

        if self.apply_obs_date_constraint {
            args.push(self.obs_date_constraint.to_query_object());
        }
        if self.apply_trial_visit_constraint {
            args.push(self.trial_visit_constraint.to_query_object());
        }

        Some(json!({ "type": "and", "args": args }))
    }

    /// Patient-level query object. Not implemented: always `None`.
    pub fn to_patient_query_object(&self) -> Option<Value> {
        None
    }

    /// Short human-readable summary.
    pub fn text_representation(&self) -> String {
        match &self.concept {
            Some(concept) => format!("Concept: {}", concept.path),
            None => "Concept".to_string(),
        }
    }
}

/// Boolean operator of a combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CombinationState {
    /// All children must hold.
    #[default]
    And,
    /// At least one child must hold.
    Or,
}

impl CombinationState {
    /// Returns the wire operator name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CombinationState::And => "and",
            CombinationState::Or => "or",
        }
    }
}

/// An ordered group of constraints joined by one Boolean operator.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CombinationConstraint {
    /// Child constraints in order.
    pub children: Vec<Constraint>,
    /// The operator joining the children.
    pub combination_state: CombinationState,
    /// Marks the inclusion/exclusion accumulation roots.
    pub is_root: bool,
}

impl CombinationConstraint {
    /// Creates an empty combination with the given operator.
    pub fn new(combination_state: CombinationState) -> Self {
        Self {
            children: Vec::new(),
            combination_state,
            is_root: false,
        }
    }

    /// Creates an empty AND root.
    pub fn root() -> Self {
        Self {
            is_root: true,
            ..Default::default()
        }
    }

    /// Creates a combination over the given children.
    pub fn with_children(combination_state: CombinationState, children: Vec<Constraint>) -> Self {
        Self {
            children,
            combination_state,
            is_root: false,
        }
    }

    /// Returns true if any child contributes to a query.
    ///
    /// Nested combinations count only if they themselves have non-empty
    /// children, so `[]` and `[[], [[]]]` are both empty.
    pub fn has_non_empty_children(&self) -> bool {
        self.children.iter().any(|child| match child {
            Constraint::Combination(inner) => inner.has_non_empty_children(),
            _ => true,
        })
    }

    /// Renders the wire object, or `None` when no child contributes.
    pub fn to_query_object(&self) -> Option<Value> {
        let args: Vec<Value> = self
            .children
            .iter()
            .filter_map(Constraint::to_query_object)
            .collect();
        if args.is_empty() {
            return None;
        }
        Some(json!({ "type": self.combination_state.as_str(), "args": args }))
    }

    /// Renders the patient-level wire object.
    pub fn to_patient_query_object(&self) -> Option<Value> {
        let args: Vec<Value> = self
            .children
            .iter()
            .filter_map(Constraint::to_patient_query_object)
            .collect();
        if args.is_empty() {
            return None;
        }
        Some(json!({ "type": self.combination_state.as_str(), "args": args }))
    }
}

/// Logical negation of exactly one child constraint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NegationConstraint {
    /// The negated constraint.
    pub constraint: Box<Constraint>,
}

impl NegationConstraint {
    /// Wraps a constraint in a negation.
    pub fn new(constraint: Constraint) -> Self {
        Self {
            constraint: Box::new(constraint),
        }
    }
}

/// A study reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Study {
    /// The study identifier, e.g. `SURVEY_1`.
    pub study_id: String,
}

impl Study {
    /// Creates a study reference.
    pub fn new(study_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
        }
    }
}

/// Selects observations belonging to any of the listed studies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StudyConstraint {
    /// The studies.
    pub studies: Vec<Study>,
}

impl StudyConstraint {
    /// Renders `study_name` for one study, an `or` of them for several.
    pub fn to_query_object(&self) -> Option<Value> {
        let mut args: Vec<Value> = self
            .studies
            .iter()
            .map(|s| json!({ "type": "study_name", "studyId": s.study_id }))
            .collect();
        match args.len() {
            0 => None,
            1 => args.pop(),
            _ => Some(json!({ "type": "or", "args": args })),
        }
    }
}

/// Selects a fixed set of patients.
///
/// Only the first populated selector is rendered, in the order
/// `subject_ids`, `patient_ids`, `patient_set_id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PatientSetConstraint {
    /// External subject identifiers.
    pub subject_ids: Option<Vec<String>>,
    /// Internal patient identifiers.
    pub patient_ids: Option<Vec<i64>>,
    /// Identifier of a saved patient set.
    pub patient_set_id: Option<i64>,
}

impl PatientSetConstraint {
    /// Renders the wire object, or `None` when no selector is set.
    pub fn to_query_object(&self) -> Option<Value> {
        if let Some(ids) = &self.subject_ids {
            return Some(json!({ "type": "patient_set", "subjectIds": ids }));
        }
        if let Some(ids) = &self.patient_ids {
            return Some(json!({ "type": "patient_set", "patientIds": ids }));
        }
        self.patient_set_id
            .map(|id| json!({ "type": "patient_set", "patientSetId": id }))
    }
}

/// A composable predicate over patients and observations.
///
/// # Examples
///
/// ```rust
/// use gb_constraint::{Concept, Constraint, ValueType};
///
/// let age = Constraint::concept(Concept::new("/demo/age/", Some(ValueType::Numeric)));
/// let selection = Constraint::and(vec![age, Constraint::not(Constraint::True)]);
/// let query = selection.to_query_object().unwrap();
/// assert_eq!(query["type"], "and");
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Constraint {
    /// Matches everything: `{type: 'true'}`
    True,
    /// Observations of one concept.
    Concept(ConceptConstraint),
    /// AND/OR group.
    Combination(CombinationConstraint),
    /// Negation of one child.
    Negation(NegationConstraint),
    /// Observations of given studies.
    Study(StudyConstraint),
    /// A fixed patient set.
    PatientSet(PatientSetConstraint),
}

impl Constraint {
    /// Creates a concept constraint without value restrictions.
    pub fn concept(concept: Concept) -> Self {
        Constraint::Concept(ConceptConstraint::new(concept))
    }

    /// Creates an AND combination.
    pub fn and(children: Vec<Constraint>) -> Self {
        Constraint::Combination(CombinationConstraint::with_children(
            CombinationState::And,
            children,
        ))
    }

    /// Creates an OR combination.
    pub fn or(children: Vec<Constraint>) -> Self {
        Constraint::Combination(CombinationConstraint::with_children(
            CombinationState::Or,
            children,
        ))
    }

    /// Creates a negation.
    pub fn not(inner: Constraint) -> Self {
        Constraint::Negation(NegationConstraint::new(inner))
    }

    /// Creates a single-study constraint.
    pub fn study(study_id: impl Into<String>) -> Self {
        Constraint::Study(StudyConstraint {
            studies: vec![Study::new(study_id)],
        })
    }

    /// Name of the variant.
    pub fn class_name(&self) -> &'static str {
        match self {
            Constraint::True => "TrueConstraint",
            Constraint::Concept(_) => "ConceptConstraint",
            Constraint::Combination(_) => "CombinationConstraint",
            Constraint::Negation(_) => "NegationConstraint",
            Constraint::Study(_) => "StudyConstraint",
            Constraint::PatientSet(_) => "PatientSetConstraint",
        }
    }

    /// Renders the backend query object, or `None` when the constraint
    /// contributes nothing and must be left out of composition.
    pub fn to_query_object(&self) -> Option<Value> {
        match self {
            Constraint::True => Some(json!({ "type": "true" })),
            Constraint::Concept(c) => c.to_query_object(),
            Constraint::Combination(c) => c.to_query_object(),
            Constraint::Negation(n) => n
                .constraint
                .to_query_object()
                .map(|arg| json!({ "type": "negation", "arg": arg })),
            Constraint::Study(s) => s.to_query_object(),
            Constraint::PatientSet(p) => p.to_query_object(),
        }
    }

    /// Renders the patient-level query object used when saving a query.
    ///
    /// Concept and patient-set constraints have no patient-level form and
    /// yield `None`.
    pub fn to_patient_query_object(&self) -> Option<Value> {
        match self {
            Constraint::True => Some(json!({ "type": "true" })),
            Constraint::Concept(c) => c.to_patient_query_object(),
            Constraint::Combination(c) => c.to_patient_query_object(),
            Constraint::Negation(n) => n
                .constraint
                .to_patient_query_object()
                .map(|arg| json!({ "type": "negation", "arg": arg })),
            Constraint::Study(s) => s.to_query_object().map(|inner| {
                json!({
                    "type": "subselection",
                    "dimension": "patient",
                    "constraint": inner,
                })
            }),
            Constraint::PatientSet(_) => None,
        }
    }

    /// Short human-readable summary.
    pub fn text_representation(&self) -> String {
        match self {
            Constraint::True => "True".to_string(),
            Constraint::Concept(c) => c.text_representation(),
            Constraint::Combination(_) => "Group".to_string(),
            Constraint::Negation(_) => "Negation".to_string(),
            Constraint::Study(s) => {
                if s.studies.is_empty() {
                    "Study".to_string()
                } else {
                    let ids: Vec<&str> = s.studies.iter().map(|s| s.study_id.as_str()).collect();
                    format!("Study: {}", ids.join(", "))
                }
            }
            Constraint::PatientSet(_) => "Patient set".to_string(),
        }
    }

    /// Returns the combination if this is one.
    pub fn as_combination(&self) -> Option<&CombinationConstraint> {
        match self {
            Constraint::Combination(c) => Some(c),
            _ => None,
        }
    }

    /// Returns true for a combination without non-empty children.
    pub fn is_empty_combination(&self) -> bool {
        matches!(self, Constraint::Combination(c) if !c.has_non_empty_children())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text_representation())
    }
}

impl From<CombinationConstraint> for Constraint {
    fn from(value: CombinationConstraint) -> Self {
        Constraint::Combination(value)
    }
}

impl From<ConceptConstraint> for Constraint {
    fn from(value: ConceptConstraint) -> Self {
        Constraint::Concept(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(path: &str) -> Concept {
        Concept::new(path, Some(ValueType::Numeric))
    }

    #[test]
    fn test_concept_without_concept_is_omitted() {
        let c = ConceptConstraint::default();
        assert!(c.to_query_object().is_none());
        assert_eq!(c.text_representation(), "Concept");
    }

    #[test]
    fn test_numeric_values_are_and_siblings() {
        let mut c = ConceptConstraint::new(numeric("/vital/hr/"));
        c.values.push(ValueConstraint::new("NUMERIC", ">", json!(60)));
        c.values.push(ValueConstraint::new("NUMERIC", "<", json!(100)));

        let q = c.to_query_object().unwrap();
        assert_eq!(q["type"], "and");
        let args = q["args"].as_array().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], json!({"type": "concept", "path": "/vital/hr/", "valueType": "NUMERIC"}));
        assert_eq!(args[1]["type"], "value");
        assert_eq!(args[2]["operator"], "<");
    }

    #[test]
    fn test_concept_node_carries_code_only_when_set() {
        let plain = ConceptConstraint::new(numeric("/vital/hr/"));
        assert_eq!(
            plain.to_query_object().unwrap()["args"][0],
            json!({"type": "concept", "path": "/vital/hr/", "valueType": "NUMERIC"})
        );

        let coded = ConceptConstraint::new(numeric("/vital/hr/").with_code("HR"));
        assert_eq!(
            coded.to_query_object().unwrap()["args"][0],
            json!({"type": "concept", "path": "/vital/hr/", "valueType": "NUMERIC", "conceptCode": "HR"})
        );
    }

    #[test]
    fn test_categorical_values_wrapped_in_or() {
        let mut c = ConceptConstraint::new(Concept::new("/demo/sex/", Some(ValueType::Categorical)));
        c.values.push(ValueConstraint::new("STRING", "=", json!("male")));
        c.values.push(ValueConstraint::new("STRING", "=", json!("female")));

        let q = c.to_query_object().unwrap();
        let args = q["args"].as_array().unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[1]["type"], "or");
        assert_eq!(args[1]["args"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_date_and_visit_appended_when_applied() {
        let mut c = ConceptConstraint::new(numeric("/a/"));
        c.obs_date_constraint = TimeConstraint {
            operator: TimeOperator::Between,
            values: vec!["2020-01-01".into(), "2020-12-31".into()],
        };
        c.trial_visit_constraint.visit_ids = vec![3];
        assert_eq!(c.to_query_object().unwrap()["args"].as_array().unwrap().len(), 1);

        c.apply_obs_date_constraint = true;
        c.apply_trial_visit_constraint = true;
        let q = c.to_query_object().unwrap();
        let args = q["args"].as_array().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[1]["type"], "time");
        assert_eq!(args[1]["operator"], "<-->");
        assert_eq!(args[2]["type"], "field");
        assert_eq!(args[2]["value"], json!([3]));
    }

    #[test]
    fn test_has_non_empty_children() {
        let empty = CombinationConstraint::default();
        assert!(!empty.has_non_empty_children());

        let nested_empty = CombinationConstraint::with_children(
            CombinationState::And,
            vec![Constraint::Combination(CombinationConstraint::default())],
        );
        assert!(!nested_empty.has_non_empty_children());

        let with_true =
            CombinationConstraint::with_children(CombinationState::And, vec![Constraint::True]);
        assert!(with_true.has_non_empty_children());
    }

    #[test]
    fn test_empty_combination_is_omitted_from_composition() {
        let c = Constraint::and(vec![
            Constraint::Combination(CombinationConstraint::default()),
            Constraint::study("S1"),
        ]);
        let q = c.to_query_object().unwrap();
        assert_eq!(q, json!({"type": "and", "args": [{"type": "study_name", "studyId": "S1"}]}));
        assert!(CombinationConstraint::default().to_query_object().is_none());
    }

    #[test]
    fn test_negation_of_true() {
        let q = Constraint::not(Constraint::True).to_query_object().unwrap();
        assert_eq!(q, json!({"type": "negation", "arg": {"type": "true"}}));
    }

    #[test]
    fn test_study_constraint_shapes() {
        let one = Constraint::study("S1");
        assert_eq!(one.to_query_object().unwrap()["type"], "study_name");

        let two = Constraint::Study(StudyConstraint {
            studies: vec![Study::new("S1"), Study::new("S2")],
        });
        let q = two.to_query_object().unwrap();
        assert_eq!(q["type"], "or");
        assert_eq!(two.text_representation(), "Study: S1, S2");
    }

    #[test]
    fn test_patient_set_selector_priority() {
        let p = PatientSetConstraint {
            subject_ids: None,
            patient_ids: Some(vec![1, 2]),
            patient_set_id: Some(7),
        };
        assert_eq!(
            p.to_query_object().unwrap(),
            json!({"type": "patient_set", "patientIds": [1, 2]})
        );
        assert!(PatientSetConstraint::default().to_query_object().is_none());
    }

    #[test]
    fn test_patient_query_object_stubs() {
        assert!(Constraint::concept(numeric("/a/")).to_patient_query_object().is_none());
        let set = Constraint::PatientSet(PatientSetConstraint {
            patient_set_id: Some(4),
            ..Default::default()
        });
        assert!(set.to_patient_query_object().is_none());

        let study = Constraint::study("S1").to_patient_query_object().unwrap();
        assert_eq!(study["type"], "subselection");
        assert_eq!(study["dimension"], "patient");
    }
}
