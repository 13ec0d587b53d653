//! Parser from backend query objects to [`Constraint`] trees.
//!
//! This is the left inverse of [`Constraint::to_query_object`]: feeding a
//! rendered constraint back through [`generate_constraint_from_constraint_object`]
//! rebuilds an equivalent tree.

use serde_json::Value;

use crate::ast::{
    CombinationConstraint, CombinationState, ConceptConstraint, Constraint, NegationConstraint,
    PatientSetConstraint, Study, StudyConstraint, TimeConstraint, TimeOperator,
    TrialVisitConstraint, ValueConstraint,
};
use crate::concept::{Concept, ValueType};
use crate::error::{ConstraintError, ConstraintResult};
use crate::optimizer::optimize_constraint_object;

/// Fields a concept argument inherits from the combination that holds it.
const INHERITED_CONCEPT_FIELDS: [&str; 5] =
    ["valueType", "conceptPath", "name", "fullName", "conceptCode"];

/// Parses a backend query object into a constraint.
///
/// The object is optimized first (see [`optimize_constraint_object`]), then
/// dispatched on its `type`: `concept`, `study_name`, `patient_set`,
/// `combination`, `and`, `or`, `true`, `negation` and `subselection`
/// (patient dimension only).
///
/// # Errors
///
/// Fails on a missing or unknown `type`, on missing required fields and on
/// subselections over any dimension other than `patient`.
///
/// # Example
///
/// ```rust
/// use gb_constraint::{generate_constraint_from_constraint_object, Constraint};
/// use serde_json::json;
///
/// let c = generate_constraint_from_constraint_object(&json!({
///     "type": "negation",
///     "arg": {"type": "study_name", "studyId": "S1"}
/// })).unwrap();
/// assert!(matches!(c, Constraint::Negation(_)));
/// ```
pub fn generate_constraint_from_constraint_object(input: &Value) -> ConstraintResult<Constraint> {
    let object = optimize_constraint_object(input);
    parse_optimized(&object)
}

fn parse_optimized(object: &Value) -> ConstraintResult<Constraint> {
    let type_name = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ConstraintError::MissingType(object.to_string()))?;

    match type_name {
        "concept" => Ok(Constraint::Concept(ConceptConstraint::new(parse_concept(
            object,
        )?))),
        "study_name" => {
            let study_id = str_field(object, "studyId")
                .ok_or_else(|| ConstraintError::missing("study_name", "studyId"))?;
            Ok(Constraint::Study(StudyConstraint {
                studies: vec![Study::new(study_id)],
            }))
        }
        "patient_set" => parse_patient_set(object).map(Constraint::PatientSet),
        "combination" => {
            let state = match object.get("operator").and_then(Value::as_str) {
                Some("and") => CombinationState::And,
                _ => CombinationState::Or,
            };
            parse_combination(object, state)
        }
        "and" | "or" => {
            let state = if type_name == "and" {
                CombinationState::And
            } else {
                CombinationState::Or
            };
            parse_combination(object, state)
        }
        "true" => Ok(Constraint::True),
        "negation" => {
            let arg = object
                .get("arg")
                .ok_or_else(|| ConstraintError::missing("negation", "arg"))?;
            let child = generate_constraint_from_constraint_object(arg)?;
            Ok(Constraint::Negation(NegationConstraint::new(child)))
        }
        "subselection" => {
            let dimension = object.get("dimension").and_then(Value::as_str);
            if dimension != Some("patient") {
                return Err(ConstraintError::UnsupportedDimension(
                    dimension.unwrap_or("<none>").to_string(),
                ));
            }
            let inner = object
                .get("constraint")
                .ok_or_else(|| ConstraintError::missing("subselection", "constraint"))?;
            generate_constraint_from_constraint_object(inner)
        }
        other => Err(ConstraintError::UnknownType(other.to_string())),
    }
}

fn parse_combination(object: &Value, state: CombinationState) -> ConstraintResult<Constraint> {
    let args = object
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(|| ConstraintError::missing(state.as_str(), "args"))?;

    // concept arguments take the descriptive fields of their parent
    let args: Vec<Value> = args.iter().map(|arg| inherit_concept_fields(object, arg)).collect();

    if state == CombinationState::And {
        if let Some(concept_constraint) = recognize_concept_constraint(&args)? {
            return Ok(Constraint::Concept(concept_constraint));
        }
    }

    let children = args
        .iter()
        .map(generate_constraint_from_constraint_object)
        .collect::<ConstraintResult<Vec<_>>>()?;
    Ok(Constraint::Combination(CombinationConstraint::with_children(
        state, children,
    )))
}

fn inherit_concept_fields(parent: &Value, arg: &Value) -> Value {
    if arg.get("type").and_then(Value::as_str) != Some("concept") {
        return arg.clone();
    }
    let mut arg = arg.clone();
    if let Some(fields) = arg.as_object_mut() {
        for field in INHERITED_CONCEPT_FIELDS {
            if let Some(value) = parent.get(field) {
                fields.insert(field.to_string(), value.clone());
            }
        }
    }
    arg
}

/// Recognizes the `and` shape rendered by a concept constraint: the concept
/// first, followed only by value, observation-date and trial-visit restrictions.
fn recognize_concept_constraint(args: &[Value]) -> ConstraintResult<Option<ConceptConstraint>> {
    let Some((head, rest)) = args.split_first() else {
        return Ok(None);
    };
    if type_of(head) != Some("concept") || rest.is_empty() || !rest.iter().all(is_concept_restriction)
    {
        return Ok(None);
    }

    let mut constraint = ConceptConstraint::new(parse_concept(head)?);
    for restriction in rest {
        match type_of(restriction) {
            Some("value") => constraint.values.push(parse_value(restriction)),
            Some("or") => {
                if let Some(alternatives) = restriction.get("args").and_then(Value::as_array) {
                    constraint.values.extend(alternatives.iter().map(parse_value));
                }
            }
            Some("time") => {
                constraint.obs_date_constraint = parse_time(restriction)?;
                constraint.apply_obs_date_constraint = true;
            }
            Some("field") => {
                constraint.trial_visit_constraint = parse_trial_visit(restriction);
                constraint.apply_trial_visit_constraint = true;
            }
            _ => {}
        }
    }
    Ok(Some(constraint))
}

fn is_concept_restriction(arg: &Value) -> bool {
    match type_of(arg) {
        Some("value") | Some("time") => true,
        Some("or") => arg
            .get("args")
            .and_then(Value::as_array)
            .is_some_and(|alts| !alts.is_empty() && alts.iter().all(|a| type_of(a) == Some("value"))),
        Some("field") => {
            arg.pointer("/field/dimension").and_then(Value::as_str) == Some("trial visit")
        }
        _ => false,
    }
}

fn parse_concept(object: &Value) -> ConstraintResult<Concept> {
    let path = str_field(object, "conceptPath")
        .or_else(|| str_field(object, "path"))
        .ok_or_else(|| ConstraintError::missing("concept", "conceptPath"))?;
    let value_type = str_field(object, "valueType")
        .map(|vt| vt.parse::<ValueType>())
        .transpose()?;
    let name = str_field(object, "name");
    let full_name = str_field(object, "fullName");

    let label = match (&name, &full_name) {
        (Some(name), Some(full_name)) => format!("{} ({})", name, strip_tail(full_name, name)),
        _ => path.clone(),
    };

    Ok(Concept {
        path,
        value_type,
        label,
        code: str_field(object, "conceptCode"),
        name,
        full_name,
        ..Default::default()
    })
}

/// Removes the trailing `\name\` (or `/name/`) segment of a full name.
fn strip_tail<'a>(full_name: &'a str, name: &str) -> &'a str {
    for sep in ['\\', '/'] {
        let tail = format!("{sep}{name}{sep}");
        if let Some(head) = full_name.strip_suffix(tail.as_str()) {
            return head;
        }
    }
    full_name
}

fn parse_patient_set(object: &Value) -> ConstraintResult<PatientSetConstraint> {
    let mut constraint = PatientSetConstraint::default();
    if let Some(ids) = object.get("subjectIds").and_then(Value::as_array) {
        constraint.subject_ids = Some(
            ids.iter()
                .map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        );
    } else if let Some(ids) = object.get("patientIds").and_then(Value::as_array) {
        let parsed = ids
            .iter()
            .map(|id| {
                id.as_i64()
                    .ok_or_else(|| ConstraintError::invalid("patientIds", "expected integers"))
            })
            .collect::<ConstraintResult<Vec<_>>>()?;
        constraint.patient_ids = Some(parsed);
    } else if let Some(id) = object.get("patientSetId") {
        let id = id
            .as_i64()
            .ok_or_else(|| ConstraintError::invalid("patientSetId", "expected an integer"))?;
        constraint.patient_set_id = Some(id);
    }
    Ok(constraint)
}

fn parse_value(object: &Value) -> ValueConstraint {
    ValueConstraint::new(
        str_field(object, "valueType").unwrap_or_default(),
        str_field(object, "operator").unwrap_or_default(),
        object.get("value").cloned().unwrap_or(Value::Null),
    )
}

fn parse_time(object: &Value) -> ConstraintResult<TimeConstraint> {
    let operator = object
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| ConstraintError::missing("time", "operator"))?;
    let operator = TimeOperator::from_wire(operator)
        .ok_or_else(|| ConstraintError::invalid("operator", format!("unknown date operator '{}'", operator)))?;
    let values = object
        .get("values")
        .and_then(Value::as_array)
        .map(|vs| vs.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();
    Ok(TimeConstraint { operator, values })
}

fn parse_trial_visit(object: &Value) -> TrialVisitConstraint {
    let visit_ids = object
        .get("value")
        .and_then(Value::as_array)
        .map(|vs| vs.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    TrialVisitConstraint { visit_ids }
}

fn type_of(object: &Value) -> Option<&str> {
    object.get("type").and_then(Value::as_str)
}

fn str_field(object: &Value, field: &str) -> Option<String> {
    object.get(field).and_then(Value::as_str).map(String::from)
}
