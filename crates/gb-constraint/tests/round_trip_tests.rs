//! Round-trip tests: rendering a constraint and parsing it back.
//!
//! Combinations are built with at least two contributing children, since the
//! optimizer collapses single-argument groups into their only argument.

use gb_constraint::{
    generate_constraint_from_constraint_object, optimize_constraint_object,
    CombinationConstraint, CombinationState, Concept, ConceptConstraint, Constraint,
    PatientSetConstraint, TimeConstraint, TimeOperator, TrialVisitConstraint, ValueConstraint,
    ValueType,
};
use serde_json::json;

fn concept(path: &str, value_type: ValueType, code: &str) -> Concept {
    Concept::new(path, Some(value_type))
        .with_code(code)
        .with_label(path)
}

fn round_trip(constraint: &Constraint) -> Constraint {
    let wire = constraint
        .to_query_object()
        .expect("constraint should render a query object");
    generate_constraint_from_constraint_object(&wire).expect("rendered object should parse")
}

#[test]
fn test_true_round_trip() {
    assert_eq!(round_trip(&Constraint::True), Constraint::True);
}

#[test]
fn test_plain_concept_round_trip() {
    let c = Constraint::concept(concept("\\demo\\age\\", ValueType::Numeric, "DEM:AGE"));
    assert_eq!(round_trip(&c), c);
}

#[test]
fn test_numeric_concept_with_values_round_trip() {
    let mut cc = ConceptConstraint::new(concept("/demo/age/", ValueType::Numeric, "AGE"));
    cc.values.push(ValueConstraint::new("NUMERIC", ">=", json!(18)));
    cc.values.push(ValueConstraint::new("NUMERIC", "<", json!(65)));
    let c = Constraint::Concept(cc);

    let wire = c.to_query_object().unwrap();
    let args = wire["args"].as_array().unwrap();
    assert_eq!(args.len(), 3);
    assert_eq!(args[1]["type"], "value");

    assert_eq!(round_trip(&c), c);
}

#[test]
fn test_categorical_concept_with_values_round_trip() {
    let mut cc = ConceptConstraint::new(concept("/demo/sex/", ValueType::Categorical, "SEX"));
    cc.values.push(ValueConstraint::new("STRING", "=", json!("female")));
    cc.values.push(ValueConstraint::new("STRING", "=", json!("unknown")));
    let c = Constraint::Concept(cc);

    let wire = c.to_query_object().unwrap();
    assert_eq!(wire["args"][1]["type"], "or");

    assert_eq!(round_trip(&c), c);
}

#[test]
fn test_concept_with_date_and_visit_round_trip() {
    let mut cc = ConceptConstraint::new(concept("/lab/hb/", ValueType::Numeric, "HB"));
    cc.apply_obs_date_constraint = true;
    cc.obs_date_constraint = TimeConstraint {
        operator: TimeOperator::Between,
        values: vec!["2017-01-01".into(), "2018-01-01".into()],
    };
    cc.apply_trial_visit_constraint = true;
    cc.trial_visit_constraint = TrialVisitConstraint {
        visit_ids: vec![1, 4],
    };
    let c = Constraint::Concept(cc);
    assert_eq!(round_trip(&c), c);
}

#[test]
fn test_combination_round_trip_preserves_order_and_operator() {
    let c = Constraint::or(vec![
        Constraint::concept(concept("/a/", ValueType::Numeric, "A")),
        Constraint::study("SURVEY_1"),
        Constraint::not(Constraint::concept(concept("/b/", ValueType::Text, "B"))),
    ]);
    let parsed = round_trip(&c);
    assert_eq!(parsed, c);

    let combo = parsed.as_combination().unwrap();
    assert_eq!(combo.combination_state, CombinationState::Or);
    assert_eq!(
        combo
            .children
            .iter()
            .map(Constraint::class_name)
            .collect::<Vec<_>>(),
        vec!["ConceptConstraint", "StudyConstraint", "NegationConstraint"]
    );
}

#[test]
fn test_nested_combination_round_trip() {
    let c = Constraint::and(vec![
        Constraint::or(vec![Constraint::study("S1"), Constraint::study("S2")]),
        Constraint::not(Constraint::and(vec![
            Constraint::concept(concept("/x/", ValueType::Date, "X")),
            Constraint::True,
        ])),
    ]);
    assert_eq!(round_trip(&c), c);
}

#[test]
fn test_patient_set_round_trip() {
    for ps in [
        PatientSetConstraint {
            subject_ids: Some(vec!["s-1".into(), "s-2".into()]),
            ..Default::default()
        },
        PatientSetConstraint {
            patient_ids: Some(vec![1, 2, 3]),
            ..Default::default()
        },
        PatientSetConstraint {
            patient_set_id: Some(28),
            ..Default::default()
        },
    ] {
        let c = Constraint::PatientSet(ps);
        assert_eq!(round_trip(&c), c);
    }
}

#[test]
fn test_patient_set_has_no_patient_query_object() {
    let c = Constraint::PatientSet(PatientSetConstraint {
        patient_set_id: Some(1),
        ..Default::default()
    });
    assert_eq!(c.to_patient_query_object(), None);
}

#[test]
fn test_empty_constraints_render_nothing() {
    assert_eq!(Constraint::Concept(ConceptConstraint::default()).to_query_object(), None);
    assert_eq!(Constraint::and(vec![]).to_query_object(), None);
    assert_eq!(
        Constraint::not(Constraint::Concept(ConceptConstraint::default())).to_query_object(),
        None
    );
}

#[test]
fn test_has_non_empty_children() {
    let empty = CombinationConstraint::new(CombinationState::And);
    assert!(!empty.has_non_empty_children());

    let nested_empty = CombinationConstraint::with_children(
        CombinationState::And,
        vec![Constraint::Combination(CombinationConstraint::new(
            CombinationState::Or,
        ))],
    );
    assert!(!nested_empty.has_non_empty_children());

    let with_true = CombinationConstraint::with_children(CombinationState::And, vec![Constraint::True]);
    assert!(with_true.has_non_empty_children());
}

#[test]
fn test_saved_query_envelope_parses() {
    let saved = json!({
        "constraint": {
            "type": "subselection",
            "dimension": "patient",
            "constraint": {
                "type": "and",
                "args": [
                    {"type": "study_name", "studyId": "CATEGORICAL_VALUES"},
                    {"type": "negation", "arg": {"type": "true"}}
                ]
            }
        }
    });
    let parsed = generate_constraint_from_constraint_object(&saved).unwrap();
    assert_eq!(
        parsed,
        Constraint::and(vec![
            Constraint::study("CATEGORICAL_VALUES"),
            Constraint::not(Constraint::True),
        ])
    );
}

#[test]
fn test_optimize_is_idempotent_on_rendered_queries() {
    let c = Constraint::and(vec![
        Constraint::or(vec![Constraint::study("S1"), Constraint::study("S2")]),
        Constraint::concept(concept("/c/", ValueType::Categorical, "C")),
    ]);
    let wire = json!({"constraint": {"args": [c.to_query_object().unwrap()]}});
    let once = optimize_constraint_object(&wire);
    assert_eq!(optimize_constraint_object(&once), once);
}
