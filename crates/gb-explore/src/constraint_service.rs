//! Constraint service: selection state and the two-stage count pipeline.
//!
//! The selection is kept as two root combinations. The inclusion root holds
//! what patients must match and the exclusion root what they must not.
//!
//! Counts are computed in two stages:
//!
//! 1. [`update_counts_1`](ConstraintService::update_counts_1) counts the
//!    inclusion and exclusion sets and fetches per-study and per-concept
//!    counts. The counts are written onto the tree at once; the projection
//!    tree is rebuilt and stage 2 started once no child load is pending.
//! 2. [`update_counts_2`](ConstraintService::update_counts_2) counts the
//!    selection combined with the projection (patients, observations,
//!    concepts, studies) and loads the export formats.
//!
//! Each stage has its own [`CallQueue`]. A response is applied only if its
//! call is still the latest of its stage, so an older, slower response can
//! never overwrite a newer one.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use gb_constraint::{
    generate_constraint_from_constraint_object, CombinationConstraint, CombinationState,
    Constraint,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::call_queue::{CallQueue, CallToken};
use crate::config::ExploreConfig;
use crate::counts::{
    AlertMessage, CountItem, CountSummary, ExportDataFormat, ObservationsQuery, SavedQuery,
    Severity,
};
use crate::error::ExploreResult;
use crate::registry::{ConceptRegistry, SharedRegistry};
use crate::traits::ResourceService;
use crate::tree::{NodeId, TreeForest, TreeNodeType};
use crate::tree_service::{
    concept_from_modifier_tree_node, concept_from_tree_node, ChildrenLoad, TreeNodeService,
};

// =============================================================================
// Count state
// =============================================================================

/// Loading state of one count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingState {
    /// A request is in flight.
    Loading,
    /// The last request finished.
    #[default]
    Complete,
}

/// Stage 1 counts: the selection alone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionCounts {
    /// Patients matching the inclusion criteria.
    pub inclusion_patient_count: u64,
    /// Patients matching the inclusion and exclusion criteria.
    pub exclusion_patient_count: u64,
    /// Inclusion minus exclusion.
    pub patient_count: u64,
    /// Number of concepts with observations for the selection.
    pub concept_count: usize,
    /// Number of studies with observations for the selection.
    pub study_count: usize,
    /// Concept codes with observations.
    pub concept_codes: Vec<String>,
    /// Study ids with observations.
    pub study_codes: Vec<String>,
    /// Counts per concept code.
    pub concept_count_map: BTreeMap<String, CountItem>,
    /// Counts per study.
    pub study_count_map: BTreeMap<String, CountItem>,
    /// Inclusion count state.
    pub loading_state_inclusion: LoadingState,
    /// Exclusion count state.
    pub loading_state_exclusion: LoadingState,
    /// Total count state.
    pub loading_state_total: LoadingState,
}

/// Stage 2 counts: the selection combined with the projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionCounts {
    /// Patients.
    pub patient_count: u64,
    /// Observations.
    pub observation_count: u64,
    /// Concepts with observations.
    pub concept_count: usize,
    /// Studies with observations.
    pub study_count: usize,
    /// Concept codes with observations.
    pub concept_codes: Vec<String>,
    /// Study ids with observations.
    pub study_codes: Vec<String>,
    /// Patient count request in flight.
    pub is_loading_patient_count: bool,
    /// Observation count request in flight.
    pub is_loading_observation_count: bool,
    /// Concept count request in flight.
    pub is_loading_concept_count: bool,
    /// Study count request in flight.
    pub is_loading_study_count: bool,
    /// Export formats offered for the combination.
    pub export_formats: Vec<ExportDataFormat>,
    /// Export format request in flight.
    pub is_loading_export_formats: bool,
}

impl Default for ProjectionCounts {
    fn default() -> Self {
        Self {
            patient_count: 0,
            observation_count: 0,
            concept_count: 0,
            study_count: 0,
            concept_codes: Vec::new(),
            study_codes: Vec::new(),
            is_loading_patient_count: true,
            is_loading_observation_count: true,
            is_loading_concept_count: true,
            is_loading_study_count: true,
            export_formats: Vec::new(),
            is_loading_export_formats: false,
        }
    }
}

impl ProjectionCounts {
    fn set_loading(&mut self) {
        self.is_loading_patient_count = true;
        self.is_loading_observation_count = true;
        self.is_loading_concept_count = true;
        self.is_loading_study_count = true;
    }
}

#[derive(Debug, Clone, Copy)]
enum PartialCount {
    Inclusion,
    Exclusion,
}

impl PartialCount {
    fn label(&self) -> &'static str {
        match self {
            PartialCount::Inclusion => "Inclusion",
            PartialCount::Exclusion => "Exclusion",
        }
    }
}

#[derive(Debug)]
struct ConstraintState {
    root_inclusion: CombinationConstraint,
    root_exclusion: CombinationConstraint,
    selection: SelectionCounts,
    projection: ProjectionCounts,
    queue_1: CallQueue,
    queue_2: CallQueue,
    alert_messages: Vec<AlertMessage>,
    query: Option<SavedQuery>,
    queries: Vec<SavedQuery>,
}

impl Default for ConstraintState {
    fn default() -> Self {
        Self {
            root_inclusion: CombinationConstraint::root(),
            root_exclusion: CombinationConstraint::root(),
            selection: SelectionCounts::default(),
            projection: ProjectionCounts::default(),
            queue_1: CallQueue::new(),
            queue_2: CallQueue::new(),
            alert_messages: Vec::new(),
            query: None,
            queries: Vec::new(),
        }
    }
}

struct Stage1Plan {
    token: CallToken,
    inclusion: Constraint,
    exclusion: Option<Constraint>,
    selection: Constraint,
}

struct ConstraintInner {
    config: ExploreConfig,
    resources: Arc<dyn ResourceService>,
    tree: TreeNodeService,
    registry: SharedRegistry,
    state: Mutex<ConstraintState>,
}

/// Owner of the selection and of the count pipeline.
///
/// Cloning yields another handle to the same state.
///
/// # Example
///
/// ```ignore
/// let service = ConstraintService::new(config, resources, tree);
/// service.load_tree().await?;
/// service.add_inclusion_constraint(Constraint::concept(age));
/// service.update_counts_1().await;
/// assert_eq!(service.selection_counts().loading_state_total, LoadingState::Complete);
/// ```
#[derive(Clone)]
pub struct ConstraintService {
    inner: Arc<ConstraintInner>,
}

impl ConstraintService {
    /// Creates the service with an empty selection and registry.
    pub fn new(config: ExploreConfig, resources: Arc<dyn ResourceService>, tree: TreeNodeService) -> Self {
        Self {
            inner: Arc::new(ConstraintInner {
                config,
                resources,
                tree,
                registry: ConceptRegistry::shared(),
                state: Mutex::new(ConstraintState::default()),
            }),
        }
    }

    /// The tree node service.
    pub fn tree(&self) -> &TreeNodeService {
        &self.inner.tree
    }

    /// The concept registry filled by tree processing.
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.inner.registry)
    }

    /// Loads the tree roots into this service's registry.
    pub async fn load_tree(&self) -> ExploreResult<()> {
        self.inner.tree.load(&self.inner.registry).await
    }

    /// Loads the children of a tree node into this service's registry.
    pub async fn load_children_nodes(&self, parent: NodeId) -> ExploreResult<ChildrenLoad> {
        self.inner
            .tree
            .load_children_nodes(parent, &self.inner.registry)
            .await
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Copy of the inclusion root.
    pub fn root_inclusion_constraint(&self) -> CombinationConstraint {
        self.inner.state.lock().root_inclusion.clone()
    }

    /// Copy of the exclusion root.
    pub fn root_exclusion_constraint(&self) -> CombinationConstraint {
        self.inner.state.lock().root_exclusion.clone()
    }

    /// Adds a criterion to the inclusion root.
    pub fn add_inclusion_constraint(&self, constraint: Constraint) {
        self.inner.state.lock().root_inclusion.children.push(constraint);
    }

    /// Adds a criterion to the exclusion root.
    pub fn add_exclusion_constraint(&self, constraint: Constraint) {
        self.inner.state.lock().root_exclusion.children.push(constraint);
    }

    /// Empties both roots.
    pub fn clear_selection_constraint(&self) {
        let mut state = self.inner.state.lock();
        state.root_inclusion.children.clear();
        state.root_exclusion.children.clear();
    }

    /// The selection as one constraint.
    pub fn get_selection_constraint(&self) -> Constraint {
        let state = self.inner.state.lock();
        selection_constraint(&state.root_inclusion, &state.root_exclusion)
    }

    /// Decomposes `constraint` into the inclusion and exclusion roots,
    /// adding to what is already there.
    pub fn put_selection_constraint(&self, constraint: &Constraint) {
        let mut state = self.inner.state.lock();
        let ConstraintState {
            root_inclusion,
            root_exclusion,
            ..
        } = &mut *state;
        put_selection(constraint, root_inclusion, root_exclusion);
    }

    /// The projection as one constraint.
    pub fn get_projection_constraint(&self) -> Constraint {
        let selected = self.inner.tree.selected_projection_tree_data();
        self.inner
            .tree
            .with_forest(|forest| projection_constraint(forest, &selected))
    }

    /// Constraint for a node dropped onto the selection, or `None` if the
    /// node yields nothing usable.
    ///
    /// An unknown-type node stands for its descendants, unless it has at
    /// least `max_unknown_node_descendants` of them.
    pub fn generate_constraint_from_selected_node(&self, id: NodeId) -> ExploreResult<Option<Constraint>> {
        let max = self.inner.config.max_unknown_node_descendants;
        self.inner
            .tree
            .with_forest(|forest| constraint_from_node(forest, id, max))
    }

    // =========================================================================
    // Count pipeline
    // =========================================================================

    /// Snapshot of the stage 1 counts.
    pub fn selection_counts(&self) -> SelectionCounts {
        self.inner.state.lock().selection.clone()
    }

    /// Snapshot of the stage 2 counts.
    pub fn projection_counts(&self) -> ProjectionCounts {
        self.inner.state.lock().projection.clone()
    }

    /// Starts stage 1.
    ///
    /// The call is registered and the loading flags are set before this
    /// returns; the returned future performs the requests. Driving it to
    /// completion also drives the stage 2 it triggers.
    pub fn update_counts_1(&self) -> impl Future<Output = ()> + Send + 'static {
        let plan = {
            let mut state = self.inner.state.lock();
            let token = state.queue_1.issue();
            state.selection.loading_state_inclusion = LoadingState::Loading;
            state.selection.loading_state_exclusion = LoadingState::Loading;
            state.selection.loading_state_total = LoadingState::Loading;
            state.projection.set_loading();

            let inclusion = generate_inclusion_constraint(&state.root_inclusion);
            let exclusion = if state.root_exclusion.has_non_empty_children() {
                Some(generate_exclusion_constraint(
                    &state.root_inclusion,
                    &state.root_exclusion,
                ))
            } else {
                None
            };
            if exclusion.is_none() {
                state.selection.exclusion_patient_count = 0;
                state.selection.loading_state_exclusion = LoadingState::Complete;
            }
            let selection = selection_constraint(&state.root_inclusion, &state.root_exclusion);
            debug!(call = token.value(), "stage 1 started");
            Stage1Plan {
                token,
                inclusion,
                exclusion,
                selection,
            }
        };
        let service = self.clone();
        async move { service.run_stage_1(plan).await }
    }

    async fn run_stage_1(&self, plan: Stage1Plan) {
        let Stage1Plan {
            token,
            inclusion,
            exclusion,
            selection,
        } = plan;

        let totals = self.count_selection_totals(token, &inclusion, exclusion.as_ref());
        let per_concept = async {
            if let Some(summary) = self.count_selection_concepts(token, &selection).await {
                self.hand_off_to_projection(token, summary).await;
            }
        };
        tokio::join!(totals, per_concept);
    }

    async fn count_selection_totals(
        &self,
        token: CallToken,
        inclusion: &Constraint,
        exclusion: Option<&Constraint>,
    ) {
        let resources = &self.inner.resources;
        let inclusion_branch = async {
            let result = resources
                .get_patients(inclusion, Some(PartialCount::Inclusion.label()))
                .await;
            self.apply_partial_count(token, PartialCount::Inclusion, result)
        };
        let exclusion_branch = async {
            match exclusion {
                None => Some(0),
                Some(constraint) => {
                    let result = resources
                        .get_patients(constraint, Some(PartialCount::Exclusion.label()))
                        .await;
                    self.apply_partial_count(token, PartialCount::Exclusion, result)
                }
            }
        };

        let (included, excluded) = tokio::join!(inclusion_branch, exclusion_branch);
        if let (Some(included), Some(excluded)) = (included, excluded) {
            let mut state = self.inner.state.lock();
            if state.queue_1.is_latest(token) {
                state.selection.patient_count = included.saturating_sub(excluded);
                state.selection.loading_state_total = LoadingState::Complete;
                debug!(
                    call = token.value(),
                    patients = state.selection.patient_count,
                    "selection total updated"
                );
            }
        }
    }

    fn apply_partial_count(
        &self,
        token: CallToken,
        which: PartialCount,
        result: ExploreResult<Vec<String>>,
    ) -> Option<u64> {
        let mut state = self.inner.state.lock();
        let latest = state.queue_1.is_latest(token);
        let selection = &mut state.selection;
        match result {
            Ok(patients) if latest => {
                let count = patients.len() as u64;
                match which {
                    PartialCount::Inclusion => {
                        selection.inclusion_patient_count = count;
                        selection.loading_state_inclusion = LoadingState::Complete;
                    }
                    PartialCount::Exclusion => {
                        selection.exclusion_patient_count = count;
                        selection.loading_state_exclusion = LoadingState::Complete;
                    }
                }
                Some(count)
            }
            Ok(_) => {
                debug!(call = token.value(), count = which.label(), "discarding stale count");
                None
            }
            Err(e) => {
                error!(call = token.value(), count = which.label(), error = %e, "patient count failed");
                if latest {
                    match which {
                        PartialCount::Inclusion => {
                            selection.loading_state_inclusion = LoadingState::Complete
                        }
                        PartialCount::Exclusion => {
                            selection.loading_state_exclusion = LoadingState::Complete
                        }
                    }
                }
                None
            }
        }
    }

    async fn count_selection_concepts(
        &self,
        token: CallToken,
        selection: &Constraint,
    ) -> Option<CountSummary> {
        let counts = match self
            .inner
            .resources
            .get_counts_per_study_and_concept(selection)
            .await
        {
            Ok(counts) => counts,
            Err(e) => {
                error!(call = token.value(), error = %e, "counts per study and concept failed");
                return None;
            }
        };

        let summary = CountSummary::from_counts(&counts);
        let mut state = self.inner.state.lock();
        if !state.queue_1.is_latest(token) {
            debug!(call = token.value(), "discarding stale concept counts");
            return None;
        }
        let stage = &mut state.selection;
        stage.concept_count_map = summary.concept_count_map.clone();
        stage.study_count_map = summary.study_count_map.clone();
        stage.concept_codes = summary.concept_codes.clone();
        stage.study_codes = summary.study_codes.clone();
        stage.concept_count = summary.concept_count();
        stage.study_count = summary.study_count();
        Some(summary)
    }

    async fn hand_off_to_projection(&self, token: CallToken, summary: CountSummary) {
        let tree = &self.inner.tree;
        tree.update_tree_node_counts(&summary.study_count_map, &summary.concept_count_map);

        // the projection tree needs every pending child load attached
        tree.wait_until_ready().await;
        let checklist = {
            let mut state = self.inner.state.lock();
            if !state.queue_1.is_latest(token) {
                debug!(call = token.value(), "stage 1 superseded before projection update");
                return;
            }
            state.query.take().map(|query| query.observations_query.data)
        };

        tree.update_projection_tree_data(&summary.concept_count_map, checklist.as_deref());
        self.update_counts_2().await;
    }

    /// Starts stage 2 for the current selection and projection.
    ///
    /// Like [`update_counts_1`](Self::update_counts_1), the call is
    /// registered before this returns.
    pub fn update_counts_2(&self) -> impl Future<Output = ()> + Send + 'static {
        let (token, selection) = {
            let mut state = self.inner.state.lock();
            let token = state.queue_2.issue();
            state.projection.set_loading();
            state.projection.is_loading_export_formats = true;
            state.query = None;
            let selection = selection_constraint(&state.root_inclusion, &state.root_exclusion);
            (token, selection)
        };
        let combination = Constraint::and(vec![selection, self.get_projection_constraint()]);
        debug!(call = token.value(), "stage 2 started");
        let service = self.clone();
        async move { service.run_stage_2(token, combination).await }
    }

    async fn run_stage_2(&self, token: CallToken, combination: Constraint) {
        let resources = &self.inner.resources;
        let combination = &combination;

        let patients = async {
            let result = resources.get_patients(combination, None).await;
            self.apply_projection(token, "patient count", result, |p, patients| {
                p.patient_count = patients.len() as u64;
                p.is_loading_patient_count = false;
            });
        };
        let observations = async {
            let result = resources.get_observation_count(combination).await;
            self.apply_projection(token, "observation count", result, |p, count| {
                p.observation_count = count;
                p.is_loading_observation_count = false;
            });
        };
        let counts = async {
            let result = resources.get_counts_per_study_and_concept(combination).await;
            self.apply_projection(token, "concept and study counts", result, |p, counts| {
                let summary = CountSummary::from_counts(&counts);
                p.concept_count = summary.concept_count();
                p.study_count = summary.study_count();
                p.concept_codes = summary.concept_codes;
                p.study_codes = summary.study_codes;
                p.is_loading_concept_count = false;
                p.is_loading_study_count = false;
            });
        };
        let file_formats = &self.inner.config.export_file_formats;
        let exports = async {
            let result = resources.get_export_data_formats(combination).await;
            self.apply_projection(token, "export formats", result, |p, names| {
                p.export_formats = ExportDataFormat::build_all(&names, file_formats);
                p.is_loading_export_formats = false;
            });
        };

        tokio::join!(patients, observations, counts, exports);
    }

    fn apply_projection<T>(
        &self,
        token: CallToken,
        what: &str,
        result: ExploreResult<T>,
        apply: impl FnOnce(&mut ProjectionCounts, T),
    ) {
        match result {
            Ok(value) => {
                let mut state = self.inner.state.lock();
                if state.queue_2.is_latest(token) {
                    apply(&mut state.projection, value);
                } else {
                    debug!(call = token.value(), what = %what, "discarding stale projection result");
                }
            }
            Err(e) => error!(call = token.value(), what = %what, error = %e, "projection update failed"),
        }
    }

    /// Toggles one file format of an export data format. Returns false if
    /// either format is unknown.
    pub fn set_export_file_format_checked(&self, data_format: &str, file_format: &str, checked: bool) -> bool {
        let mut state = self.inner.state.lock();
        state
            .projection
            .export_formats
            .iter_mut()
            .find(|f| f.name == data_format)
            .is_some_and(|f| f.set_file_format_checked(file_format, checked))
    }

    // =========================================================================
    // Saved queries
    // =========================================================================

    /// Replaces the selection with a saved query's and starts stage 1.
    ///
    /// The query's projection paths are checked in the projection tree once
    /// stage 1 rebuilds it.
    ///
    /// # Errors
    ///
    /// Fails without touching the selection if the query's patient
    /// constraint cannot be parsed.
    pub fn put_query(&self, query: SavedQuery) -> ExploreResult<impl Future<Output = ()> + Send + 'static> {
        let selection = match &query.patients_query {
            Some(object) => generate_constraint_from_constraint_object(object)?,
            None => Constraint::True,
        };
        {
            let mut state = self.inner.state.lock();
            let ConstraintState {
                root_inclusion,
                root_exclusion,
                ..
            } = &mut *state;
            root_inclusion.children.clear();
            root_exclusion.children.clear();
            put_selection(&selection, root_inclusion, root_exclusion);
            info!(query = %query.name, "query restored");
            state.query = Some(query);
        }
        Ok(self.update_counts_1())
    }

    /// The query being restored, until stage 1 consumes it.
    pub fn query(&self) -> Option<SavedQuery> {
        self.inner.state.lock().query.clone()
    }

    /// Queries saved in this session.
    pub fn queries(&self) -> Vec<SavedQuery> {
        self.inner.state.lock().queries.clone()
    }

    /// Saves the current selection and projection under `name`.
    pub async fn save_query(&self, name: &str) -> ExploreResult<SavedQuery> {
        let body = SavedQuery {
            id: None,
            name: name.to_string(),
            patients_query: self.get_selection_constraint().to_patient_query_object(),
            observations_query: ObservationsQuery {
                data: self.inner.tree.selected_projection_paths(),
            },
            bookmarked: false,
            collapsed: false,
            visible: false,
        };

        match self.inner.resources.save_query(&body).await {
            Ok(mut saved) => {
                saved.collapsed = true;
                saved.visible = true;
                self.inner.state.lock().queries.push(saved.clone());
                info!(query = %name, "query saved");
                self.alert(format!("Query \"{}\" is saved.", name), "", Severity::Success);
                Ok(saved)
            }
            Err(e) => {
                error!(query = %name, error = %e, "could not save query");
                self.alert(format!("Could not save the query \"{}\".", name), "", Severity::Error);
                Err(e)
            }
        }
    }

    /// Updates fields of a saved query.
    pub async fn update_query(&self, query_id: &str, body: &Value) -> ExploreResult<()> {
        self.inner
            .resources
            .update_query(query_id, body)
            .await
            .inspect_err(|e| error!(query_id, error = %e, "could not update query"))
    }

    /// Deletes a saved query.
    pub async fn delete_query(&self, query_id: &str) -> ExploreResult<()> {
        match self.inner.resources.delete_query(query_id).await {
            Ok(()) => {
                self.inner
                    .state
                    .lock()
                    .queries
                    .retain(|q| q.id.as_deref() != Some(query_id));
                Ok(())
            }
            Err(e) => {
                error!(query_id, error = %e, "could not delete query");
                Err(e)
            }
        }
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    /// Replaces the alert messages with a single one.
    pub fn alert(&self, summary: impl Into<String>, detail: impl Into<String>, severity: Severity) {
        self.inner.state.lock().alert_messages = vec![AlertMessage {
            severity,
            summary: summary.into(),
            detail: detail.into(),
        }];
    }

    /// Current alert messages.
    pub fn alert_messages(&self) -> Vec<AlertMessage> {
        self.inner.state.lock().alert_messages.clone()
    }
}

// =============================================================================
// Selection algebra
// =============================================================================

/// The inclusion root, or `True` when it has no non-empty children.
pub fn generate_inclusion_constraint(inclusion: &CombinationConstraint) -> Constraint {
    if inclusion.has_non_empty_children() {
        Constraint::Combination(inclusion.clone())
    } else {
        Constraint::True
    }
}

/// Patients matching both roots: `AND(inclusion, exclusion)`.
pub fn generate_exclusion_constraint(
    inclusion: &CombinationConstraint,
    exclusion: &CombinationConstraint,
) -> Constraint {
    Constraint::and(vec![
        generate_inclusion_constraint(inclusion),
        Constraint::Combination(exclusion.clone()),
    ])
}

/// The selection: the inclusion criteria minus the exclusion criteria.
pub fn selection_constraint(
    inclusion: &CombinationConstraint,
    exclusion: &CombinationConstraint,
) -> Constraint {
    let included = generate_inclusion_constraint(inclusion);
    if !exclusion.has_non_empty_children() {
        return included;
    }
    let negated = Constraint::not(Constraint::Combination(exclusion.clone()));
    match included {
        Constraint::True => negated,
        included => Constraint::and(vec![included, negated]),
    }
}

/// Inverse of [`selection_constraint`].
///
/// A bare negation, or the negated half of a two-child AND, goes to the
/// exclusion root (flattened if it is an AND). Other AND combinations are
/// flattened into the inclusion root. Everything else is added whole.
pub fn put_selection(
    constraint: &Constraint,
    inclusion: &mut CombinationConstraint,
    exclusion: &mut CombinationConstraint,
) {
    match constraint {
        Constraint::Negation(negation) => push_exclusion(&negation.constraint, exclusion),
        other => decompose_inclusion(other, inclusion, exclusion),
    }
}

fn decompose_inclusion(
    constraint: &Constraint,
    inclusion: &mut CombinationConstraint,
    exclusion: &mut CombinationConstraint,
) {
    match constraint {
        Constraint::True => {}
        Constraint::Combination(combination)
            if combination.combination_state == CombinationState::And =>
        {
            match split_negation(&combination.children) {
                Some((kept, negated)) => {
                    push_exclusion(negated, exclusion);
                    decompose_inclusion(kept, inclusion, exclusion);
                }
                None => {
                    for child in &combination.children {
                        decompose_inclusion(child, inclusion, exclusion);
                    }
                }
            }
        }
        other => inclusion.children.push(other.clone()),
    }
}

fn push_exclusion(negated: &Constraint, exclusion: &mut CombinationConstraint) {
    match negated {
        Constraint::Combination(combination)
            if combination.combination_state == CombinationState::And =>
        {
            exclusion.children.extend(combination.children.iter().cloned());
        }
        other => exclusion.children.push(other.clone()),
    }
}

/// For exactly two children, one of them a negation: the other child and
/// the negated constraint.
fn split_negation(children: &[Constraint]) -> Option<(&Constraint, &Constraint)> {
    match children {
        [Constraint::Negation(_), Constraint::Negation(_)] => None,
        [Constraint::Negation(negation), kept] | [kept, Constraint::Negation(negation)] => {
            Some((kept, negation.constraint.as_ref()))
        }
        _ => None,
    }
}

// =============================================================================
// Projection and dropped nodes
// =============================================================================

/// OR of the constraints of the selected projection nodes.
///
/// Only the topmost selected nodes are used; a selected node with children
/// stands for its leaf descendants. Nothing selected yields `NOT(True)`.
pub fn projection_constraint(forest: &TreeForest, selected: &[NodeId]) -> Constraint {
    let top = forest.top_tree_nodes(selected);
    if top.is_empty() {
        return Constraint::not(Constraint::True);
    }

    let mut leaves = Vec::new();
    for id in top {
        match forest.get(id) {
            Some(node) if node.has_children() => leaves.extend(
                forest.descendants_with_excluded_types(
                    id,
                    &[TreeNodeType::Unknown, TreeNodeType::Study],
                ),
            ),
            Some(_) => leaves.push(id),
            None => {}
        }
    }

    let mut constraints: Vec<Constraint> = leaves
        .into_iter()
        .filter_map(|id| leaf_constraint(forest, id))
        .collect();
    match constraints.len() {
        0 => Constraint::not(Constraint::True),
        1 => constraints.swap_remove(0),
        _ => Constraint::or(constraints),
    }
}

fn leaf_constraint(forest: &TreeForest, id: NodeId) -> Option<Constraint> {
    let node = forest.get(id)?;
    if let Some(object) = &node.constraint {
        return generate_constraint_from_constraint_object(object)
            .inspect_err(|e| error!(path = %node.path, error = %e, "failed to create constraint"))
            .ok();
    }
    if node.is_modifier() {
        return concept_from_modifier_tree_node(forest, id)
            .inspect_err(|e| error!(path = %node.path, error = %e, "failed to create constraint"))
            .ok()
            .map(Constraint::concept);
    }
    if node.node_type.is_concept() {
        return Some(Constraint::concept(concept_from_tree_node(node)));
    }
    None
}

fn constraint_from_node(forest: &TreeForest, id: NodeId, max_descendants: usize) -> ExploreResult<Option<Constraint>> {
    let node = forest.node(id)?;
    match node.node_type {
        TreeNodeType::Study => {
            let study_id = node.study_id.clone().or_else(|| {
                node.constraint
                    .as_ref()
                    .and_then(|c| c.get("studyId"))
                    .and_then(Value::as_str)
                    .map(String::from)
            });
            Ok(study_id.map(Constraint::study))
        }
        TreeNodeType::Concept | TreeNodeType::ConceptFolder => match &node.constraint {
            Some(object) => Ok(Some(generate_constraint_from_constraint_object(object)?)),
            None => Ok(Some(Constraint::concept(concept_from_tree_node(node)))),
        },
        TreeNodeType::Modifier | TreeNodeType::ModifierFolder => Ok(Some(Constraint::concept(
            concept_from_modifier_tree_node(forest, id)?,
        ))),
        TreeNodeType::Unknown => {
            let descendants = forest.descendants_with_excluded_types(id, &[TreeNodeType::Unknown]);
            if descendants.len() >= max_descendants {
                debug!(node = %node.path, descendants = descendants.len(), "too many descendants to drop");
                return Ok(None);
            }
            let mut children = Vec::new();
            for descendant in descendants {
                if let Some(constraint) = constraint_from_node(forest, descendant, max_descendants)? {
                    children.push(constraint);
                }
            }
            Ok((!children.is_empty()).then(|| Constraint::or(children)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gb_constraint::{Concept, ValueType};
    use serde_json::json;

    use crate::tree::TreeNode;

    fn concept(path: &str) -> Constraint {
        Constraint::concept(Concept::new(path, None).with_label(path))
    }

    #[test]
    fn test_selection_with_empty_roots_is_true() {
        let root = CombinationConstraint::root();
        assert_eq!(selection_constraint(&root, &root), Constraint::True);
    }

    #[test]
    fn test_selection_with_exclusion_only_is_negation() {
        let inclusion = CombinationConstraint::root();
        let mut exclusion = CombinationConstraint::root();
        exclusion.children.push(concept("/b/"));

        let selection = selection_constraint(&inclusion, &exclusion);
        assert_eq!(selection, Constraint::not(Constraint::Combination(exclusion)));
    }

    #[test]
    fn test_put_inverts_selection() {
        let mut inclusion = CombinationConstraint::root();
        inclusion.children.push(concept("/a/"));
        inclusion
            .children
            .push(Constraint::or(vec![concept("/c/"), concept("/d/")]));
        let mut exclusion = CombinationConstraint::root();
        exclusion.children.push(concept("/b/"));
        let selection = selection_constraint(&inclusion, &exclusion);

        let mut new_inclusion = CombinationConstraint::root();
        let mut new_exclusion = CombinationConstraint::root();
        put_selection(&selection, &mut new_inclusion, &mut new_exclusion);

        assert_eq!(new_inclusion.children, inclusion.children);
        assert_eq!(new_exclusion.children, exclusion.children);
    }

    #[test]
    fn test_put_true_adds_nothing() {
        let mut inclusion = CombinationConstraint::root();
        let mut exclusion = CombinationConstraint::root();
        put_selection(&Constraint::True, &mut inclusion, &mut exclusion);
        assert!(inclusion.children.is_empty());
        assert!(exclusion.children.is_empty());
    }

    #[test]
    fn test_split_negation_needs_exactly_one() {
        let not_a = Constraint::not(concept("/a/"));
        assert!(split_negation(&[not_a.clone(), not_a.clone()]).is_none());
        assert!(split_negation(&[concept("/b/")]).is_none());
        let operands = [not_a, concept("/b/")];
        let (kept, negated) = split_negation(&operands).unwrap();
        assert_eq!(kept, &concept("/b/"));
        assert_eq!(negated, &concept("/a/"));
    }

    fn projection_forest() -> (TreeForest, NodeId, Vec<NodeId>) {
        let mut forest = TreeForest::new();
        let folder = forest.attach_roots(vec![TreeNode::new("/demo/", "Demo", TreeNodeType::ConceptFolder)])[0];
        let children = forest
            .attach_child_tree(
                folder,
                vec![
                    Some(TreeNode::new("/demo/age/", "Age", TreeNodeType::Concept).with_concept_type(ValueType::Numeric)),
                    Some(TreeNode::new("/demo/study/", "Study", TreeNodeType::Study).with_study_id("S1")),
                    Some(
                        TreeNode::new("/demo/sex/", "Sex", TreeNodeType::Concept)
                            .with_constraint(json!({"type": "concept", "conceptCode": "SEX", "path": "/demo/sex/"})),
                    ),
                ],
            )
            .unwrap();
        (forest, folder, children)
    }

    #[test]
    fn test_projection_empty_is_not_true() {
        let (forest, _, _) = projection_forest();
        assert_eq!(projection_constraint(&forest, &[]), Constraint::not(Constraint::True));
    }

    #[test]
    fn test_projection_single_leaf() {
        let (forest, _, children) = projection_forest();
        let constraint = projection_constraint(&forest, &[children[0]]);
        match constraint {
            Constraint::Concept(c) => assert_eq!(c.concept.unwrap().path, "/demo/age/"),
            other => panic!("expected a concept, got {other:?}"),
        }
    }

    #[test]
    fn test_projection_folder_expands_without_studies() {
        let (forest, folder, children) = projection_forest();
        let constraint = projection_constraint(&forest, &[folder, children[0]]);
        let combination = constraint.as_combination().unwrap();
        assert_eq!(combination.combination_state, CombinationState::Or);
        assert_eq!(combination.children.len(), 2);
    }

    #[test]
    fn test_dropped_study_and_concept() {
        let (forest, _, children) = projection_forest();
        assert_eq!(
            constraint_from_node(&forest, children[1], 10).unwrap(),
            Some(Constraint::study("S1"))
        );
        assert!(matches!(
            constraint_from_node(&forest, children[2], 10).unwrap(),
            Some(Constraint::Concept(_))
        ));
    }

    #[test]
    fn test_dropped_unknown_node() {
        let mut forest = TreeForest::new();
        let unknown = forest.attach_roots(vec![TreeNode::new("/u/", "U", TreeNodeType::Unknown)])[0];
        assert_eq!(constraint_from_node(&forest, unknown, 10).unwrap(), None);

        forest
            .attach_child_tree(
                unknown,
                vec![
                    Some(TreeNode::new("/u/a/", "A", TreeNodeType::Concept)),
                    Some(TreeNode::new("/u/b/", "B", TreeNodeType::Concept)),
                ],
            )
            .unwrap();
        let dropped = constraint_from_node(&forest, unknown, 10).unwrap().unwrap();
        assert_eq!(dropped.as_combination().unwrap().children.len(), 2);
        assert_eq!(constraint_from_node(&forest, unknown, 2).unwrap(), None);
    }
}
