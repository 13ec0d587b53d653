//! Tree node service: lazy loading, subject-count aggregation and node
//! processing.
//!
//! Children are loaded one level at a time in two phases. Phase 1 asks the
//! primary node for child names only, so they can be shown at once. Phase 2
//! asks every network node to aggregate encrypted subject counts for the
//! same children, decrypts the counts in one batch and relabels the nodes.
//! Both phases start together, but counts are applied only after the names
//! are attached.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use gb_constraint::{Concept, Modifier};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ExploreConfig;
use crate::counts::CountItem;
use crate::error::{ExploreError, ExploreResult};
use crate::registry::{ConceptRegistry, GenomicAnnotation, SharedRegistry};
use crate::traits::{AggregationTarget, ConceptSearch, CryptoService, NetworkTopology};
use crate::tree::{
    ChildLoadState, DataType, NodeId, TreeForest, TreeNode, TreeNodeType, ValueMetadata,
};

const LOADING_SUFFIX: &str = " (loading count)";

/// Outcome of [`TreeNodeService::load_children_nodes`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChildrenLoad {
    /// Loading had already started for this node; nothing was done.
    AlreadyStarted,
    /// Names were loaded; the user may not aggregate counts.
    NamesOnly,
    /// Names and counts were loaded. Holds the children as returned by the
    /// first network node that answered, with decrypted subject counts.
    Aggregated(Vec<TreeNode>),
    /// The tree was reloaded while the requests were in flight; their
    /// results were dropped.
    Discarded,
}

#[derive(Debug, Clone)]
enum ChildrenRequest {
    Concept {
        path: String,
    },
    Modifier {
        path: String,
        applied_path: String,
        applied_concept_path: String,
    },
}

#[derive(Debug, Default)]
struct TreeState {
    forest: TreeForest,
    loading_roots: bool,
    roots_loaded: bool,
    loads_in_flight: usize,
    selected_projection: Vec<NodeId>,
    projection_counts: BTreeMap<String, CountItem>,
}

impl TreeState {
    fn is_ready(&self) -> bool {
        self.roots_loaded && self.loads_in_flight == 0
    }
}

struct TreeInner {
    config: ExploreConfig,
    search: Arc<dyn ConceptSearch>,
    crypto: Arc<dyn CryptoService>,
    network: Arc<dyn NetworkTopology>,
    state: Mutex<TreeState>,
    ready: watch::Sender<bool>,
}

/// Owner of the concept tree.
///
/// Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct TreeNodeService {
    inner: Arc<TreeInner>,
}

/// Decrements the in-flight load counter when a child load ends, however it ends.
struct LoadGuard<'a> {
    service: &'a TreeNodeService,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.service.inner.state.lock();
        state.loads_in_flight = state.loads_in_flight.saturating_sub(1);
        self.service.publish_ready(&state);
    }
}

impl TreeNodeService {
    /// Creates the service with an empty tree.
    pub fn new(
        config: ExploreConfig,
        search: Arc<dyn ConceptSearch>,
        crypto: Arc<dyn CryptoService>,
        network: Arc<dyn NetworkTopology>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(TreeInner {
                config,
                search,
                crypto,
                network,
                state: Mutex::new(TreeState::default()),
                ready,
            }),
        }
    }

    /// The service configuration.
    pub fn config(&self) -> &ExploreConfig {
        &self.inner.config
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Resets the tree and the registry, then loads the root nodes.
    pub async fn load(&self, registry: &SharedRegistry) -> ExploreResult<()> {
        {
            let mut state = self.inner.state.lock();
            state.forest.reset();
            state.selected_projection.clear();
            state.roots_loaded = false;
            state.loading_roots = true;
            self.publish_ready(&state);
        }
        registry.lock().reset();

        let nodes = match self.inner.search.explore_search_concept_children("/", None).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "error during initial tree loading");
                self.inner.state.lock().loading_roots = false;
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        let mut registry = registry.lock();
        state.loading_roots = false;
        let ids = state.forest.attach_roots(nodes);
        process_tree_nodes(&mut state.forest, &ids, &mut registry, false)?;
        state.roots_loaded = true;
        self.publish_ready(&state);
        info!(roots = ids.len(), "tree roots loaded");
        Ok(())
    }

    /// Loads the children of `parent`, then aggregates their subject counts
    /// across the network when the user's privilege allows it.
    ///
    /// A second call for the same node is a no-op returning
    /// [`ChildrenLoad::AlreadyStarted`]. If the tree is reloaded while the
    /// requests are in flight, their results are dropped and
    /// [`ChildrenLoad::Discarded`] is returned.
    ///
    /// # Errors
    ///
    /// - [`ExploreError::MissingAppliedConcept`] for a modifier node without
    ///   an applied concept.
    /// - [`ExploreError::Timeout`] when the count fan-out exceeds the
    ///   configured deadline.
    /// - [`ExploreError::FanOut`] when some network nodes failed. The
    ///   counts of the first node that answered are still applied.
    pub async fn load_children_nodes(
        &self,
        parent: NodeId,
        registry: &SharedRegistry,
    ) -> ExploreResult<ChildrenLoad> {
        let (request, fetch_names, generation) = {
            let mut state = self.inner.state.lock();
            if state.forest.node(parent)?.children_loading_started {
                debug!(parent = %parent, "children loading already started");
                return Ok(ChildrenLoad::AlreadyStarted);
            }
            let request = children_request(&state.forest, parent)?;
            let generation = state.forest.generation();
            let node = state.forest.node_mut(parent)?;
            node.children_loading_started = true;
            let fetch_names = !(node.leaf || node.children_attached);
            if fetch_names {
                node.load_state = ChildLoadState::NamesLoading;
            }
            state.loads_in_flight += 1;
            self.publish_ready(&state);
            (request, fetch_names, generation)
        };
        let _guard = LoadGuard { service: self };

        if !self.inner.config.query_type.can_aggregate() {
            info!(parent = %parent, "no rights to launch aggregations");
            self.load_children_names(parent, generation, &request, fetch_names, registry, false)
                .await?;
            if !self.is_current(generation) {
                return Ok(ChildrenLoad::Discarded);
            }
            return Ok(ChildrenLoad::NamesOnly);
        }

        if !fetch_names {
            self.set_load_state(parent, ChildLoadState::CountsAggregating)?;
        }

        let public_key = self.inner.crypto.ephemeral_public_key();
        let query_id = generate_query_id();
        let nodes = self.inner.network.nodes();
        let total = nodes.len();
        let request_ref = &request;
        let branches = nodes.into_iter().map(|node| {
            let target = AggregationTarget {
                node_url: node.url,
                public_key: public_key.clone(),
                query_id: query_id.clone(),
            };
            async move {
                let result = self.fetch_children(request_ref, Some(&target)).await;
                if let Err(e) = &result {
                    error!(node = %target.node_url, error = %e, "error during subject count aggregation");
                }
                result
            }
        });
        let deadline = self.inner.config.tree_count_timeout;
        let fan_out = tokio::time::timeout(deadline, join_all(branches));

        let (names, aggregated) = tokio::join!(
            self.load_children_names(parent, generation, &request, fetch_names, registry, true),
            fan_out
        );
        names?;
        if !self.is_current(generation) {
            debug!(parent = %parent, "tree reloaded, dropping children counts");
            return Ok(ChildrenLoad::Discarded);
        }

        let results = match aggregated {
            Ok(results) => results,
            Err(_) => {
                error!(parent = %parent, timeout = ?deadline, "subject count aggregation timed out");
                self.apply_counts(parent, generation, &HashMap::new(), registry, ChildLoadState::NamesLoaded)?;
                return Err(ExploreError::Timeout(deadline));
            }
        };

        // every node answers with the same children; the first answer gives the shape
        let mut failures = Vec::new();
        let mut first_answer = None;
        for result in results {
            match result {
                Ok(children) => {
                    if first_answer.is_none() {
                        first_answer = Some(children);
                    }
                }
                Err(e) => failures.push(e),
            }
        }
        let mut canonical = match (first_answer, fan_out_error(&failures, total)) {
            (Some(children), _) => children,
            (None, None) => Vec::new(),
            (None, Some(err)) => {
                self.apply_counts(parent, generation, &HashMap::new(), registry, ChildLoadState::NamesLoaded)?;
                return Err(err);
            }
        };

        let counts = match self.decrypt_counts(&canonical).await {
            Ok(counts) => counts,
            Err(e) => {
                error!(parent = %parent, error = %e, "error during loading of subject counts");
                self.apply_counts(parent, generation, &HashMap::new(), registry, ChildLoadState::NamesLoaded)?;
                return Err(e);
            }
        };
        for node in &mut canonical {
            if let Some(&count) = counts.get(&node.path) {
                node.subject_count = Some(count);
            }
        }
        if !self.apply_counts(parent, generation, &counts, registry, ChildLoadState::CountsReady)? {
            return Ok(ChildrenLoad::Discarded);
        }

        match fan_out_error(&failures, total) {
            Some(err) => Err(err),
            None => Ok(ChildrenLoad::Aggregated(canonical)),
        }
    }

    async fn load_children_names(
        &self,
        parent: NodeId,
        generation: u64,
        request: &ChildrenRequest,
        fetch: bool,
        registry: &SharedRegistry,
        display_loading: bool,
    ) -> ExploreResult<()> {
        if !fetch {
            return Ok(());
        }
        let children = match self.fetch_children(request, None).await {
            Ok(children) => children,
            Err(e) => {
                error!(parent = %parent, error = %e, "error during tree children loading");
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        if state.forest.generation() != generation {
            debug!(parent = %parent, "tree reloaded, dropping children names");
            return Ok(());
        }
        let mut registry = registry.lock();
        let forest = &mut state.forest;
        let attached = children.len();
        if !children.is_empty() {
            let ids = forest.attach_child_tree(parent, children.into_iter().map(Some).collect())?;
            forest.attach_modifier_data(parent, &ids)?;
            process_tree_nodes(forest, &ids, &mut registry, display_loading)?;
        }
        forest.node_mut(parent)?.load_state = if display_loading {
            ChildLoadState::CountsAggregating
        } else {
            ChildLoadState::NamesLoaded
        };
        debug!(parent = %parent, children = attached, "children names attached");
        Ok(())
    }

    async fn fetch_children(
        &self,
        request: &ChildrenRequest,
        target: Option<&AggregationTarget>,
    ) -> ExploreResult<Vec<TreeNode>> {
        match request {
            ChildrenRequest::Concept { path } => {
                self.inner
                    .search
                    .explore_search_concept_children(path, target)
                    .await
            }
            ChildrenRequest::Modifier {
                path,
                applied_path,
                applied_concept_path,
            } => {
                self.inner
                    .search
                    .explore_search_modifier_children(path, applied_path, applied_concept_path, target)
                    .await
            }
        }
    }

    /// Decrypts the counts of `nodes` in a single batch, keyed by path.
    async fn decrypt_counts(&self, nodes: &[TreeNode]) -> ExploreResult<HashMap<String, u64>> {
        let mut paths = Vec::new();
        let mut ciphers = Vec::new();
        for node in nodes {
            match &node.subject_count_encrypted {
                Some(cipher) => {
                    paths.push(node.path.clone());
                    ciphers.push(cipher.clone());
                }
                None => warn!(node = %node.display_name, "undefined encrypted subject count"),
            }
        }
        if ciphers.is_empty() {
            return Ok(HashMap::new());
        }

        let plain = self
            .inner
            .crypto
            .decrypt_integers_with_ephemeral_key(&ciphers)
            .await?;
        if plain.len() != ciphers.len() {
            return Err(ExploreError::Crypto(format!(
                "expected {} decrypted values, got {}",
                ciphers.len(),
                plain.len()
            )));
        }
        Ok(paths
            .into_iter()
            .zip(plain)
            .map(|(path, value)| (path, u64::try_from(value).unwrap_or(0)))
            .collect())
    }

    /// Applies decrypted counts to the children of `parent` and relabels
    /// them. Returns false, without touching the tree, if it was reloaded.
    fn apply_counts(
        &self,
        parent: NodeId,
        generation: u64,
        counts: &HashMap<String, u64>,
        registry: &SharedRegistry,
        final_state: ChildLoadState,
    ) -> ExploreResult<bool> {
        let mut state = self.inner.state.lock();
        if state.forest.generation() != generation {
            debug!(parent = %parent, "tree reloaded, dropping children counts");
            return Ok(false);
        }
        let mut registry = registry.lock();
        let forest = &mut state.forest;
        let children = forest.node(parent)?.children.clone();
        for &child in &children {
            let node = forest.node_mut(child)?;
            if let Some(&count) = counts.get(&node.path) {
                node.subject_count = Some(count);
            }
        }
        process_tree_nodes(forest, &children, &mut registry, false)?;
        forest.node_mut(parent)?.load_state = final_state;
        Ok(true)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.state.lock().forest.generation() == generation
    }

    fn set_load_state(&self, id: NodeId, load_state: ChildLoadState) -> ExploreResult<()> {
        self.inner.state.lock().forest.node_mut(id)?.load_state = load_state;
        Ok(())
    }

    fn publish_ready(&self, state: &TreeState) {
        let ready = state.is_ready();
        self.inner.ready.send_if_modified(|current| {
            if *current == ready {
                false
            } else {
                *current = ready;
                true
            }
        });
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    /// Returns true while roots or children are being loaded.
    pub fn is_loading(&self) -> bool {
        let state = self.inner.state.lock();
        state.loading_roots || state.loads_in_flight > 0
    }

    /// Returns true once the roots are loaded and no child load is in flight.
    pub fn is_tree_node_loading_complete(&self) -> bool {
        self.inner.state.lock().is_ready()
    }

    /// Subscribes to the readiness signal.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    /// Waits until [`is_tree_node_loading_complete`](Self::is_tree_node_loading_complete)
    /// holds. Never returns if the tree is never loaded.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready_signal();
        if ready.wait_for(|ready| *ready).await.is_err() {
            warn!("tree readiness signal closed");
        }
    }

    // =========================================================================
    // Forest access
    // =========================================================================

    /// Runs `f` over the forest.
    pub fn with_forest<R>(&self, f: impl FnOnce(&TreeForest) -> R) -> R {
        f(&self.inner.state.lock().forest)
    }

    /// Runs `f` over the forest mutably.
    pub fn with_forest_mut<R>(&self, f: impl FnOnce(&mut TreeForest) -> R) -> R {
        f(&mut self.inner.state.lock().forest)
    }

    /// A copy of the node.
    pub fn node(&self, id: NodeId) -> Option<TreeNode> {
        self.inner.state.lock().forest.get(id).cloned()
    }

    /// Root node ids.
    pub fn root_tree_nodes(&self) -> Vec<NodeId> {
        self.inner.state.lock().forest.roots().to_vec()
    }

    // =========================================================================
    // Projection tree
    // =========================================================================

    /// Nodes checked in the projection tree.
    pub fn selected_projection_tree_data(&self) -> Vec<NodeId> {
        self.inner.state.lock().selected_projection.clone()
    }

    /// Replaces the checked projection nodes.
    pub fn set_selected_projection_tree_data(&self, ids: Vec<NodeId>) {
        self.inner.state.lock().selected_projection = ids;
    }

    /// Paths of the checked projection nodes.
    pub fn selected_projection_paths(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .selected_projection
            .iter()
            .filter_map(|&id| state.forest.get(id).map(|n| n.path.clone()))
            .collect()
    }

    /// Concept counts the projection tree was last built from.
    pub fn projection_counts(&self) -> BTreeMap<String, CountItem> {
        self.inner.state.lock().projection_counts.clone()
    }

    /// Nodes whose concept has counts in the current selection.
    pub fn projection_tree_nodes(&self) -> Vec<NodeId> {
        let state = self.inner.state.lock();
        nodes_with_counts(&state.forest, &state.projection_counts)
    }

    /// Rebuilds the projection tree from the selection's concept counts.
    ///
    /// With a checklist (paths restored from a saved query) exactly those
    /// nodes are checked; otherwise every node with counts is.
    pub fn update_projection_tree_data(
        &self,
        concept_count_map: &BTreeMap<String, CountItem>,
        checklist: Option<&[String]>,
    ) {
        let mut state = self.inner.state.lock();
        let selected = match checklist {
            Some(paths) => state.forest.find_by_paths(paths),
            None => nodes_with_counts(&state.forest, concept_count_map),
        };
        debug!(selected = selected.len(), "projection tree updated");
        state.selected_projection = selected;
        state.projection_counts = concept_count_map.clone();
    }

    /// Writes the selection's patient counts onto study and concept nodes.
    /// Nodes without an entry get 0.
    pub fn update_tree_node_counts(
        &self,
        study_count_map: &BTreeMap<String, CountItem>,
        concept_count_map: &BTreeMap<String, CountItem>,
    ) {
        let mut state = self.inner.state.lock();
        for id in state.forest.walk() {
            let Some(node) = state.forest.get_mut(id) else {
                continue;
            };
            let (key, map) = match node.node_type {
                TreeNodeType::Study => (node.study_id.as_deref(), study_count_map),
                t if t.is_concept() => (node.concept_code.as_deref(), concept_count_map),
                _ => continue,
            };
            let count = key
                .and_then(|k| map.get(k))
                .map_or(0, |item| item.patient_count);
            node.patient_count = Some(count);
        }
    }
}

fn nodes_with_counts(forest: &TreeForest, counts: &BTreeMap<String, CountItem>) -> Vec<NodeId> {
    forest
        .walk()
        .into_iter()
        .filter(|&id| {
            forest
                .get(id)
                .and_then(|n| n.concept_code.as_ref())
                .is_some_and(|code| counts.contains_key(code))
        })
        .collect()
}

fn fan_out_error(failures: &[ExploreError], total: usize) -> Option<ExploreError> {
    failures.first().map(|first| ExploreError::FanOut {
        failed: failures.len(),
        total,
        message: first.to_string(),
    })
}

fn children_request(forest: &TreeForest, id: NodeId) -> ExploreResult<ChildrenRequest> {
    let node = forest.node(id)?;
    if !node.is_modifier() {
        return Ok(ChildrenRequest::Concept {
            path: node.path.clone(),
        });
    }
    let applied = node
        .applied_concept
        .and_then(|applied| forest.get(applied))
        .ok_or_else(|| ExploreError::MissingAppliedConcept(node.path.clone()))?;
    Ok(ChildrenRequest::Modifier {
        path: node.path.clone(),
        applied_path: node.applied_path.clone(),
        applied_concept_path: applied.path.clone(),
    })
}

/// Identifier shared by the requests of one subject-count fan-out.
pub fn generate_query_id() -> String {
    format!(
        "Medco_Subject_Count_Query_{}",
        Utc::now().format("%Y%m%d%H%M%S%3f")
    )
}

// =============================================================================
// Node processing
// =============================================================================

/// Processes `ids` and all their attached descendants.
pub fn process_tree_nodes(
    forest: &mut TreeForest,
    ids: &[NodeId],
    registry: &mut ConceptRegistry,
    display_loading: bool,
) -> ExploreResult<()> {
    for &id in ids {
        process_tree_node(forest, id, registry, display_loading)?;
        let node = forest.node(id)?;
        if node.has_children() {
            let children = node.children.clone();
            process_tree_nodes(forest, &children, registry, display_loading)?;
        }
    }
    Ok(())
}

/// Recomputes a node's label and registers its concept.
///
/// Concept and modifier nodes are registered once per concept label;
/// genomic annotations once per name. Modifier leaves are marked as leaves.
pub fn process_tree_node(
    forest: &mut TreeForest,
    id: NodeId,
    registry: &mut ConceptRegistry,
    display_loading: bool,
) -> ExploreResult<()> {
    let node = forest.node_mut(id)?;
    node.label = tree_node_label(node, display_loading);
    let node_type = node.node_type;

    match node_type {
        TreeNodeType::Concept | TreeNodeType::ConceptFolder => {
            registry.register_concept(concept_from_tree_node(forest.node(id)?));
        }
        TreeNodeType::GenomicAnnotation => {
            let node = forest.node(id)?;
            registry.register_genomic_annotation(GenomicAnnotation {
                name: node.name.clone(),
                display_name: node.display_name.clone(),
                path: node.path.clone(),
            });
        }
        TreeNodeType::Modifier | TreeNodeType::ModifierFolder => {
            registry.register_concept(concept_from_modifier_tree_node(forest, id)?);
            if node_type == TreeNodeType::Modifier {
                forest.node_mut(id)?.leaf = true;
            }
        }
        _ => {}
    }

    let node = forest.node(id)?;
    debug!(name = %node.name, node_type = ?node.node_type, "processed tree node");
    Ok(())
}

/// Display label: the display name, followed by the subject count when
/// known, or by a loading marker when requested.
pub fn tree_node_label(node: &TreeNode, display_loading: bool) -> String {
    match node.subject_count {
        Some(count) => format!("{} ({})", node.display_name, count),
        None if display_loading => format!("{}{}", node.display_name, LOADING_SUFFIX),
        None => node.display_name.clone(),
    }
}

/// Builds the concept a concept node stands for.
pub fn concept_from_tree_node(node: &TreeNode) -> Concept {
    let mut concept = Concept::new(node.path.clone(), node.concept_type)
        .with_label(format!("{} ({})", node.display_name, node.path));
    if let Some(metadata) = &node.metadata {
        apply_metadata(&mut concept, metadata);
    }
    concept.code = node.concept_code.clone();
    concept.full_name = Some(node.path.clone());
    concept.name = Some(node.name.clone());
    concept.encryption_descriptor = node.encryption_descriptor.clone();
    concept
}

/// Builds the concept a modifier node stands for: its applied concept,
/// with the modifier path appended and the modifier attached.
///
/// # Errors
///
/// [`ExploreError::NotAModifier`] if the node is not a modifier, and
/// [`ExploreError::MissingAppliedConcept`] if it has no applied concept.
pub fn concept_from_modifier_tree_node(forest: &TreeForest, id: NodeId) -> ExploreResult<Concept> {
    let node = forest.node(id)?;
    if !node.is_modifier() {
        return Err(ExploreError::NotAModifier(node.path.clone()));
    }
    let applied_id = node
        .applied_concept
        .ok_or_else(|| ExploreError::MissingAppliedConcept(node.path.clone()))?;
    let applied = forest.node(applied_id)?;

    let mut concept = concept_from_tree_node(applied);
    let modifier = Modifier::new(node.path.clone(), node.applied_path.clone(), applied.path.clone());
    let trimmed = modifier.path.strip_prefix('/').unwrap_or(&modifier.path);
    let suffix = trimmed.split('/').skip(1).collect::<Vec<_>>().join("/");

    concept.path = format!("{}{}", concept.path, suffix);
    concept.label = format!("{} ({})", node.display_name, concept.path);
    concept.modifier = Some(modifier);
    concept.value_type = node.concept_type;
    if let Some(metadata) = &node.metadata {
        apply_metadata(&mut concept, metadata);
    }
    Ok(concept)
}

fn apply_metadata(concept: &mut Concept, metadata: &ValueMetadata) {
    if let Some(unit) = &metadata.unit {
        concept.unit = Some(unit.clone());
    }
    let (integer, positive) = match metadata.data_type {
        Some(DataType::PosInteger) => (true, true),
        Some(DataType::PosFloat) => (false, true),
        Some(DataType::Integer) => (true, false),
        Some(DataType::Float) => (false, false),
        Some(DataType::String) => {
            concept.is_text = Some(true);
            return;
        }
        _ => return,
    };
    concept.is_integer = Some(integer);
    concept.is_positive = Some(positive);
}
