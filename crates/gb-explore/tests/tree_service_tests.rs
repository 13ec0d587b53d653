//! Integration tests for lazy tree loading and subject-count aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gb_constraint::ValueType;
use gb_explore::{
    AggregationTarget, ChildLoadState, ChildrenLoad, ConceptRegistry, ConceptSearch,
    CryptoService, ExploreConfig, ExploreError, ExploreQueryType, ExploreResult, NetworkTopology,
    NodeId, NodeMetadata, SharedRegistry, TreeNode, TreeNodeService, TreeNodeType,
};
use parking_lot::Mutex;

// =============================================================================
// Mock backends
// =============================================================================

/// In-memory concept tree served by every network node.
#[derive(Default)]
struct MockSearch {
    children: HashMap<String, Vec<TreeNode>>,
    node_delays: HashMap<String, Duration>,
    name_delays: HashMap<String, Duration>,
    failing_nodes: HashSet<String>,
    failing_paths: HashSet<String>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    modifier_calls: Mutex<Vec<(String, String, String)>>,
}

impl MockSearch {
    fn with_children(mut self, path: &str, children: Vec<TreeNode>) -> Self {
        self.children.insert(path.to_string(), children);
        self
    }

    fn with_node_delay(mut self, url: &str, delay: Duration) -> Self {
        self.node_delays.insert(url.to_string(), delay);
        self
    }

    fn with_name_delay(mut self, path: &str, delay: Duration) -> Self {
        self.name_delays.insert(path.to_string(), delay);
        self
    }

    fn with_failing_node(mut self, url: &str) -> Self {
        self.failing_nodes.insert(url.to_string());
        self
    }

    fn with_failing_path(mut self, path: &str) -> Self {
        self.failing_paths.insert(path.to_string());
        self
    }

    fn name_calls(&self) -> usize {
        self.calls.lock().iter().filter(|(_, url)| url.is_none()).count()
    }

    fn count_calls(&self) -> usize {
        self.calls.lock().iter().filter(|(_, url)| url.is_some()).count()
    }

    async fn answer(&self, path: &str, target: Option<&AggregationTarget>) -> ExploreResult<Vec<TreeNode>> {
        self.calls
            .lock()
            .push((path.to_string(), target.map(|t| t.node_url.clone())));

        if let Some(target) = target {
            if let Some(delay) = self.node_delays.get(&target.node_url) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing_nodes.contains(&target.node_url) {
                return Err(ExploreError::Transport(format!("{} unreachable", target.node_url)));
            }
        } else {
            if let Some(delay) = self.name_delays.get(path) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing_paths.contains(path) {
                return Err(ExploreError::Transport(format!("{} not found", path)));
            }
        }

        let mut nodes = self.children.get(path).cloned().unwrap_or_default();
        if target.is_none() {
            // names-only answers carry no counts
            for node in &mut nodes {
                node.subject_count_encrypted = None;
            }
        }
        Ok(nodes)
    }
}

#[async_trait]
impl ConceptSearch for MockSearch {
    async fn explore_search_concept_children(
        &self,
        path: &str,
        target: Option<&AggregationTarget>,
    ) -> ExploreResult<Vec<TreeNode>> {
        self.answer(path, target).await
    }

    async fn explore_search_modifier_children(
        &self,
        path: &str,
        applied_path: &str,
        applied_concept_path: &str,
        target: Option<&AggregationTarget>,
    ) -> ExploreResult<Vec<TreeNode>> {
        self.modifier_calls.lock().push((
            path.to_string(),
            applied_path.to_string(),
            applied_concept_path.to_string(),
        ));
        self.answer(path, target).await
    }
}

/// Decrypts ciphertexts of the form `enc:<n>`.
#[derive(Default)]
struct MockCrypto {
    batches: Mutex<Vec<usize>>,
}

#[async_trait]
impl CryptoService for MockCrypto {
    fn ephemeral_public_key(&self) -> String {
        "ephemeral-key".to_string()
    }

    async fn decrypt_integers_with_ephemeral_key(&self, ciphers: &[String]) -> ExploreResult<Vec<i64>> {
        self.batches.lock().push(ciphers.len());
        ciphers
            .iter()
            .map(|c| {
                c.strip_prefix("enc:")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| ExploreError::Crypto(format!("bad cipher {}", c)))
            })
            .collect()
    }
}

struct MockNetwork(Vec<NodeMetadata>);

impl MockNetwork {
    fn with_nodes(count: usize) -> Self {
        MockNetwork(
            (0..count)
                .map(|index| NodeMetadata {
                    index,
                    name: format!("node-{}", index),
                    url: format!("http://node-{}", index),
                })
                .collect(),
        )
    }
}

impl NetworkTopology for MockNetwork {
    fn nodes(&self) -> Vec<NodeMetadata> {
        self.0.clone()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn demo_search() -> MockSearch {
    MockSearch::default()
        .with_children(
            "/",
            vec![
                TreeNode::new("/demo/", "Demographics", TreeNodeType::ConceptFolder),
                TreeNode::new("/diag/", "Diagnosis", TreeNodeType::Concept).with_concept_code("DIAG"),
            ],
        )
        .with_children(
            "/demo/",
            vec![
                TreeNode::new("/demo/age/", "Age", TreeNodeType::Concept)
                    .with_concept_type(ValueType::Numeric)
                    .with_concept_code("AGE")
                    .with_encrypted_count("enc:12"),
                TreeNode::new("/demo/sex/", "Sex", TreeNodeType::Concept)
                    .with_concept_type(ValueType::Categorical)
                    .with_concept_code("SEX")
                    .with_encrypted_count("enc:7"),
            ],
        )
        .with_children(
            "/diag/",
            vec![TreeNode::new("/Rank/", "Rank", TreeNodeType::ModifierFolder)
                .with_applied_path("/diag/%")
                .with_encrypted_count("enc:3")],
        )
        .with_children(
            "/Rank/",
            vec![TreeNode::new("/Rank/Primary/", "Primary", TreeNodeType::Modifier)
                .with_applied_path("/diag/%")
                .with_encrypted_count("enc:2")],
        )
}

struct Fixture {
    service: TreeNodeService,
    search: Arc<MockSearch>,
    crypto: Arc<MockCrypto>,
    registry: SharedRegistry,
}

fn fixture(search: MockSearch, config: ExploreConfig, nodes: usize) -> Fixture {
    init_tracing();
    let search = Arc::new(search);
    let crypto = Arc::new(MockCrypto::default());
    let service = TreeNodeService::new(
        config,
        search.clone(),
        crypto.clone(),
        Arc::new(MockNetwork::with_nodes(nodes)),
    );
    Fixture {
        service,
        search,
        crypto,
        registry: ConceptRegistry::shared(),
    }
}

fn root_by_path(service: &TreeNodeService, path: &str) -> NodeId {
    service
        .with_forest(|forest| forest.find_by_path(path))
        .expect("root present")
}

fn child_labels(service: &TreeNodeService, parent: NodeId) -> Vec<String> {
    service.with_forest(|forest| {
        forest
            .get(parent)
            .unwrap()
            .children
            .iter()
            .map(|&id| forest.get(id).unwrap().label.clone())
            .collect()
    })
}

// =============================================================================
// Root loading
// =============================================================================

#[tokio::test]
async fn test_load_roots() {
    let f = fixture(demo_search(), ExploreConfig::default(), 3);
    assert!(!f.service.is_tree_node_loading_complete());

    f.service.load(&f.registry).await.unwrap();

    assert_eq!(f.service.root_tree_nodes().len(), 2);
    assert!(f.service.is_tree_node_loading_complete());
    assert!(!f.service.is_loading());
    assert!(*f.service.ready_signal().borrow());

    let registry = f.registry.lock();
    assert!(registry.contains_label("Demographics (/demo/)"));
    assert!(registry.contains_label("Diagnosis (/diag/)"));

    let diag = root_by_path(&f.service, "/diag/");
    assert_eq!(f.service.node(diag).unwrap().label, "Diagnosis");
}

#[tokio::test]
async fn test_load_failure_leaves_tree_not_ready() {
    let f = fixture(demo_search().with_failing_path("/"), ExploreConfig::default(), 1);

    let result = f.service.load(&f.registry).await;

    assert!(matches!(result, Err(ExploreError::Transport(_))));
    assert!(f.service.root_tree_nodes().is_empty());
    assert!(!f.service.is_tree_node_loading_complete());
    assert!(!f.service.is_loading());
}

#[tokio::test]
async fn test_reload_resets_registry() {
    let f = fixture(demo_search(), ExploreConfig::default(), 1);
    f.service.load(&f.registry).await.unwrap();
    f.registry
        .lock()
        .register_concept(gb_explore::Concept::new("/stale/", None).with_label("stale"));

    f.service.load(&f.registry).await.unwrap();

    assert!(!f.registry.lock().contains_label("stale"));
    assert_eq!(f.service.root_tree_nodes().len(), 2);
}

// =============================================================================
// Children loading
// =============================================================================

#[tokio::test]
async fn test_load_children_aggregates_counts() {
    let f = fixture(demo_search(), ExploreConfig::default(), 3);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let loaded = f.service.load_children_nodes(demo, &f.registry).await.unwrap();

    let ChildrenLoad::Aggregated(children) = loaded else {
        panic!("expected aggregated counts, got {loaded:?}");
    };
    let counts: Vec<_> = children.iter().map(|c| c.subject_count).collect();
    assert_eq!(counts, vec![Some(12), Some(7)]);

    assert_eq!(child_labels(&f.service, demo), vec!["Age (12)", "Sex (7)"]);
    assert_eq!(f.service.node(demo).unwrap().load_state, ChildLoadState::CountsReady);

    // one names call per load, one count call per network node
    assert_eq!(f.search.name_calls(), 2);
    assert_eq!(f.search.count_calls(), 3);
    // one decryption batch holding both counts
    assert_eq!(*f.crypto.batches.lock(), vec![2]);
    assert!(f.service.is_tree_node_loading_complete());
}

#[tokio::test]
async fn test_load_children_twice_is_noop() {
    let f = fixture(demo_search(), ExploreConfig::default(), 2);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    f.service.load_children_nodes(demo, &f.registry).await.unwrap();
    let calls = f.search.calls.lock().len();
    let second = f.service.load_children_nodes(demo, &f.registry).await.unwrap();

    assert_eq!(second, ChildrenLoad::AlreadyStarted);
    assert_eq!(f.search.calls.lock().len(), calls);
    assert_eq!(f.service.node(demo).unwrap().children.len(), 2);
}

#[tokio::test]
async fn test_load_children_without_aggregation_privilege() {
    let config = ExploreConfig::builder()
        .with_query_type(ExploreQueryType::CountGlobalObfuscated)
        .build();
    let f = fixture(demo_search(), config, 3);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let loaded = f.service.load_children_nodes(demo, &f.registry).await.unwrap();

    assert_eq!(loaded, ChildrenLoad::NamesOnly);
    assert_eq!(child_labels(&f.service, demo), vec!["Age", "Sex"]);
    assert_eq!(f.search.count_calls(), 0);
    assert!(f.crypto.batches.lock().is_empty());
    assert_eq!(f.service.node(demo).unwrap().load_state, ChildLoadState::NamesLoaded);
}

#[tokio::test]
async fn test_missing_encrypted_count_is_skipped() {
    let search = demo_search().with_children(
        "/demo/",
        vec![
            TreeNode::new("/demo/age/", "Age", TreeNodeType::Concept).with_encrypted_count("enc:5"),
            TreeNode::new("/demo/sex/", "Sex", TreeNodeType::Concept),
        ],
    );
    let f = fixture(search, ExploreConfig::default(), 1);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let loaded = f.service.load_children_nodes(demo, &f.registry).await.unwrap();

    let ChildrenLoad::Aggregated(children) = loaded else {
        panic!("expected aggregated counts");
    };
    assert_eq!(children[0].subject_count, Some(5));
    assert_eq!(children[1].subject_count, None);
    assert_eq!(child_labels(&f.service, demo), vec!["Age (5)", "Sex"]);
    assert_eq!(*f.crypto.batches.lock(), vec![1]);
}

#[tokio::test]
async fn test_partial_fan_out_failure_reports_error() {
    let f = fixture(demo_search().with_failing_node("http://node-2"), ExploreConfig::default(), 3);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let result = f.service.load_children_nodes(demo, &f.registry).await;

    match result {
        Err(ExploreError::FanOut { failed, total, message }) => {
            assert_eq!((failed, total), (1, 3));
            assert!(message.contains("node-2"));
        }
        other => panic!("expected a fan-out error, got {other:?}"),
    }
    // the first node answered, so its counts are applied
    assert_eq!(child_labels(&f.service, demo), vec!["Age (12)", "Sex (7)"]);
    assert!(f.service.is_tree_node_loading_complete());
}

#[tokio::test]
async fn test_first_node_failure_keeps_other_counts() {
    let f = fixture(demo_search().with_failing_node("http://node-0"), ExploreConfig::default(), 3);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let result = f.service.load_children_nodes(demo, &f.registry).await;

    match result {
        Err(ExploreError::FanOut { failed, total, message }) => {
            assert_eq!((failed, total), (1, 3));
            assert!(message.contains("node-0"));
        }
        other => panic!("expected a fan-out error, got {other:?}"),
    }
    // the first node that answered, in network order, supplies the counts
    assert_eq!(child_labels(&f.service, demo), vec!["Age (12)", "Sex (7)"]);
    assert_eq!(*f.crypto.batches.lock(), vec![2]);
    assert_eq!(f.service.node(demo).unwrap().load_state, ChildLoadState::CountsReady);
}

#[tokio::test]
async fn test_every_node_failing_leaves_names_only() {
    let search = demo_search()
        .with_failing_node("http://node-0")
        .with_failing_node("http://node-1");
    let f = fixture(search, ExploreConfig::default(), 2);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let result = f.service.load_children_nodes(demo, &f.registry).await;

    assert!(matches!(result, Err(ExploreError::FanOut { failed: 2, total: 2, .. })));
    assert_eq!(child_labels(&f.service, demo), vec!["Age", "Sex"]);
    assert_eq!(f.service.node(demo).unwrap().load_state, ChildLoadState::NamesLoaded);
    assert!(f.crypto.batches.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reload_drops_children_of_previous_tree() {
    let search = demo_search().with_name_delay("/demo/", Duration::from_secs(10));
    let f = fixture(search, ExploreConfig::default(), 1);
    f.service.load(&f.registry).await.unwrap();
    let old_demo = root_by_path(&f.service, "/demo/");

    let service = f.service.clone();
    let registry = f.registry.clone();
    let pending =
        tokio::spawn(async move { service.load_children_nodes(old_demo, &registry).await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    // the reload hands the same ids to the new roots
    f.service.load(&f.registry).await.unwrap();
    let new_demo = root_by_path(&f.service, "/demo/");
    assert_eq!(new_demo, old_demo);

    assert_eq!(pending.await.unwrap(), Ok(ChildrenLoad::Discarded));
    let node = f.service.node(new_demo).unwrap();
    assert!(node.children.is_empty());
    assert!(!node.children_loading_started);
    assert!(!f.registry.lock().contains_label("Age (/demo/age/)"));
    assert!(f.crypto.batches.lock().is_empty());
    assert!(f.service.is_tree_node_loading_complete());
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_timeout() {
    let search = demo_search().with_node_delay("http://node-1", Duration::from_secs(120));
    let config = ExploreConfig::builder()
        .with_tree_count_timeout(Duration::from_secs(60))
        .build();
    let f = fixture(search, config, 2);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let result = f.service.load_children_nodes(demo, &f.registry).await;

    assert_eq!(result, Err(ExploreError::Timeout(Duration::from_secs(60))));
    // names stay attached, without the loading marker
    assert_eq!(child_labels(&f.service, demo), vec!["Age", "Sex"]);
    assert_eq!(f.service.node(demo).unwrap().load_state, ChildLoadState::NamesLoaded);
    assert!(f.crypto.batches.lock().is_empty());
    assert!(f.service.is_tree_node_loading_complete());
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_while_children_load() {
    let search = demo_search().with_node_delay("http://node-0", Duration::from_secs(10));
    let f = fixture(search, ExploreConfig::default(), 1);
    f.service.load(&f.registry).await.unwrap();
    let demo = root_by_path(&f.service, "/demo/");

    let service = f.service.clone();
    let registry = f.registry.clone();
    let handle = tokio::spawn(async move { service.load_children_nodes(demo, &registry).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(f.service.is_loading());
    assert!(!f.service.is_tree_node_loading_complete());
    assert_eq!(child_labels(&f.service, demo), vec!["Age (loading count)", "Sex (loading count)"]);

    let waiter = f.service.clone();
    tokio::time::timeout(Duration::from_secs(30), waiter.wait_until_ready())
        .await
        .expect("tree becomes ready");
    assert!(handle.await.unwrap().is_ok());
    assert!(f.service.is_tree_node_loading_complete());
}

// =============================================================================
// Modifiers
// =============================================================================

#[tokio::test]
async fn test_modifier_children_use_applied_concept() {
    let f = fixture(demo_search(), ExploreConfig::default(), 1);
    f.service.load(&f.registry).await.unwrap();
    let diag = root_by_path(&f.service, "/diag/");

    f.service.load_children_nodes(diag, &f.registry).await.unwrap();
    let rank = f.service.node(diag).unwrap().children[0];
    assert_eq!(f.service.node(rank).unwrap().applied_concept, Some(diag));

    f.service.load_children_nodes(rank, &f.registry).await.unwrap();

    let modifier_calls = f.search.modifier_calls.lock().clone();
    assert!(modifier_calls
        .iter()
        .all(|(path, applied_path, concept)| path == "/Rank/" && applied_path == "/diag/%" && concept == "/diag/"));

    let primary = f.service.node(rank).unwrap().children[0];
    let primary = f.service.node(primary).unwrap();
    assert!(primary.leaf);
    assert_eq!(primary.label, "Primary (2)");
    assert!(f
        .registry
        .lock()
        .contains_label("Primary (/diag/Primary/)"));
}

#[tokio::test]
async fn test_modifier_without_applied_concept_is_rejected() {
    let f = fixture(demo_search(), ExploreConfig::default(), 1);
    let orphan = f.service.with_forest_mut(|forest| {
        forest.attach_roots(vec![TreeNode::new("/Rank/", "Rank", TreeNodeType::ModifierFolder)])[0]
    });

    let result = f.service.load_children_nodes(orphan, &f.registry).await;

    assert_eq!(result, Err(ExploreError::MissingAppliedConcept("/Rank/".into())));
    assert!(f.search.calls.lock().is_empty());
    assert!(!f.service.is_loading());
}
