//! Survival analysis fan-out across the network.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::config::ExploreConfig;
use crate::error::{ExploreError, ExploreResult};
use crate::traits::{CryptoService, NetworkTopology, SurvivalAnalysisApi};

/// Survival analysis request sent to every node.
///
/// `user_public_key` is overwritten with the ephemeral key before sending;
/// the remaining analysis parameters are passed through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurvivalAnalysisRequest {
    /// Request identifier.
    pub id: String,
    /// Key the results are encrypted for.
    #[serde(default)]
    pub user_public_key: String,
    /// Analysis parameters (cohort, concepts, granularity, ...).
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

/// Encrypted survival analysis result of one node.
pub type SurvivalAnalysisResponse = Value;

/// Runs survival analyses on every node of the network.
#[derive(Clone)]
pub struct SurvivalAnalysisService {
    timeout: Duration,
    api: Arc<dyn SurvivalAnalysisApi>,
    crypto: Arc<dyn CryptoService>,
    network: Arc<dyn NetworkTopology>,
}

impl SurvivalAnalysisService {
    /// Creates the service.
    pub fn new(
        config: &ExploreConfig,
        api: Arc<dyn SurvivalAnalysisApi>,
        crypto: Arc<dyn CryptoService>,
        network: Arc<dyn NetworkTopology>,
    ) -> Self {
        Self {
            timeout: config.survival_analysis_timeout,
            api,
            crypto,
            network,
        }
    }

    /// Sends `request` to every node in parallel.
    ///
    /// Results are returned in network order. The whole fan-out fails if
    /// any node fails or the deadline elapses; no partial results are kept.
    pub async fn survival_analysis_all_nodes(
        &self,
        mut request: SurvivalAnalysisRequest,
    ) -> ExploreResult<Vec<SurvivalAnalysisResponse>> {
        request.user_public_key = self.crypto.ephemeral_public_key();
        let nodes = self.network.nodes();
        debug!(request_id = %request.id, nodes = nodes.len(), "starting survival analysis");

        let calls = nodes
            .iter()
            .map(|node| self.api.survival_analysis_single_node(&node.url, &request));

        match tokio::time::timeout(self.timeout, try_join_all(calls)).await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(e)) => {
                error!(request_id = %request.id, error = %e, "survival analysis failed");
                Err(e)
            }
            Err(_) => {
                error!(request_id = %request.id, timeout = ?self.timeout, "survival analysis timed out");
                Err(ExploreError::Timeout(self.timeout))
            }
        }
    }
}
