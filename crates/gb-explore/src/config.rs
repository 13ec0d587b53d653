//! Configuration types for the explore services.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Query privilege of the current user, ordered by weight.
///
/// Subject-count aggregation over the tree is only launched when the
/// weight is at least that of [`ExploreQueryType::CountGlobal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExploreQueryType {
    /// Full patient list.
    PatientList,
    /// Count per site.
    CountPerSite,
    /// Obfuscated count per site.
    CountPerSiteObfuscated,
    /// Shuffled count per site.
    CountPerSiteShuffled,
    /// Shuffled and obfuscated count per site.
    CountPerSiteShuffledObfuscated,
    /// Global count.
    #[default]
    CountGlobal,
    /// Obfuscated global count.
    CountGlobalObfuscated,
}

impl ExploreQueryType {
    /// Weight of the privilege; higher grants more.
    pub fn weight(&self) -> u32 {
        match self {
            ExploreQueryType::PatientList => 100,
            ExploreQueryType::CountPerSite => 80,
            ExploreQueryType::CountPerSiteObfuscated => 60,
            ExploreQueryType::CountPerSiteShuffled => 50,
            ExploreQueryType::CountPerSiteShuffledObfuscated => 40,
            ExploreQueryType::CountGlobal => 30,
            ExploreQueryType::CountGlobalObfuscated => 20,
        }
    }

    /// Returns true if tree subject counts may be aggregated.
    pub fn can_aggregate(&self) -> bool {
        self.weight() >= ExploreQueryType::CountGlobal.weight()
    }
}

/// Configuration for the explore services.
///
/// # Example
///
/// ```rust
/// use gb_explore::{ExploreConfig, ExploreQueryType};
/// use std::time::Duration;
///
/// let config = ExploreConfig::builder()
///     .with_tree_count_timeout(Duration::from_secs(30))
///     .with_query_type(ExploreQueryType::PatientList)
///     .build();
/// assert_eq!(config.export_file_formats, vec!["TSV", "SPSS"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploreConfig {
    /// Deadline of the tree subject-count fan-out.
    pub tree_count_timeout: Duration,
    /// Deadline of the survival analysis fan-out.
    pub survival_analysis_timeout: Duration,
    /// Query privilege of the current user.
    pub query_type: ExploreQueryType,
    /// File formats offered for every export data format.
    pub export_file_formats: Vec<String>,
    /// UNKNOWN folders with fewer descendants than this become an OR of
    /// their descendants when dropped.
    pub max_unknown_node_descendants: usize,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            tree_count_timeout: Duration::from_secs(60),
            survival_analysis_timeout: Duration::from_secs(600),
            query_type: ExploreQueryType::CountGlobal,
            export_file_formats: vec!["TSV".to_string(), "SPSS".to_string()],
            max_unknown_node_descendants: 6,
        }
    }
}

impl ExploreConfig {
    /// Creates a new builder for ExploreConfig.
    pub fn builder() -> ExploreConfigBuilder {
        ExploreConfigBuilder::default()
    }
}

/// Builder for ExploreConfig.
#[derive(Debug, Clone, Default)]
pub struct ExploreConfigBuilder {
    config: ExploreConfig,
}

impl ExploreConfigBuilder {
    /// Sets the tree subject-count deadline.
    pub fn with_tree_count_timeout(mut self, timeout: Duration) -> Self {
        self.config.tree_count_timeout = timeout;
        self
    }

    /// Sets the survival analysis deadline.
    pub fn with_survival_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.config.survival_analysis_timeout = timeout;
        self
    }

    /// Sets the query privilege.
    pub fn with_query_type(mut self, query_type: ExploreQueryType) -> Self {
        self.config.query_type = query_type;
        self
    }

    /// Sets the export file formats.
    pub fn with_export_file_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.export_file_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the UNKNOWN folder expansion limit.
    pub fn with_max_unknown_node_descendants(mut self, max: usize) -> Self {
        self.config.max_unknown_node_descendants = max;
        self
    }

    /// Builds the ExploreConfig.
    pub fn build(self) -> ExploreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explore_config_default() {
        let config = ExploreConfig::default();
        assert_eq!(config.tree_count_timeout, Duration::from_secs(60));
        assert_eq!(config.survival_analysis_timeout, Duration::from_secs(600));
        assert_eq!(config.query_type, ExploreQueryType::CountGlobal);
        assert_eq!(config.export_file_formats, vec!["TSV", "SPSS"]);
        assert_eq!(config.max_unknown_node_descendants, 6);
    }

    #[test]
    fn test_explore_config_builder() {
        let config = ExploreConfig::builder()
            .with_tree_count_timeout(Duration::from_secs(5))
            .with_survival_analysis_timeout(Duration::from_secs(50))
            .with_query_type(ExploreQueryType::CountGlobalObfuscated)
            .with_export_file_formats(["CSV"])
            .with_max_unknown_node_descendants(3)
            .build();

        assert_eq!(config.tree_count_timeout, Duration::from_secs(5));
        assert_eq!(config.survival_analysis_timeout, Duration::from_secs(50));
        assert_eq!(config.query_type, ExploreQueryType::CountGlobalObfuscated);
        assert_eq!(config.export_file_formats, vec!["CSV"]);
        assert_eq!(config.max_unknown_node_descendants, 3);
    }

    #[test]
    fn test_query_type_privilege() {
        assert!(ExploreQueryType::PatientList.can_aggregate());
        assert!(ExploreQueryType::CountGlobal.can_aggregate());
        assert!(!ExploreQueryType::CountGlobalObfuscated.can_aggregate());
    }
}
