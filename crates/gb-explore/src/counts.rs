//! Count maps, export formats, saved queries and alerts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Patient and observation counts of one study or concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountItem {
    /// Number of patients.
    pub patient_count: u64,
    /// Number of observations.
    pub observation_count: u64,
}

impl CountItem {
    /// Creates a count item.
    pub fn new(patient_count: u64, observation_count: u64) -> Self {
        Self {
            patient_count,
            observation_count,
        }
    }
}

/// Counts per study id, then per concept code.
pub type StudyConceptCounts = BTreeMap<String, BTreeMap<String, CountItem>>;

/// Per-concept and per-study maps derived from [`StudyConceptCounts`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CountSummary {
    /// Counts per concept code. A concept present in several studies keeps
    /// the counts of the last study.
    pub concept_count_map: BTreeMap<String, CountItem>,
    /// Counts per study, summed over its concepts.
    pub study_count_map: BTreeMap<String, CountItem>,
    /// Distinct concept codes, in first-seen order.
    pub concept_codes: Vec<String>,
    /// Study ids.
    pub study_codes: Vec<String>,
}

impl CountSummary {
    /// Summarizes a per-study, per-concept count map.
    ///
    /// # Example
    ///
    /// ```rust
    /// use gb_explore::{CountItem, CountSummary, StudyConceptCounts};
    ///
    /// let mut counts = StudyConceptCounts::new();
    /// counts.entry("S1".into()).or_default().insert("C1".into(), CountItem::new(3, 9));
    ///
    /// let summary = CountSummary::from_counts(&counts);
    /// assert_eq!(summary.study_count_map["S1"], CountItem::new(3, 9));
    /// assert_eq!(summary.concept_codes, vec!["C1"]);
    /// ```
    pub fn from_counts(counts: &StudyConceptCounts) -> Self {
        let mut summary = CountSummary::default();
        for (study, concepts) in counts {
            summary.study_codes.push(study.clone());
            let mut study_total = CountItem::default();
            for (code, item) in concepts {
                if !summary.concept_count_map.contains_key(code) {
                    summary.concept_codes.push(code.clone());
                }
                summary.concept_count_map.insert(code.clone(), *item);
                study_total.patient_count += item.patient_count;
                study_total.observation_count += item.observation_count;
            }
            summary.study_count_map.insert(study.clone(), study_total);
        }
        summary
    }

    /// Number of distinct concepts.
    pub fn concept_count(&self) -> usize {
        self.concept_codes.len()
    }

    /// Number of studies.
    pub fn study_count(&self) -> usize {
        self.study_codes.len()
    }
}

/// An export file format and whether the user picked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFormat {
    /// Format name, e.g. `TSV`.
    pub name: String,
    /// Selected for export.
    pub checked: bool,
}

/// An export data format with its file formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDataFormat {
    /// Data format name, e.g. `clinical`.
    pub name: String,
    /// Selected for export.
    pub checked: bool,
    /// File formats offered for this data format.
    pub file_formats: Vec<FileFormat>,
}

impl ExportDataFormat {
    /// Pairs every data format with every file format, all checked.
    pub fn build_all(data_formats: &[String], file_formats: &[String]) -> Vec<ExportDataFormat> {
        data_formats
            .iter()
            .map(|name| ExportDataFormat {
                name: name.clone(),
                checked: true,
                file_formats: file_formats
                    .iter()
                    .map(|f| FileFormat {
                        name: f.clone(),
                        checked: true,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Toggles one file format. Returns false if the format is unknown.
    pub fn set_file_format_checked(&mut self, file_format: &str, checked: bool) -> bool {
        match self.file_formats.iter_mut().find(|f| f.name == file_format) {
            Some(f) => {
                f.checked = checked;
                true
            }
            None => false,
        }
    }
}

/// Severity of an alert message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Operation succeeded.
    Success,
    /// Informational.
    Info,
    /// Warning.
    Warn,
    /// Operation failed.
    Error,
}

/// Message shown to the user by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Severity.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Details.
    pub detail: String,
}

/// Observation part of a saved query: the paths of the projected nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObservationsQuery {
    /// Tree paths.
    pub data: Vec<String>,
}

/// A saved query as exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQuery {
    /// Backend id, absent before the first save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Query name.
    pub name: String,
    /// Patient-level query object of the selection.
    #[serde(default)]
    pub patients_query: Option<Value>,
    /// Projected tree paths.
    #[serde(default)]
    pub observations_query: ObservationsQuery,
    /// Bookmarked by the user.
    #[serde(default)]
    pub bookmarked: bool,
    /// Collapsed in the UI list.
    #[serde(default)]
    pub collapsed: bool,
    /// Visible in the UI list.
    #[serde(default)]
    pub visible: bool,
}
