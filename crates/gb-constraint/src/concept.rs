//! Concept value objects: the queryable clinical variables behind concept constraints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConstraintError;

/// Value type of a concept, as carried in the `valueType` wire field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ValueType {
    /// Numerical observations: `NUMERIC`
    Numeric,
    /// Categorical observations: `CATEGORICAL`
    Categorical,
    /// Date observations: `DATE`
    Date,
    /// Free text observations: `TEXT`
    Text,
    /// High-dimensional data: `HIGH_DIMENSIONAL`
    HighDimensional,
}

impl ValueType {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Numeric => "NUMERIC",
            ValueType::Categorical => "CATEGORICAL",
            ValueType::Date => "DATE",
            ValueType::Text => "TEXT",
            ValueType::HighDimensional => "HIGH_DIMENSIONAL",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NUMERIC" => Ok(ValueType::Numeric),
            "CATEGORICAL" => Ok(ValueType::Categorical),
            "DATE" => Ok(ValueType::Date),
            "TEXT" => Ok(ValueType::Text),
            "HIGH_DIMENSIONAL" => Ok(ValueType::HighDimensional),
            other => Err(ConstraintError::invalid(
                "valueType",
                format!("unknown value type '{}'", other),
            )),
        }
    }
}

/// Describes how a modifier tree node attaches to its base concept.
///
/// Example: a `specimen type` modifier applied to every concept under
/// `/I2B2/Labs/%`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Modifier {
    /// Path of the modifier node itself.
    pub path: String,
    /// Applied path pattern of the modifier.
    pub applied_path: String,
    /// Path of the concept the modifier qualifies.
    pub applied_concept_path: String,
}

impl Modifier {
    /// Creates a modifier link.
    pub fn new(
        path: impl Into<String>,
        applied_path: impl Into<String>,
        applied_concept_path: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            applied_path: applied_path.into(),
            applied_concept_path: applied_concept_path.into(),
        }
    }
}

/// Encryption metadata attached to medco concepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncryptionDescriptor {
    /// Whether observations of this concept are encrypted.
    pub encrypted: bool,
    /// Integer identifier used for the encrypted form of the concept.
    pub id: Option<i64>,
    /// Encryption ids of the concept's children.
    pub child_encrypt_ids: Vec<i64>,
}

/// Summary statistics the backend reports for a concept.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Aggregate {
    /// Range summary of a numerical concept.
    Numerical {
        /// Smallest observed value.
        min: f64,
        /// Largest observed value.
        max: f64,
        /// Mean of the observed values.
        avg: f64,
    },
    /// Value frequencies of a categorical concept.
    Categorical {
        /// Count per category value.
        value_counts: BTreeMap<String, u64>,
    },
}

/// A queryable clinical variable identified by its tree path.
///
/// Concepts are plain values: mutate a clone rather than a shared instance.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Concept {
    /// Unique tree path, e.g. `/I2B2/Demographics/Age/`.
    pub path: String,
    /// Value type of the observations.
    pub value_type: Option<ValueType>,
    /// Display text.
    pub label: String,
    /// Optional summary statistics.
    pub aggregate: Option<Aggregate>,
    /// Concept code, e.g. `DEM:AGE`.
    pub code: Option<String>,
    /// Short name, the last path segment.
    pub name: Option<String>,
    /// Full name, usually the path.
    pub full_name: Option<String>,
    /// Free-form comment.
    pub comment: Option<String>,
    /// Medco encryption metadata.
    pub encryption_descriptor: Option<EncryptionDescriptor>,
    /// Modifier link when the concept was derived from a modifier node.
    pub modifier: Option<Modifier>,
    /// Unit of the numerical values.
    pub unit: Option<String>,
    /// Values are integers.
    pub is_integer: Option<bool>,
    /// Values are positive.
    pub is_positive: Option<bool>,
    /// Values are free text.
    pub is_text: Option<bool>,
}

impl Concept {
    /// Creates a concept with a path and value type.
    pub fn new(path: impl Into<String>, value_type: Option<ValueType>) -> Self {
        Self {
            path: path.into(),
            value_type,
            ..Default::default()
        }
    }

    /// Sets the concept code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Returns true if the concept has numerical observations.
    pub fn is_numeric(&self) -> bool {
        self.value_type == Some(ValueType::Numeric)
    }

    /// Returns true if the concept has categorical observations.
    pub fn is_categorical(&self) -> bool {
        self.value_type == Some(ValueType::Categorical)
    }
}
