use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to turn a stored artifact into typed in-memory data.
///
/// Every variant names the offending path and, where there is one, the field,
/// column or row that could not be used.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {}", path.display())]
    Missing { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artifact {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("{}: missing required field `{field}`", path.display())]
    MissingField { path: PathBuf, field: String },

    #[error("{}: missing required column `{column}`", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error(
        "{}: row {row}, column `{column}`: cannot parse {value:?} as {expected}",
        path.display()
    )]
    InvalidValue {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
        expected: &'static str,
    },

    #[error("{}: duplicate row id {id:?} at row {row}", path.display())]
    DuplicateRowId { path: PathBuf, id: String, row: usize },

    #[error("{}: unsupported table format (expected .csv or .parquet)", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("{}: columns without a model weight: {}", path.display(), features.join(", "))]
    UnweightedFeatures { path: PathBuf, features: Vec<String> },

    #[error("loading artifacts timed out after {0:?}")]
    Timeout(Duration),
}

impl ArtifactError {
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(path: impl Into<PathBuf>, field: impl Into<String>) -> Self {
        Self::MissingField {
            path: path.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("model {model:?} has no feature weights")]
pub struct EmptyModelError {
    pub model: String,
}

/// The stored score of a row disagrees with the sum of its contributions.
#[derive(Debug, Clone, Error, PartialEq)]
#[error(
    "row {row_id}: contributions + bias = {computed:.6} but stored {against} is {stored:.6} \
     (tolerance {epsilon:e})"
)]
pub struct ContributionMismatchError {
    pub row_id: String,
    pub computed: f64,
    pub stored: f64,
    pub epsilon: f64,
    pub against: MismatchSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchSource {
    RawScore,
    Probability,
}

impl std::fmt::Display for MismatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchSource::RawScore => f.write_str("raw score"),
            MismatchSource::Probability => f.write_str("probability"),
        }
    }
}

/// Soft error: a hold-out metric with no compute function configured.
///
/// Never raised; it travels inside the metrics view as the reason a preview
/// value is not applicable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no preview computation configured for metric {metric:?}")]
pub struct UnknownMetricError {
    pub metric: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecomposeError {
    #[error("no row with id {0:?} in the prediction table")]
    UnknownRow(String),
    #[error(transparent)]
    EmptyModel(#[from] EmptyModelError),
    #[error(transparent)]
    Mismatch(#[from] ContributionMismatchError),
}
