use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::artifacts::TableSchema;
use crate::contributions::{DEFAULT_EPSILON, DecomposeOptions};
use crate::ranking::RankOptions;

const DEFAULT_METADATA_PATH: &str = "models/main_model_meta.json";
const DEFAULT_PREDICTIONS_PATH: &str = "data/processed/preview_predictions.csv";
const DEFAULT_EXPORT_DIR: &str = "exports";
const DEFAULT_THRESHOLD: f64 = 0.5;
const DEFAULT_TOP_REASONS: usize = 3;
const DEFAULT_CALIBRATION_BINS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardConfig {
    pub metadata_path: PathBuf,
    pub predictions_path: PathBuf,
    /// Entry of a `models` config document; the first entry when unset.
    pub model_key: Option<String>,
    pub schema: TableSchema,
    /// Probability at or above which a row counts as a predicted blue win.
    pub threshold: f64,
    pub epsilon: f64,
    pub probability_tolerance: Option<f64>,
    pub hide_zero_weight: bool,
    pub strict: bool,
    pub load_timeout: Option<Duration>,
    pub top_reasons: usize,
    pub calibration_bins: usize,
    pub export_dir: PathBuf,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from(DEFAULT_METADATA_PATH),
            predictions_path: PathBuf::from(DEFAULT_PREDICTIONS_PATH),
            model_key: None,
            schema: TableSchema::default(),
            threshold: DEFAULT_THRESHOLD,
            epsilon: DEFAULT_EPSILON,
            probability_tolerance: None,
            hide_zero_weight: false,
            strict: false,
            load_timeout: None,
            top_reasons: DEFAULT_TOP_REASONS,
            calibration_bins: DEFAULT_CALIBRATION_BINS,
            export_dir: PathBuf::from(DEFAULT_EXPORT_DIR),
        }
    }
}

impl DashboardConfig {
    /// Read `RIFT_*` variables from the process environment.
    ///
    /// Callers that want `.env` support load it with `dotenvy` first.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut schema = defaults.schema.clone();
        if let Some(v) = text("RIFT_ID_COLUMN") {
            schema.id_column = v;
        }
        if let Some(v) = text("RIFT_PROBABILITY_COLUMN") {
            schema.probability_column = v;
        }
        if let Some(v) = text("RIFT_LABEL_COLUMN") {
            schema.label_column = v;
        }
        // An explicitly empty score column disables the stored-score check.
        match lookup("RIFT_SCORE_COLUMN") {
            Some(raw) if raw.trim().is_empty() => schema.score_column = None,
            Some(raw) => schema.score_column = Some(raw.trim().to_string()),
            None => {}
        }
        if let Some(raw) = lookup("RIFT_IGNORED_COLUMNS") {
            schema.ignored_columns = parse_list(&raw);
        }

        Self {
            metadata_path: text("RIFT_METADATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_path),
            predictions_path: text("RIFT_PREDICTIONS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.predictions_path),
            model_key: text("RIFT_MODEL_KEY"),
            schema,
            threshold: text("RIFT_THRESHOLD")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(defaults.threshold)
                .clamp(0.0, 1.0),
            epsilon: text("RIFT_EPSILON")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(defaults.epsilon),
            probability_tolerance: text("RIFT_PROBABILITY_TOLERANCE")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0),
            hide_zero_weight: text("RIFT_HIDE_ZERO_WEIGHT")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.hide_zero_weight),
            strict: text("RIFT_STRICT")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.strict),
            load_timeout: text("RIFT_LOAD_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            top_reasons: text("RIFT_TOP_REASONS")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.top_reasons)
                .max(1),
            calibration_bins: text("RIFT_CALIBRATION_BINS")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.calibration_bins)
                .clamp(2, 20),
            export_dir: text("RIFT_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
        }
    }

    pub fn rank_options(&self) -> RankOptions {
        RankOptions {
            hide_zero_weight: self.hide_zero_weight,
        }
    }

    pub fn decompose_options(&self) -> DecomposeOptions {
        DecomposeOptions {
            epsilon: self.epsilon,
            probability_tolerance: self.probability_tolerance,
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
