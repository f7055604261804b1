use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::DashboardConfig;
use crate::error::ArtifactError;

/// Mean and scale the training pipeline used to standardize a numeric feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f64,
    pub scale: f64,
}

impl Standardization {
    pub fn apply(&self, raw: f64) -> f64 {
        let scale = if self.scale == 0.0 { 1.0 } else { self.scale };
        (raw - self.mean) / scale
    }
}

/// How a weight reads its table column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Encoding {
    /// The column value, standardized when the model carries a scaler for it.
    Linear,
    /// One-hot level: 1 when the column equals `level`, otherwise 0.
    Indicator { level: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureTerm {
    pub column: String,
    pub encoding: Encoding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub model_version: Option<String>,
    pub feature_set: Option<String>,
    /// Hold-out metrics in document order.
    pub holdout_metrics: Vec<(String, f64)>,
    pub weights: BTreeMap<String, f64>,
    /// Weights that do not multiply the column of the same name, such as
    /// one-hot levels (`first_dragon=True` reads column `first_dragon`).
    pub terms: BTreeMap<String, FeatureTerm>,
    pub intercept: Option<f64>,
    pub standardization: BTreeMap<String, Standardization>,
}

impl ModelMetadata {
    pub fn bias(&self) -> f64 {
        self.intercept.unwrap_or(0.0)
    }

    pub fn weight(&self, feature: &str) -> Option<f64> {
        self.weights.get(feature).copied()
    }

    /// Table column a weight reads.
    pub fn column_of<'a>(&'a self, weight_name: &'a str) -> &'a str {
        self.terms
            .get(weight_name)
            .map(|term| term.column.as_str())
            .unwrap_or(weight_name)
    }

    /// The number `weight_name`'s weight multiplies, given the raw column value.
    pub fn encode(&self, weight_name: &str, raw: f64) -> f64 {
        match self.terms.get(weight_name).map(|term| term.encoding) {
            Some(Encoding::Indicator { level }) => {
                if raw == level {
                    1.0
                } else {
                    0.0
                }
            }
            _ => match self.standardization.get(self.column_of(weight_name)) {
                Some(s) => s.apply(raw),
                None => raw,
            },
        }
    }

    /// Whether any weight reads `column`.
    pub fn covers(&self, column: &str) -> bool {
        self.weights.keys().any(|name| self.column_of(name) == column)
    }

    pub fn label(&self) -> String {
        match &self.model_version {
            Some(version) => format!("{} ({version})", self.model_name),
            None => self.model_name.clone(),
        }
    }
}

/// One evaluated match from the preview sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRow {
    pub id: String,
    columns: Arc<[String]>,
    values: Vec<f64>,
    pub probability: f64,
    pub label: u8,
    pub raw_score: Option<f64>,
    pub predicted_label: u8,
    pub correct: bool,
}

impl PredictionRow {
    pub fn new(
        id: impl Into<String>,
        features: Vec<(String, f64)>,
        probability: f64,
        label: u8,
        raw_score: Option<f64>,
        threshold: f64,
    ) -> Self {
        let (columns, values): (Vec<String>, Vec<f64>) = features.into_iter().unzip();
        Self::with_columns(
            id.into(),
            columns.into(),
            values,
            probability,
            label,
            raw_score,
            threshold,
        )
    }

    fn with_columns(
        id: String,
        columns: Arc<[String]>,
        values: Vec<f64>,
        probability: f64,
        label: u8,
        raw_score: Option<f64>,
        threshold: f64,
    ) -> Self {
        let predicted_label = u8::from(probability >= threshold);
        Self {
            id,
            columns,
            values,
            probability,
            label,
            raw_score,
            predicted_label,
            correct: predicted_label == label,
        }
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx).copied())
    }

    pub fn features(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    pub fn feature_names(&self) -> &[String] {
        &self.columns
    }
}

/// Column roles of the prediction table. Every column that is not a role column
/// and not ignored is read as a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub id_column: String,
    pub probability_column: String,
    pub label_column: String,
    /// Optional per-row model score (log-odds). Absent from the file is fine.
    pub score_column: Option<String>,
    pub ignored_columns: Vec<String>,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            id_column: "match_id".to_string(),
            probability_column: "pred_proba".to_string(),
            label_column: "blue_win".to_string(),
            score_column: Some("raw_score".to_string()),
            ignored_columns: vec![
                "pred_label".to_string(),
                "predicted_label".to_string(),
                "correct".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Position,
    Id,
    Probability,
    Label,
    Correct,
    Feature(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTable {
    source: PathBuf,
    columns: Arc<[String]>,
    rows: Vec<PredictionRow>,
    index: HashMap<String, usize>,
}

impl PredictionTable {
    /// Build a table from rows that were not read from storage.
    pub fn from_rows(
        source: impl Into<PathBuf>,
        rows: Vec<PredictionRow>,
    ) -> Result<Self, ArtifactError> {
        let source = source.into();
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for name in row.feature_names() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        let index = build_index(&source, &rows)?;
        Ok(Self {
            source,
            columns: columns.into(),
            rows,
            index,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[PredictionRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&PredictionRow> {
        self.position(id).and_then(|idx| self.rows.get(idx))
    }

    /// Display order for `key`; the row sequence itself is left untouched.
    /// Ties keep preview order.
    pub fn sorted_order(&self, key: SortKey, descending: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        if key == SortKey::Position {
            if descending {
                order.reverse();
            }
            return order;
        }
        order.sort_by(|&a, &b| {
            let (ra, rb) = (&self.rows[a], &self.rows[b]);
            let ord = match key {
                SortKey::Position => a.cmp(&b),
                SortKey::Id => compare_ids(&ra.id, &rb.id),
                SortKey::Probability => ra.probability.total_cmp(&rb.probability),
                SortKey::Label => ra.label.cmp(&rb.label),
                SortKey::Correct => ra.correct.cmp(&rb.correct),
                SortKey::Feature(col) => {
                    let name = self.columns.get(col).map(String::as_str).unwrap_or("");
                    let va = ra.feature(name).unwrap_or(f64::NEG_INFINITY);
                    let vb = rb.feature(name).unwrap_or(f64::NEG_INFINITY);
                    va.total_cmp(&vb)
                }
            };
            let ord = if descending { ord.reverse() } else { ord };
            ord.then(a.cmp(&b))
        });
        order
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedArtifacts {
    pub metadata: ModelMetadata,
    pub table: PredictionTable,
}

pub fn load_artifacts(config: &DashboardConfig) -> Result<LoadedArtifacts, ArtifactError> {
    let metadata = load_model_metadata(&config.metadata_path, config.model_key.as_deref())?;
    let table = load_predictions(&config.predictions_path, &config.schema, config.threshold)?;
    Ok(LoadedArtifacts { metadata, table })
}

/// Same as [`load_artifacts`], but gives up after `config.load_timeout`.
///
/// The read runs on a worker thread; a worker that outlives the timeout is
/// left to finish on its own and its result is dropped.
pub fn load_artifacts_with_timeout(
    config: &DashboardConfig,
) -> Result<LoadedArtifacts, ArtifactError> {
    let Some(timeout) = config.load_timeout else {
        return load_artifacts(config);
    };

    let (tx, rx) = mpsc::channel();
    let worker_config = config.clone();
    thread::spawn(move || {
        let _ = tx.send(load_artifacts(&worker_config));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(?timeout, "artifact load timed out");
            Err(ArtifactError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ArtifactError::malformed(
            &config.metadata_path,
            "artifact loader exited without a result",
        )),
    }
}

/// Feature columns of `table` with no weight in `metadata`.
///
/// In strict mode any such column fails validation; otherwise the names are
/// returned so callers can flag the drift.
pub fn validate_feature_coverage(
    metadata: &ModelMetadata,
    table: &PredictionTable,
    strict: bool,
) -> Result<Vec<String>, ArtifactError> {
    let unweighted: Vec<String> = table
        .feature_columns()
        .iter()
        .filter(|name| !metadata.covers(name))
        .cloned()
        .collect();
    if unweighted.is_empty() {
        return Ok(unweighted);
    }
    if strict {
        return Err(ArtifactError::UnweightedFeatures {
            path: table.source().to_path_buf(),
            features: unweighted,
        });
    }
    warn!(
        features = ?unweighted,
        "prediction table has feature columns without model weights"
    );
    Ok(unweighted)
}

#[derive(Debug, Default, Deserialize)]
struct MetadataDocument {
    #[serde(default, alias = "name")]
    model_name: Option<String>,
    #[serde(default, alias = "version")]
    model_version: Option<Value>,
    #[serde(default)]
    feature_set: Option<String>,
    #[serde(default)]
    metrics: Option<Map<String, Value>>,
    #[serde(default)]
    weights: Option<Map<String, Value>>,
    #[serde(default)]
    feature_names: Option<Vec<String>>,
    #[serde(default)]
    coefficients: Option<Vec<f64>>,
    #[serde(default)]
    weights_file: Option<String>,
    #[serde(default, alias = "bias")]
    intercept: Option<f64>,
    #[serde(default)]
    numeric_features: Option<Vec<String>>,
    #[serde(default)]
    categorical_features: Option<Vec<String>>,
    #[serde(default)]
    scaler_mean: Option<Vec<f64>>,
    #[serde(default)]
    scaler_scale: Option<Vec<f64>>,
    #[serde(default)]
    standardization: Option<BTreeMap<String, Standardization>>,
    /// `models_config.json` layout: one entry per exported model.
    #[serde(default)]
    models: Option<Map<String, Value>>,
}

impl MetadataDocument {
    fn has_weights(&self) -> bool {
        self.weights.is_some() || self.feature_names.is_some() || self.coefficients.is_some()
    }
}

pub fn load_metadata(path: &Path) -> Result<ModelMetadata, ArtifactError> {
    load_model_metadata(path, None)
}

/// Load model metadata, either a single-model document or a `models` config
/// holding several entries. `model_key` picks the entry; the first one is used
/// when it is `None`.
pub fn load_model_metadata(
    path: &Path,
    model_key: Option<&str>,
) -> Result<ModelMetadata, ArtifactError> {
    let mut doc = read_metadata_document(path)?;
    let Some(models) = doc.models.take() else {
        return build_metadata(path, doc, None);
    };

    let (key, entry) = match model_key {
        Some(key) => models
            .get(key)
            .map(|entry| (key, entry))
            .ok_or_else(|| ArtifactError::missing_field(path, format!("models.{key}")))?,
        None => models
            .iter()
            .next()
            .map(|(key, entry)| (key.as_str(), entry))
            .ok_or_else(|| ArtifactError::malformed(path, "`models` has no entries"))?,
    };
    let entry: MetadataDocument = serde_json::from_value(entry.clone())
        .map_err(|err| ArtifactError::malformed(path, format!("models.{key}: {err}")))?;
    build_metadata(path, entry, Some(key))
}

fn build_metadata(
    path: &Path,
    doc: MetadataDocument,
    entry_key: Option<&str>,
) -> Result<ModelMetadata, ArtifactError> {
    let model_name = doc
        .model_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ArtifactError::missing_field(path, "model_name"))?
        .to_string();
    let metrics = doc
        .metrics
        .as_ref()
        .ok_or_else(|| ArtifactError::missing_field(path, "metrics"))?;
    let holdout_metrics = parse_metrics(path, metrics)?;

    // Weights may live in a sibling file named by `weights_file`. A config
    // entry without one (e.g. a tree model) has no linear weights at all.
    let weights_doc = if doc.has_weights() {
        None
    } else if let Some(file) = doc.weights_file.as_deref() {
        let sibling = path
            .parent()
            .map(|dir| dir.join(file))
            .unwrap_or_else(|| PathBuf::from(file));
        let weights = read_metadata_document(&sibling)?;
        Some((weights, sibling))
    } else if entry_key.is_some() {
        None
    } else {
        return Err(ArtifactError::missing_field(path, "weights"));
    };
    let (source, weights_path) = match &weights_doc {
        Some((weights, sibling)) => (weights, sibling.as_path()),
        None => (&doc, path),
    };

    let (weights, terms) = if source.has_weights() {
        resolve_weights(weights_path, raw_weights(weights_path, source)?, source)?
    } else {
        (BTreeMap::new(), BTreeMap::new())
    };
    let standardization = parse_standardization(weights_path, source)?;
    let intercept = doc.intercept.or(source.intercept);
    if let Some(bias) = intercept
        && !bias.is_finite()
    {
        return Err(ArtifactError::malformed(path, "intercept is not finite"));
    }

    let model_version = doc.model_version.as_ref().and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    });

    info!(
        path = %path.display(),
        model = %model_name,
        entry = entry_key.unwrap_or("-"),
        weights = weights.len(),
        metrics = holdout_metrics.len(),
        "loaded model metadata"
    );

    Ok(ModelMetadata {
        model_name,
        model_version,
        feature_set: doc.feature_set.clone(),
        holdout_metrics,
        weights,
        terms,
        intercept,
        standardization,
    })
}

fn read_metadata_document(path: &Path) -> Result<MetadataDocument, ArtifactError> {
    let raw = fs::read_to_string(path).map_err(|err| io_error(path, err))?;
    serde_json::from_str::<MetadataDocument>(&raw)
        .map_err(|err| ArtifactError::malformed(path, err.to_string()))
}

fn parse_metrics(
    path: &Path,
    metrics: &Map<String, Value>,
) -> Result<Vec<(String, f64)>, ArtifactError> {
    metrics
        .iter()
        .map(|(name, value)| {
            value
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| (name.clone(), v))
                .ok_or_else(|| {
                    ArtifactError::malformed(
                        path,
                        format!("field `metrics.{name}` must be a finite number, got {value}"),
                    )
                })
        })
        .collect()
}

/// Weights as written, in document order.
fn raw_weights(path: &Path, doc: &MetadataDocument) -> Result<Vec<(String, f64)>, ArtifactError> {
    let mut weights = Vec::new();
    if let Some(map) = &doc.weights {
        for (name, value) in map {
            let weight = value.as_f64().ok_or_else(|| {
                ArtifactError::malformed(
                    path,
                    format!("field `weights.{name}` must be a number, got {value}"),
                )
            })?;
            weights.push((name.clone(), weight));
        }
    } else {
        let names = doc
            .feature_names
            .as_ref()
            .ok_or_else(|| ArtifactError::missing_field(path, "feature_names"))?;
        let coefficients = doc
            .coefficients
            .as_ref()
            .ok_or_else(|| ArtifactError::missing_field(path, "coefficients"))?;
        if names.len() != coefficients.len() {
            return Err(ArtifactError::malformed(
                path,
                format!(
                    "{} feature_names but {} coefficients",
                    names.len(),
                    coefficients.len()
                ),
            ));
        }
        weights.extend(names.iter().cloned().zip(coefficients.iter().copied()));
    }

    if let Some((name, _)) = weights.iter().find(|(_, w)| !w.is_finite()) {
        return Err(ArtifactError::malformed(
            path,
            format!("weight for {name:?} is not finite"),
        ));
    }
    Ok(weights)
}

/// Map transformer output names back to table columns.
///
/// `num__gold_diff_15` weighs column `gold_diff_15`; `cat__first_dragon_True`
/// becomes weight `first_dragon=True`, an indicator on column `first_dragon`.
/// Names without a `__` prefix weigh the column of the same name.
fn resolve_weights(
    path: &Path,
    raw: Vec<(String, f64)>,
    doc: &MetadataDocument,
) -> Result<(BTreeMap<String, f64>, BTreeMap<String, FeatureTerm>), ArtifactError> {
    let categorical = doc.categorical_features.as_deref().unwrap_or(&[]);
    let mut weights = BTreeMap::new();
    let mut terms = BTreeMap::new();

    for (name, weight) in raw {
        let (prefix, base) = match name.split_once("__") {
            Some((prefix, base)) => (Some(prefix), base),
            None => (None, name.as_str()),
        };
        let one_hot = if categorical.iter().any(|c| c == base) || prefix == Some("num") {
            None
        } else if let Some(feature) = categorical
            .iter()
            .filter(|c| base.len() > c.len() + 1)
            .filter(|c| base.starts_with(c.as_str()) && base.as_bytes()[c.len()] == b'_')
            .max_by_key(|c| c.len())
        {
            Some((feature.as_str(), &base[feature.len() + 1..]))
        } else if prefix == Some("cat") {
            let split = base.rsplit_once('_').ok_or_else(|| {
                ArtifactError::malformed(path, format!("cannot split one-hot weight {name:?}"))
            })?;
            Some(split)
        } else {
            None
        };

        let key = match one_hot {
            Some((column, level_text)) => {
                let level = parse_level(level_text).ok_or_else(|| {
                    ArtifactError::malformed(
                        path,
                        format!(
                            "one-hot level {level_text:?} of {column:?} is not a number or boolean"
                        ),
                    )
                })?;
                let key = format!("{column}={level_text}");
                terms.insert(
                    key.clone(),
                    FeatureTerm {
                        column: column.to_string(),
                        encoding: Encoding::Indicator { level },
                    },
                );
                key
            }
            None => base.to_string(),
        };
        if weights.insert(key.clone(), weight).is_some() {
            return Err(ArtifactError::malformed(
                path,
                format!("feature {key:?} listed twice"),
            ));
        }
    }
    Ok((weights, terms))
}

fn parse_level(raw: &str) -> Option<f64> {
    Cell::Text(raw.to_string()).as_f64()
}

fn parse_standardization(
    path: &Path,
    doc: &MetadataDocument,
) -> Result<BTreeMap<String, Standardization>, ArtifactError> {
    let mut out: BTreeMap<String, Standardization> = doc
        .standardization
        .iter()
        .flatten()
        .map(|(name, s)| (strip_transformer_prefix(name).to_string(), *s))
        .collect();
    if let (Some(names), Some(means), Some(scales)) =
        (&doc.numeric_features, &doc.scaler_mean, &doc.scaler_scale)
    {
        if names.len() != means.len() || names.len() != scales.len() {
            return Err(ArtifactError::malformed(
                path,
                "numeric_features, scaler_mean and scaler_scale differ in length",
            ));
        }
        for ((name, mean), scale) in names.iter().zip(means).zip(scales) {
            out.insert(
                strip_transformer_prefix(name).to_string(),
                Standardization {
                    mean: *mean,
                    scale: *scale,
                },
            );
        }
    }
    if let Some((name, _)) = out
        .iter()
        .find(|(_, s)| !s.mean.is_finite() || !s.scale.is_finite())
    {
        return Err(ArtifactError::malformed(
            path,
            format!("standardization for {name:?} is not finite"),
        ));
    }
    Ok(out)
}

fn strip_transformer_prefix(name: &str) -> &str {
    name.split_once("__").map(|(_, base)| base).unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
}

impl Cell {
    fn display(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Number(n) => n.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        let v = match self {
            Cell::Bool(b) => f64::from(u8::from(*b)),
            Cell::Int(i) => *i as f64,
            Cell::Number(n) => *n,
            Cell::Text(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("true") {
                    1.0
                } else if s.eq_ignore_ascii_case("false") {
                    0.0
                } else {
                    s.parse::<f64>().ok()?
                }
            }
            Cell::Null => return None,
        };
        v.is_finite().then_some(v)
    }

    fn as_id(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                Some(format!("{}", *n as i64))
            }
            other => {
                let s = other.display().trim().to_string();
                (!s.is_empty()).then_some(s)
            }
        }
    }
}

pub fn load_predictions(
    path: &Path,
    schema: &TableSchema,
    threshold: f64,
) -> Result<PredictionTable, ArtifactError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    let (headers, records) = match extension.as_deref() {
        Some("csv") => read_csv(path)?,
        Some("parquet") | Some("pq") => read_parquet(path)?,
        _ => {
            return Err(ArtifactError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
    };
    let table = build_table(path, schema, threshold, &headers, records)?;
    info!(
        path = %path.display(),
        rows = table.len(),
        features = table.feature_columns().len(),
        "loaded prediction table"
    );
    Ok(table)
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<Cell>>), ArtifactError> {
    let file = File::open(path).map_err(|err| io_error(path, err))?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(|err| ArtifactError::malformed(path, format!("unreadable header: {err}")))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ArtifactError::malformed(path, err.to_string()))?;
        records.push(
            record
                .iter()
                .map(|cell| Cell::Text(cell.to_string()))
                .collect(),
        );
    }
    Ok((headers, records))
}

fn read_parquet(path: &Path) -> Result<(Vec<String>, Vec<Vec<Cell>>), ArtifactError> {
    let file = File::open(path).map_err(|err| io_error(path, err))?;
    let reader = SerializedFileReader::new(file)
        .map_err(|err| ArtifactError::malformed(path, err.to_string()))?;
    let headers: Vec<String> = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .root_schema()
        .get_fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();

    let rows = reader
        .get_row_iter(None)
        .map_err(|err| ArtifactError::malformed(path, err.to_string()))?;
    let mut records = Vec::new();
    for row in rows {
        let row = row.map_err(|err| ArtifactError::malformed(path, err.to_string()))?;
        let mut cells = vec![Cell::Null; headers.len()];
        for (name, field) in row.get_column_iter() {
            if let Some(pos) = headers.iter().position(|h| h == name) {
                cells[pos] = cell_from_field(field);
            }
        }
        records.push(cells);
    }
    Ok((headers, records))
}

fn cell_from_field(field: &Field) -> Cell {
    match field {
        Field::Null => Cell::Null,
        Field::Bool(b) => Cell::Bool(*b),
        Field::Byte(v) => Cell::Int(i64::from(*v)),
        Field::Short(v) => Cell::Int(i64::from(*v)),
        Field::Int(v) => Cell::Int(i64::from(*v)),
        Field::Long(v) => Cell::Int(*v),
        Field::UByte(v) => Cell::Int(i64::from(*v)),
        Field::UShort(v) => Cell::Int(i64::from(*v)),
        Field::UInt(v) => Cell::Int(i64::from(*v)),
        Field::Float(v) => Cell::Number(f64::from(*v)),
        Field::Double(v) => Cell::Number(*v),
        Field::Str(s) => Cell::Text(s.clone()),
        other => Cell::Text(other.to_string()),
    }
}

fn build_table(
    path: &Path,
    schema: &TableSchema,
    threshold: f64,
    headers: &[String],
    records: Vec<Vec<Cell>>,
) -> Result<PredictionTable, ArtifactError> {
    let column = |name: &str| -> Result<usize, ArtifactError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ArtifactError::MissingColumn {
                path: path.to_path_buf(),
                column: name.to_string(),
            })
    };
    for (idx, name) in headers.iter().enumerate() {
        if headers[..idx].contains(name) {
            return Err(ArtifactError::malformed(
                path,
                format!("column {name:?} appears twice"),
            ));
        }
    }

    let id_col = column(&schema.id_column)?;
    let prob_col = column(&schema.probability_column)?;
    let label_col = column(&schema.label_column)?;
    let score_col = schema
        .score_column
        .as_deref()
        .and_then(|name| headers.iter().position(|h| h == name));

    let feature_cols: Vec<usize> = (0..headers.len())
        .filter(|idx| ![id_col, prob_col, label_col].contains(idx))
        .filter(|idx| Some(*idx) != score_col)
        .filter(|idx| !schema.ignored_columns.contains(&headers[*idx]))
        .collect();
    let columns: Arc<[String]> = feature_cols
        .iter()
        .map(|idx| headers[*idx].clone())
        .collect::<Vec<_>>()
        .into();

    let mut rows = Vec::with_capacity(records.len());
    for (offset, cells) in records.into_iter().enumerate() {
        let row_no = offset + 1;
        let cell = |idx: usize| cells.get(idx).cloned().unwrap_or(Cell::Null);
        let invalid = |idx: usize, expected: &'static str| ArtifactError::InvalidValue {
            path: path.to_path_buf(),
            row: row_no,
            column: headers[idx].clone(),
            value: cell(idx).display(),
            expected,
        };

        let id = cell(id_col)
            .as_id()
            .ok_or_else(|| invalid(id_col, "non-empty row id"))?;
        let probability = cell(prob_col)
            .as_f64()
            .filter(|p| (0.0..=1.0).contains(p))
            .ok_or_else(|| invalid(prob_col, "probability in [0, 1]"))?;
        let label = match cell(label_col).as_f64() {
            Some(v) if v == 0.0 => 0,
            Some(v) if v == 1.0 => 1,
            _ => return Err(invalid(label_col, "label 0 or 1")),
        };
        let raw_score = match score_col {
            Some(idx) if !cell(idx).is_blank() => Some(
                cell(idx)
                    .as_f64()
                    .ok_or_else(|| invalid(idx, "finite number"))?,
            ),
            _ => None,
        };
        let values = feature_cols
            .iter()
            .map(|&idx| cell(idx).as_f64().ok_or_else(|| invalid(idx, "finite number")))
            .collect::<Result<Vec<_>, _>>()?;

        rows.push(PredictionRow::with_columns(
            id,
            Arc::clone(&columns),
            values,
            probability,
            label,
            raw_score,
            threshold,
        ));
    }

    let index = build_index(path, &rows)?;
    Ok(PredictionTable {
        source: path.to_path_buf(),
        columns,
        rows,
        index,
    })
}

fn build_index(
    path: &Path,
    rows: &[PredictionRow],
) -> Result<HashMap<String, usize>, ArtifactError> {
    let mut index = HashMap::with_capacity(rows.len());
    for (pos, row) in rows.iter().enumerate() {
        if index.insert(row.id.clone(), pos).is_some() {
            return Err(ArtifactError::DuplicateRowId {
                path: path.to_path_buf(),
                id: row.id.clone(),
                row: pos + 1,
            });
        }
    }
    Ok(index)
}

fn io_error(path: &Path, err: io::Error) -> ArtifactError {
    if err.kind() == io::ErrorKind::NotFound {
        ArtifactError::Missing {
            path: path.to_path_buf(),
        }
    } else {
        ArtifactError::Unreadable {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

// Numeric ids sort numerically; anything else falls back to text order.
fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
