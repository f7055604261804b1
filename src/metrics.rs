use serde::Serialize;

use crate::artifacts::{PredictionRow, PredictionTable};
use crate::error::UnknownMetricError;

const LOG_LOSS_EPS: f64 = 1e-15;

/// Computes one preview metric from the rows in table order, or `None` when
/// the metric is undefined on this sample.
pub type MetricFn = fn(&[PredictionRow]) -> Option<f64>;

#[derive(Debug, Clone)]
pub struct MetricRegistry {
    entries: Vec<(String, MetricFn)>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl MetricRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// accuracy, precision, recall, f1, log_loss, roc_auc and brier, with the
    /// spellings training reports commonly use.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("accuracy", accuracy);
        registry.register("precision", precision);
        registry.register("recall", recall);
        registry.register("f1", f1);
        registry.register("f1_score", f1);
        registry.register("log_loss", log_loss);
        registry.register("logloss", log_loss);
        registry.register("roc_auc", roc_auc);
        registry.register("auc", roc_auc);
        registry.register("brier", brier);
        registry.register("brier_score", brier);
        registry
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register(&mut self, name: &str, compute: MetricFn) {
        let key = normalize_metric_name(name);
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = compute;
        } else {
            self.entries.push((key, compute));
        }
    }

    pub fn lookup(&self, name: &str) -> Option<MetricFn> {
        let key = normalize_metric_name(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, compute)| *compute)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

pub fn normalize_metric_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotApplicableReason {
    /// No compute function is configured for the metric name.
    UnknownMetric,
    /// Configured, but undefined on this sample (e.g. a single class).
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewValue {
    Computed(f64),
    NotApplicable(NotApplicableReason),
}

impl PreviewValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            PreviewValue::Computed(v) => Some(*v),
            PreviewValue::NotApplicable(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricComparison {
    pub name: String,
    pub holdout: f64,
    pub preview: PreviewValue,
}

impl MetricComparison {
    pub fn delta(&self) -> Option<f64> {
        self.preview.value().map(|v| v - self.holdout)
    }

    pub fn unknown_metric(&self) -> Option<UnknownMetricError> {
        match self.preview {
            PreviewValue::NotApplicable(NotApplicableReason::UnknownMetric) => {
                Some(UnknownMetricError {
                    metric: self.name.clone(),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsView {
    pub samples: usize,
    pub entries: Vec<MetricComparison>,
}

/// Pair every hold-out metric with its preview-sample value.
///
/// One entry per hold-out metric, in the order given; metrics that cannot be
/// computed stay in the view as not applicable.
pub fn reconcile(
    holdout: &[(String, f64)],
    table: &PredictionTable,
    registry: &MetricRegistry,
) -> MetricsView {
    let rows = table.rows();
    let entries = holdout
        .iter()
        .map(|(name, value)| {
            let preview = match registry.lookup(name) {
                None => PreviewValue::NotApplicable(NotApplicableReason::UnknownMetric),
                Some(compute) => match compute(rows).filter(|v| v.is_finite()) {
                    Some(v) => PreviewValue::Computed(v),
                    None => PreviewValue::NotApplicable(NotApplicableReason::Undefined),
                },
            };
            MetricComparison {
                name: name.clone(),
                holdout: *value,
                preview,
            }
        })
        .collect();
    MetricsView {
        samples: rows.len(),
        entries,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Confusion {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl Confusion {
    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }
}

pub fn confusion(rows: &[PredictionRow]) -> Confusion {
    let mut out = Confusion::default();
    for row in rows {
        match (row.predicted_label, row.label) {
            (1, 1) => out.true_positive += 1,
            (1, _) => out.false_positive += 1,
            (_, 1) => out.false_negative += 1,
            _ => out.true_negative += 1,
        }
    }
    out
}

pub fn accuracy(rows: &[PredictionRow]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let correct = rows.iter().filter(|r| r.correct).count();
    Some(correct as f64 / rows.len() as f64)
}

pub fn precision(rows: &[PredictionRow]) -> Option<f64> {
    let c = confusion(rows);
    let predicted = c.true_positive + c.false_positive;
    (predicted > 0).then(|| c.true_positive as f64 / predicted as f64)
}

pub fn recall(rows: &[PredictionRow]) -> Option<f64> {
    let c = confusion(rows);
    let actual = c.true_positive + c.false_negative;
    (actual > 0).then(|| c.true_positive as f64 / actual as f64)
}

pub fn f1(rows: &[PredictionRow]) -> Option<f64> {
    let p = precision(rows)?;
    let r = recall(rows)?;
    (p + r > 0.0).then(|| 2.0 * p * r / (p + r))
}

pub fn log_loss(rows: &[PredictionRow]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let mut sum = 0.0_f64;
    for row in rows {
        let p = row.probability.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
        sum += if row.label == 1 { -p.ln() } else { -(1.0 - p).ln() };
    }
    Some(sum / rows.len() as f64)
}

pub fn brier(rows: &[PredictionRow]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let mut sum = 0.0_f64;
    for row in rows {
        sum += (row.probability - f64::from(row.label)).powi(2);
    }
    Some(sum / rows.len() as f64)
}

/// Area under the ROC curve as the Mann-Whitney U statistic; tied
/// probabilities share their average rank.
pub fn roc_auc(rows: &[PredictionRow]) -> Option<f64> {
    let positives = rows.iter().filter(|r| r.label == 1).count();
    let negatives = rows.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|&a, &b| rows[a].probability.total_cmp(&rows[b].probability));

    let mut positive_rank_sum = 0.0_f64;
    let mut start = 0usize;
    while start < order.len() {
        let p = rows[order[start]].probability;
        let mut end = start + 1;
        while end < order.len() && rows[order[end]].probability == p {
            end += 1;
        }
        // 1-based ranks start+1..=end share their mean.
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            if rows[idx].label == 1 {
                positive_rank_sum += avg_rank;
            }
        }
        start = end;
    }

    let n_pos = positives as f64;
    let u = positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0;
    Some(u / (n_pos * negatives as f64))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

/// Reliability table of the preview sample: predicted blue-win probability
/// against the observed blue-win rate, per equal-width bucket.
pub fn calibration_bins(rows: &[PredictionRow], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for row in rows {
        let p = row.probability.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        actual_sum[idx] += f64::from(row.label);
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}
