use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::artifacts::{ModelMetadata, PredictionRow, PredictionTable};
use crate::error::{ContributionMismatchError, DecomposeError, EmptyModelError, MismatchSource};

pub const DEFAULT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecomposeOptions {
    /// Allowed gap between contributions + bias and the stored raw score.
    pub epsilon: f64,
    /// When set, sigmoid(total) must also land this close to the stored
    /// probability.
    pub probability_tolerance: Option<f64>,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            probability_tolerance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Weighted,
    /// Present in the row, missing from the model weights.
    Unweighted,
    /// Weighted by the model, missing from the row.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature: String,
    /// Value after any standardization, i.e. the number the weight multiplies.
    pub value: Option<f64>,
    pub weight: Option<f64>,
    pub contribution: f64,
    pub status: ContributionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributionBreakdown {
    pub row_id: String,
    pub contributions: Vec<FeatureContribution>,
    pub bias: f64,
    pub total: f64,
    pub stored_score: Option<f64>,
    pub epsilon: f64,
}

impl ContributionBreakdown {
    pub fn probability(&self) -> f64 {
        sigmoid(self.total)
    }

    pub fn has_drift(&self) -> bool {
        self.contributions
            .iter()
            .any(|c| c.status != ContributionStatus::Weighted)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &FeatureContribution> {
        self.contributions
            .iter()
            .filter(|c| c.status != ContributionStatus::Weighted)
    }
}

/// Linear attribution of one row's score: encoded value x weight per model
/// weight, plus the model intercept as bias.
pub fn decompose_row(
    row: &PredictionRow,
    model: &ModelMetadata,
    options: DecomposeOptions,
) -> Result<ContributionBreakdown, DecomposeError> {
    if model.weights.is_empty() {
        return Err(DecomposeError::EmptyModel(EmptyModelError {
            model: model.model_name.clone(),
        }));
    }

    let mut contributions = Vec::with_capacity(model.weights.len() + row.feature_names().len());
    for (name, weight) in &model.weights {
        let entry = match row.feature(model.column_of(name)) {
            Some(raw) => {
                let value = model.encode(name, raw);
                FeatureContribution {
                    feature: name.clone(),
                    value: Some(value),
                    weight: Some(*weight),
                    contribution: value * weight,
                    status: ContributionStatus::Weighted,
                }
            }
            None => FeatureContribution {
                feature: name.clone(),
                value: None,
                weight: Some(*weight),
                contribution: 0.0,
                status: ContributionStatus::Absent,
            },
        };
        contributions.push(entry);
    }
    for (name, raw) in row.features() {
        if !model.covers(name) {
            contributions.push(FeatureContribution {
                feature: name.to_string(),
                value: Some(raw),
                weight: None,
                contribution: 0.0,
                status: ContributionStatus::Unweighted,
            });
        }
    }

    // Summed in weight order before sorting so the total does not depend on
    // the display order.
    let bias = model.bias();
    let total = contributions.iter().map(|c| c.contribution).sum::<f64>() + bias;

    contributions.sort_by(|a, b| {
        b.contribution
            .abs()
            .total_cmp(&a.contribution.abs())
            .then_with(|| a.feature.cmp(&b.feature))
    });

    if let Some(stored) = row.raw_score
        && (total - stored).abs() > options.epsilon
    {
        return Err(mismatch(row, total, stored, options.epsilon, MismatchSource::RawScore));
    }
    if let Some(tolerance) = options.probability_tolerance
        && (sigmoid(total) - row.probability).abs() > tolerance
    {
        return Err(mismatch(
            row,
            sigmoid(total),
            row.probability,
            tolerance,
            MismatchSource::Probability,
        ));
    }

    Ok(ContributionBreakdown {
        row_id: row.id.clone(),
        contributions,
        bias,
        total,
        stored_score: row.raw_score,
        epsilon: options.epsilon,
    })
}

fn mismatch(
    row: &PredictionRow,
    computed: f64,
    stored: f64,
    epsilon: f64,
    against: MismatchSource,
) -> DecomposeError {
    warn!(
        row = %row.id,
        computed,
        stored,
        %against,
        "contribution sum does not reconcile"
    );
    DecomposeError::Mismatch(ContributionMismatchError {
        row_id: row.id.clone(),
        computed,
        stored,
        epsilon,
        against,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowDecomposition {
    pub row_id: String,
    pub result: Result<ContributionBreakdown, DecomposeError>,
}

impl RowDecomposition {
    pub fn is_reliable(&self) -> bool {
        self.result.is_ok()
    }
}

/// Decompose every row in parallel. Results come back in table order and a
/// failing row never hides the others.
pub fn decompose_all(
    table: &PredictionTable,
    model: &ModelMetadata,
    options: DecomposeOptions,
) -> Vec<RowDecomposition> {
    table
        .rows()
        .par_iter()
        .map(|row| RowDecomposition {
            row_id: row.id.clone(),
            result: decompose_row(row, model, options),
        })
        .collect()
}

/// Plain-language lines for the `k` largest weighted contributions.
pub fn top_reasons(breakdown: &ContributionBreakdown, k: usize) -> Vec<String> {
    breakdown
        .contributions
        .iter()
        .filter(|c| c.status == ContributionStatus::Weighted && c.contribution != 0.0)
        .take(k)
        .map(|c| {
            let side = if c.contribution > 0.0 {
                "towards a blue win"
            } else {
                "towards a red win"
            };
            format!(
                "{} pushed the prediction {side} ({:+.2})",
                humanize_feature(&c.feature),
                c.contribution
            )
        })
        .collect()
}

/// `gold_diff_15` -> `Gold diff 15`; transformer prefixes like `num__` are
/// dropped and one-hot levels read `First dragon (True)`.
pub fn humanize_feature(name: &str) -> String {
    if let Some((feature, level)) = name.split_once('=') {
        return format!("{} ({level})", humanize_feature(feature));
    }
    let base = name.rsplit("__").next().unwrap_or(name);
    let spaced = base.replace('_', " ");
    let mut chars = spaced.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => name.to_string(),
    }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(-800.0) >= 0.0);
        assert!(sigmoid(800.0) <= 1.0);
        assert!((sigmoid(2.0) + sigmoid(-2.0) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn feature_names_read_naturally() {
        assert_eq!(humanize_feature("gold_diff_15"), "Gold diff 15");
        assert_eq!(humanize_feature("cat__first_dragon_True"), "First dragon True");
        assert_eq!(humanize_feature("first_dragon=True"), "First dragon (True)");
        assert_eq!(humanize_feature(""), "");
    }
}
