use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::EmptyModelError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankOptions {
    pub hide_zero_weight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A higher value pushes the model towards a blue-side win.
    TowardsWin,
    TowardsLoss,
    Neutral,
}

impl Direction {
    pub fn of(weight: f64) -> Self {
        if weight > 0.0 {
            Direction::TowardsWin
        } else if weight < 0.0 {
            Direction::TowardsLoss
        } else {
            Direction::Neutral
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedFeature {
    pub feature: String,
    pub weight: f64,
    /// 1-based position in the ranking.
    pub rank: usize,
    /// |weight| over the summed |weight| of the whole model.
    pub share: f64,
    pub direction: Direction,
}

/// Order features by absolute weight, largest first, ties by name.
pub fn rank_features(
    model_name: &str,
    weights: &BTreeMap<String, f64>,
    options: RankOptions,
) -> Result<Vec<RankedFeature>, EmptyModelError> {
    if weights.is_empty() {
        return Err(EmptyModelError {
            model: model_name.to_string(),
        });
    }

    let total: f64 = weights.values().map(|w| w.abs()).sum();
    let mut entries: Vec<(&String, f64)> = weights
        .iter()
        .map(|(name, w)| (name, *w))
        .filter(|(_, w)| !(options.hide_zero_weight && *w == 0.0))
        .collect();
    entries.sort_by(|(na, wa), (nb, wb)| wb.abs().total_cmp(&wa.abs()).then_with(|| na.cmp(nb)));

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(idx, (name, weight))| RankedFeature {
            feature: name.clone(),
            weight,
            rank: idx + 1,
            share: if total > 0.0 { weight.abs() / total } else { 0.0 },
            direction: Direction::of(weight),
        })
        .collect())
}
