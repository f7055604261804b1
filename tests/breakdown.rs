use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rift_preview::artifacts::{
    ModelMetadata, PredictionRow, PredictionTable, TableSchema, load_metadata, load_predictions,
};
use rift_preview::contributions::{
    ContributionStatus, DecomposeOptions, decompose_all, decompose_row, top_reasons,
};
use rift_preview::error::{DecomposeError, MismatchSource};
use rift_preview::ranking::{RankOptions, rank_features};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn model(weights: &[(&str, f64)], intercept: f64) -> ModelMetadata {
    ModelMetadata {
        model_name: "test_model".to_string(),
        model_version: None,
        feature_set: None,
        holdout_metrics: vec![("accuracy".to_string(), 0.72)],
        weights: weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        terms: BTreeMap::new(),
        intercept: Some(intercept),
        standardization: BTreeMap::new(),
    }
}

fn features(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn scenario_ranking_and_breakdown() {
    let meta = load_metadata(&fixture("model_meta.json")).unwrap();
    let table = load_predictions(&fixture("scenario.csv"), &TableSchema::default(), 0.5).unwrap();

    let ranked = rank_features(&meta.model_name, &meta.weights, RankOptions::default()).unwrap();
    let summary: Vec<(&str, f64, usize)> = ranked
        .iter()
        .map(|r| (r.feature.as_str(), r.weight, r.rank))
        .collect();
    assert_eq!(summary, [("gold_diff", 0.8, 1), ("kills_diff", 0.3, 2)]);

    let row = table.get("1").unwrap();
    let breakdown = decompose_row(row, &meta, DecomposeOptions::default()).unwrap();
    assert_eq!(breakdown.contributions.len(), 2);
    assert_eq!(breakdown.contributions[0].feature, "gold_diff");
    assert!((breakdown.contributions[0].contribution - 1.6).abs() < 1e-9);
    assert_eq!(breakdown.contributions[1].feature, "kills_diff");
    assert!((breakdown.contributions[1].contribution - 0.3).abs() < 1e-9);
    assert!((breakdown.bias - 0.1).abs() < 1e-12);
    assert!((breakdown.total - 2.0).abs() < 1e-9);
    assert!(!breakdown.has_drift());
}

#[test]
fn unweighted_column_is_flagged_not_fatal() {
    let meta = load_metadata(&fixture("model_meta.json")).unwrap();
    let table = load_predictions(&fixture("drift.csv"), &TableSchema::default(), 0.5).unwrap();

    let breakdown = decompose_row(table.get("7").unwrap(), &meta, DecomposeOptions::default())
        .unwrap();
    let jungle = breakdown
        .contributions
        .iter()
        .find(|c| c.feature == "jungle_cs")
        .unwrap();
    assert_eq!(jungle.contribution, 0.0);
    assert_eq!(jungle.status, ContributionStatus::Unweighted);
    assert_eq!(jungle.weight, None);
    assert_eq!(breakdown.flagged().count(), 1);
    assert!((breakdown.total - 0.9).abs() < 1e-9);
}

#[test]
fn weighted_feature_missing_from_row_is_absent() {
    let meta = model(&[("gold_diff", 0.8), ("dragons", 0.5)], 0.0);
    let row = PredictionRow::new("9", features(&[("gold_diff", 1.0)]), 0.7, 1, None, 0.5);
    let breakdown = decompose_row(&row, &meta, DecomposeOptions::default()).unwrap();
    let dragons = breakdown
        .contributions
        .iter()
        .find(|c| c.feature == "dragons")
        .unwrap();
    assert_eq!(dragons.status, ContributionStatus::Absent);
    assert_eq!(dragons.value, None);
    assert_eq!(dragons.contribution, 0.0);
}

#[test]
fn stored_score_disagreement_raises_mismatch() {
    let meta = model(&[("gold_diff", 0.8), ("kills_diff", 0.3)], 0.1);
    let row = PredictionRow::new(
        "2",
        features(&[("gold_diff", 1.0), ("kills_diff", 1.0)]),
        0.77,
        1,
        Some(5.0),
        0.5,
    );
    let err = decompose_row(&row, &meta, DecomposeOptions::default()).unwrap_err();
    match err {
        DecomposeError::Mismatch(m) => {
            assert_eq!(m.row_id, "2");
            assert_eq!(m.stored, 5.0);
            assert!((m.computed - 1.2).abs() < 1e-9);
            assert_eq!(m.against, MismatchSource::RawScore);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn probability_check_is_opt_in() {
    let meta = model(&[("gold_diff", 0.8), ("kills_diff", 0.3)], 0.1);
    let row = PredictionRow::new(
        "1",
        features(&[("gold_diff", 2.0), ("kills_diff", 1.0)]),
        0.9,
        1,
        None,
        0.5,
    );
    assert!(decompose_row(&row, &meta, DecomposeOptions::default()).is_ok());

    // sigmoid(2.0) is about 0.881, more than 0.01 away from 0.9.
    let strict = DecomposeOptions {
        probability_tolerance: Some(0.01),
        ..DecomposeOptions::default()
    };
    let err = decompose_row(&row, &meta, strict).unwrap_err();
    assert!(matches!(
        err,
        DecomposeError::Mismatch(ref m) if m.against == MismatchSource::Probability
    ));
}

#[test]
fn empty_model_cannot_be_decomposed() {
    let meta = model(&[], 0.0);
    let row = PredictionRow::new("1", features(&[("gold_diff", 1.0)]), 0.6, 1, None, 0.5);
    let err = decompose_row(&row, &meta, DecomposeOptions::default()).unwrap_err();
    assert!(matches!(err, DecomposeError::EmptyModel(_)));
}

#[test]
fn standardized_features_use_scaled_values() {
    let meta = load_metadata(&fixture("meta_standardized.json")).unwrap();
    let table =
        load_predictions(&fixture("standardized.csv"), &TableSchema::default(), 0.5).unwrap();
    for d in decompose_all(&table, &meta, DecomposeOptions::default()) {
        assert!(d.is_reliable(), "row {} failed: {:?}", d.row_id, d.result);
    }
    let breakdown =
        decompose_row(table.get("2").unwrap(), &meta, DecomposeOptions::default()).unwrap();
    let gold = &breakdown.contributions[0];
    assert_eq!(gold.feature, "gold_diff");
    assert_eq!(gold.value, Some(-1.0));
    assert!((gold.contribution + 0.8).abs() < 1e-9);
}

#[test]
fn exported_pipeline_weights_explain_their_own_scores() {
    let meta = load_metadata(&fixture("models_config.json")).unwrap();
    let table =
        load_predictions(&fixture("logistic_preview.csv"), &TableSchema::default(), 0.5).unwrap();
    for d in decompose_all(&table, &meta, DecomposeOptions::default()) {
        assert!(d.is_reliable(), "row {} failed: {:?}", d.row_id, d.result);
    }

    let breakdown =
        decompose_row(table.get("1").unwrap(), &meta, DecomposeOptions::default()).unwrap();
    assert!(!breakdown.has_drift());
    assert!((breakdown.total - 1.375).abs() < 1e-9);
    let by_name = |name: &str| {
        breakdown
            .contributions
            .iter()
            .find(|c| c.feature == name)
            .unwrap()
    };

    let gold = by_name("gold_diff_15");
    assert_eq!(gold.value, Some(1.0));
    assert!((gold.contribution - 1.2).abs() < 1e-9);
    let cs = by_name("cs_diff_15");
    assert_eq!(cs.value, Some(0.5));
    assert!((cs.contribution - 0.175).abs() < 1e-9);

    assert_eq!(by_name("first_dragon=True").value, Some(1.0));
    assert!((by_name("first_dragon=True").contribution - 0.2).abs() < 1e-12);
    assert_eq!(by_name("first_dragon=False").contribution, 0.0);
    assert!((by_name("first_tower=False").contribution + 0.3).abs() < 1e-12);
    assert_eq!(by_name("first_tower=True").value, Some(0.0));

    let second =
        decompose_row(table.get("2").unwrap(), &meta, DecomposeOptions::default()).unwrap();
    assert!((second.total + 1.275).abs() < 1e-9);
}

#[test]
fn one_bad_row_does_not_hide_the_others() {
    let meta = load_metadata(&fixture("model_meta.json")).unwrap();
    let table = load_predictions(&fixture("mismatch.csv"), &TableSchema::default(), 0.5).unwrap();
    let results = decompose_all(&table, &meta, DecomposeOptions::default());

    let ids: Vec<&str> = results.iter().map(|d| d.row_id.as_str()).collect();
    assert_eq!(ids, ["1", "2", "3"]);
    let reliable: Vec<bool> = results.iter().map(|d| d.is_reliable()).collect();
    assert_eq!(reliable, [true, false, true]);
}

#[test]
fn reasons_follow_contribution_order() {
    let meta = model(&[("gold_diff", 0.8), ("tower_diff", -0.5), ("kills_diff", 0.3)], 0.0);
    let row = PredictionRow::new(
        "4",
        features(&[("gold_diff", 2.0), ("tower_diff", 2.0), ("kills_diff", 0.0)]),
        0.65,
        1,
        None,
        0.5,
    );
    let breakdown = decompose_row(&row, &meta, DecomposeOptions::default()).unwrap();
    let reasons = top_reasons(&breakdown, 3);
    assert_eq!(reasons.len(), 2);
    assert_eq!(
        reasons[0],
        "Gold diff pushed the prediction towards a blue win (+1.60)"
    );
    assert_eq!(
        reasons[1],
        "Tower diff pushed the prediction towards a red win (-1.00)"
    );
}

#[test]
fn contributions_always_reconcile_with_their_own_score() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for case in 0..200 {
        let n = rng.gen_range(1..12);
        let weights: Vec<(String, f64)> = (0..n)
            .map(|i| (format!("f{i}"), rng.gen_range(-3.0..3.0)))
            .collect();
        let intercept = rng.gen_range(-1.0..1.0);
        let meta = ModelMetadata {
            weights: weights.iter().cloned().collect(),
            intercept: Some(intercept),
            ..model(&[], 0.0)
        };
        let values: Vec<(String, f64)> = weights
            .iter()
            .map(|(name, _)| (name.clone(), rng.gen_range(-50.0..50.0)))
            .collect();
        let score: f64 = weights
            .iter()
            .zip(&values)
            .map(|((_, w), (_, x))| w * x)
            .sum::<f64>()
            + intercept;

        let row = PredictionRow::new(case.to_string(), values, 0.5, 1, Some(score), 0.5);
        let breakdown = decompose_row(&row, &meta, DecomposeOptions::default()).unwrap();
        let sum: f64 = breakdown.contributions.iter().map(|c| c.contribution).sum();
        assert!((sum + breakdown.bias - score).abs() < 1e-6, "case {case}");

        let ranked = rank_features("random", &meta.weights, RankOptions::default()).unwrap();
        assert_eq!(ranked.len(), n);
        for pair in ranked.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(
                a.weight.abs() > b.weight.abs()
                    || (a.weight.abs() == b.weight.abs() && a.feature < b.feature)
            );
        }
    }
}

#[test]
fn table_built_in_memory_decomposes_like_a_loaded_one() {
    let meta = load_metadata(&fixture("model_meta.json")).unwrap();
    let loaded = load_predictions(&fixture("scenario.csv"), &TableSchema::default(), 0.5).unwrap();
    let built = PredictionTable::from_rows(
        "memory",
        vec![PredictionRow::new(
            "1",
            features(&[("gold_diff", 2.0), ("kills_diff", 1.0)]),
            0.9,
            1,
            None,
            0.5,
        )],
    )
    .unwrap();
    let a = decompose_all(&loaded, &meta, DecomposeOptions::default());
    let b = decompose_all(&built, &meta, DecomposeOptions::default());
    assert_eq!(a, b);
}
