use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parquet::data_type::{BoolType, DoubleType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;

use rift_preview::artifacts::{
    Encoding, FeatureTerm, PredictionRow, PredictionTable, SortKey, TableSchema, load_metadata,
    load_model_metadata, load_predictions,
};
use rift_preview::error::ArtifactError;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rift_preview_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

enum Column {
    Long(Vec<i64>),
    Double(Vec<f64>),
    NullableDouble(Vec<Option<f64>>),
    Bool(Vec<bool>),
}

impl Column {
    fn schema_type(&self) -> &'static str {
        match self {
            Column::Long(_) => "REQUIRED INT64",
            Column::Double(_) => "REQUIRED DOUBLE",
            Column::NullableDouble(_) => "OPTIONAL DOUBLE",
            Column::Bool(_) => "REQUIRED BOOLEAN",
        }
    }
}

/// Write `columns` as a single row group.
fn write_parquet(path: &Path, columns: &[(&str, Column)]) {
    let fields: String = columns
        .iter()
        .map(|(name, column)| format!("{} {name}; ", column.schema_type()))
        .collect();
    let schema = Arc::new(parse_message_type(&format!("message preview {{ {fields}}}")).unwrap());
    let props = Arc::new(WriterProperties::builder().build());
    let mut writer = SerializedFileWriter::new(File::create(path).unwrap(), schema, props).unwrap();

    let mut row_group = writer.next_row_group().unwrap();
    for (_, column) in columns {
        let mut out = row_group.next_column().unwrap().unwrap();
        match column {
            Column::Long(values) => {
                out.typed::<Int64Type>().write_batch(values, None, None).unwrap();
            }
            Column::Double(values) => {
                out.typed::<DoubleType>().write_batch(values, None, None).unwrap();
            }
            Column::NullableDouble(values) => {
                let present: Vec<f64> = values.iter().flatten().copied().collect();
                let levels: Vec<i16> = values.iter().map(|v| i16::from(v.is_some())).collect();
                out.typed::<DoubleType>()
                    .write_batch(&present, Some(&levels), None)
                    .unwrap();
            }
            Column::Bool(values) => {
                out.typed::<BoolType>().write_batch(values, None, None).unwrap();
            }
        }
        out.close().unwrap();
    }
    row_group.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn metadata_keeps_metric_order_and_bias() {
    let meta = load_metadata(&fixture("model_meta.json")).unwrap();
    assert_eq!(meta.model_name, "logreg_early15");
    assert_eq!(meta.model_version.as_deref(), Some("2024.06"));
    assert_eq!(meta.label(), "logreg_early15 (2024.06)");
    let names: Vec<&str> = meta.holdout_metrics.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["accuracy", "roc_auc", "calibration_slope"]);
    assert_eq!(meta.weight("gold_diff"), Some(0.8));
    assert_eq!(meta.bias(), 0.1);
}

#[test]
fn coefficient_arrays_match_the_weight_map() {
    let by_map = load_metadata(&fixture("model_meta.json")).unwrap();
    let by_arrays = load_metadata(&fixture("meta_coefficients.json")).unwrap();
    assert_eq!(by_map.weights, by_arrays.weights);
    assert_eq!(by_arrays.intercept, Some(0.1));
    assert_eq!(by_arrays.model_version.as_deref(), Some("v2"));
}

#[test]
fn coefficient_length_mismatch_is_malformed() {
    let err = load_metadata(&fixture("meta_length_mismatch.json")).unwrap_err();
    assert!(matches!(err, ArtifactError::Malformed { .. }), "{err}");
}

#[test]
fn scaler_arrays_become_standardization() {
    let meta = load_metadata(&fixture("meta_standardized.json")).unwrap();
    let s = meta.standardization.get("gold_diff").copied().unwrap();
    assert_eq!(s.mean, 1000.0);
    assert_eq!(s.scale, 500.0);
    assert!(!meta.standardization.contains_key("kills_diff"));
}

#[test]
fn missing_model_name_is_reported_by_field() {
    let err = load_metadata(&fixture("meta_missing_name.json")).unwrap_err();
    match err {
        ArtifactError::MissingField { field, .. } => assert_eq!(field, "model_name"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn text_metric_values_are_rejected() {
    let err = load_metadata(&fixture("meta_text_metric.json")).unwrap_err();
    assert!(err.to_string().contains("metrics.accuracy"), "{err}");
}

#[test]
fn missing_files_are_distinguished() {
    let err = load_metadata(&fixture("no_such_meta.json")).unwrap_err();
    assert!(matches!(err, ArtifactError::Missing { .. }));
}

#[test]
fn missing_probability_column_is_named() {
    let err = load_predictions(
        &fixture("missing_probability.csv"),
        &TableSchema::default(),
        0.5,
    )
    .unwrap_err();
    match &err {
        ArtifactError::MissingColumn { column, .. } => assert_eq!(column, "pred_proba"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("pred_proba"));
}

#[test]
fn unparseable_feature_names_row_and_column() {
    let err =
        load_predictions(&fixture("bad_value.csv"), &TableSchema::default(), 0.5).unwrap_err();
    match err {
        ArtifactError::InvalidValue {
            row, column, value, ..
        } => {
            assert_eq!(row, 2);
            assert_eq!(column, "gold_diff");
            assert_eq!(value, "lots");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn duplicate_row_ids_are_rejected() {
    let err = load_predictions(&fixture("duplicate_ids.csv"), &TableSchema::default(), 0.5)
        .unwrap_err();
    assert!(matches!(err, ArtifactError::DuplicateRowId { ref id, row: 2, .. } if id == "1"));
}

#[test]
fn unknown_extension_is_unsupported() {
    let err = load_predictions(&fixture("model_meta.json"), &TableSchema::default(), 0.5)
        .unwrap_err();
    assert!(matches!(err, ArtifactError::UnsupportedFormat { .. }));
}

#[test]
fn table_discovers_features_and_derives_outcomes() {
    let table = load_predictions(
        &fixture("preview_predictions.csv"),
        &TableSchema::default(),
        0.5,
    )
    .unwrap();
    assert_eq!(table.len(), 5);
    assert_eq!(table.feature_columns(), ["gold_diff", "kills_diff"]);

    let row = table.get("3").unwrap();
    assert_eq!(row.raw_score, Some(0.2));
    assert_eq!(row.predicted_label, 1);
    assert_eq!(row.label, 0);
    assert!(!row.correct);
    assert_eq!(row.feature("kills_diff"), Some(-1.0));
    assert_eq!(row.feature("raw_score"), None);
}

#[test]
fn score_column_is_optional() {
    let table = load_predictions(&fixture("scenario.csv"), &TableSchema::default(), 0.5).unwrap();
    assert_eq!(table.get("1").unwrap().raw_score, None);
}

#[test]
fn display_sort_does_not_reorder_rows() {
    let table = load_predictions(
        &fixture("preview_predictions.csv"),
        &TableSchema::default(),
        0.5,
    )
    .unwrap();
    let before: Vec<String> = table.rows().iter().map(|r| r.id.clone()).collect();

    let order = table.sorted_order(SortKey::Probability, true);
    let ids: Vec<&str> = order.iter().map(|&i| table.rows()[i].id.as_str()).collect();
    assert_eq!(ids, ["1", "4", "3", "5", "2"]);

    let by_gold = table.sorted_order(SortKey::Feature(0), false);
    assert_eq!(table.rows()[by_gold[0]].id, "5");

    let after: Vec<String> = table.rows().iter().map(|r| r.id.clone()).collect();
    assert_eq!(before, after);
}

#[test]
fn ties_keep_preview_order() {
    let rows = vec![
        PredictionRow::new("b", Vec::new(), 0.6, 1, None, 0.5),
        PredictionRow::new("a", Vec::new(), 0.6, 0, None, 0.5),
        PredictionRow::new("c", Vec::new(), 0.2, 0, None, 0.5),
    ];
    let table = PredictionTable::from_rows("memory", rows).unwrap();
    assert_eq!(table.sorted_order(SortKey::Probability, true), [0, 1, 2]);
    assert_eq!(table.sorted_order(SortKey::Id, false), [1, 0, 2]);
    assert_eq!(table.sorted_order(SortKey::Position, true), [2, 1, 0]);
}

#[test]
fn exported_weights_resolve_to_table_columns() {
    let meta = load_metadata(&fixture("models_config.json")).unwrap();
    assert_eq!(meta.model_name, "Logistic Regression (pruned)");
    assert_eq!(meta.intercept, Some(0.05));

    let names: Vec<&str> = meta.weights.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        [
            "cs_diff_15",
            "first_dragon=False",
            "first_dragon=True",
            "first_herald=False",
            "first_herald=True",
            "first_tower=False",
            "first_tower=True",
            "gold_diff_15",
        ]
    );
    assert_eq!(meta.weight("gold_diff_15"), Some(1.2));
    assert_eq!(
        meta.terms.get("first_dragon=True"),
        Some(&FeatureTerm {
            column: "first_dragon".to_string(),
            encoding: Encoding::Indicator { level: 1.0 },
        })
    );
    assert_eq!(meta.column_of("first_tower=False"), "first_tower");
    assert_eq!(meta.column_of("gold_diff_15"), "gold_diff_15");
    assert!(meta.covers("first_herald"));
    assert!(!meta.covers("first_herald=True"));

    let gold = meta.standardization.get("gold_diff_15").copied().unwrap();
    assert_eq!((gold.mean, gold.scale), (100.0, 1900.0));
    assert_eq!(meta.encode("gold_diff_15", 2000.0), 1.0);
    assert_eq!(meta.encode("first_dragon=True", 1.0), 1.0);
    assert_eq!(meta.encode("first_dragon=False", 1.0), 0.0);
}

#[test]
fn model_config_entries_are_selected_by_key() {
    let path = fixture("models_config.json");
    let first = load_metadata(&path).unwrap();
    let by_key = load_model_metadata(&path, Some("logistic_pruned")).unwrap();
    assert_eq!(first, by_key);
    let metrics: Vec<&str> = by_key.holdout_metrics.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(metrics, ["accuracy", "precision", "recall", "f1", "roc_auc"]);

    let forest = load_model_metadata(&path, Some("random_forest_full")).unwrap();
    assert_eq!(forest.model_name, "Random Forest (full)");
    assert!(forest.weights.is_empty());
    assert_eq!(forest.holdout_metrics.len(), 5);
    assert_eq!(forest.holdout_metrics[0], ("accuracy".to_string(), 0.7519));

    match load_model_metadata(&path, Some("xgboost")).unwrap_err() {
        ArtifactError::MissingField { field, .. } => assert_eq!(field, "models.xgboost"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn parquet_tables_read_typed_columns() {
    let dir = scratch_dir("parquet_typed");
    let path = dir.join("preview.parquet");
    write_parquet(
        &path,
        &[
            ("match_id", Column::Long(vec![101, 102, 103])),
            ("gold_diff", Column::Double(vec![1500.0, -250.5, 0.0])),
            ("raw_score", Column::NullableDouble(vec![Some(0.9), None, Some(-0.1)])),
            ("pred_proba", Column::Double(vec![0.71, 0.44, 0.48])),
            ("blue_win", Column::Bool(vec![true, false, true])),
        ],
    );

    let table = load_predictions(&path, &TableSchema::default(), 0.5).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.feature_columns(), ["gold_diff"]);
    let ids: Vec<&str> = table.rows().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["101", "102", "103"]);

    let first = table.get("101").unwrap();
    assert_eq!(first.label, 1);
    assert_eq!(first.raw_score, Some(0.9));
    assert_eq!(first.feature("gold_diff"), Some(1500.0));

    let second = table.get("102").unwrap();
    assert_eq!(second.label, 0);
    assert_eq!(second.raw_score, None);
    assert_eq!(second.feature("gold_diff"), Some(-250.5));
    assert!(second.correct);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn parquet_double_ids_render_as_integers() {
    let dir = scratch_dir("parquet_ids");
    let path = dir.join("preview.parquet");
    write_parquet(
        &path,
        &[
            ("match_id", Column::Double(vec![7.0, 8.0])),
            ("pred_proba", Column::Double(vec![0.6, 0.3])),
            ("blue_win", Column::Bool(vec![true, false])),
        ],
    );

    let table = load_predictions(&path, &TableSchema::default(), 0.5).unwrap();
    assert!(table.get("7").is_some());
    assert!(table.get("8").is_some());
    assert!(table.feature_columns().is_empty());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn parquet_null_feature_names_row_and_column() {
    let dir = scratch_dir("parquet_null");
    let path = dir.join("preview.parquet");
    write_parquet(
        &path,
        &[
            ("match_id", Column::Long(vec![1, 2])),
            ("gold_diff", Column::NullableDouble(vec![Some(10.0), None])),
            ("pred_proba", Column::Double(vec![0.6, 0.3])),
            ("blue_win", Column::Bool(vec![true, false])),
        ],
    );

    match load_predictions(&path, &TableSchema::default(), 0.5).unwrap_err() {
        ArtifactError::InvalidValue { row, column, .. } => {
            assert_eq!(row, 2);
            assert_eq!(column, "gold_diff");
        }
        other => panic!("unexpected error: {other}"),
    }

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn parquet_without_probability_column_is_named() {
    let dir = scratch_dir("parquet_missing");
    let path = dir.join("preview.parquet");
    write_parquet(
        &path,
        &[
            ("match_id", Column::Long(vec![1])),
            ("gold_diff", Column::Double(vec![10.0])),
            ("blue_win", Column::Bool(vec![true])),
        ],
    );

    match load_predictions(&path, &TableSchema::default(), 0.5).unwrap_err() {
        ArtifactError::MissingColumn { column, .. } => assert_eq!(column, "pred_proba"),
        other => panic!("unexpected error: {other}"),
    }

    let _ = fs::remove_dir_all(&dir);
}
