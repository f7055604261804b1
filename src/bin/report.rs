use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use rift_preview::config::DashboardConfig;
use rift_preview::contributions::{ContributionBreakdown, ContributionStatus, RowDecomposition};
use rift_preview::dashboard::Dashboard;
use rift_preview::export::export_workbook;
use rift_preview::metrics::{MetricsView, NotApplicableReason, PreviewValue};
use rift_preview::ranking::RankedFeature;

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rift_preview=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = DashboardConfig::from_env();
    if let Some(path) = parse_path_arg("--metadata") {
        config.metadata_path = path;
    }
    if let Some(path) = parse_path_arg("--predictions") {
        config.predictions_path = path;
    }
    if let Some(key) = parse_string_arg("--model") {
        config.model_key = Some(key);
    }
    if has_flag("--strict") {
        config.strict = true;
    }
    let row = parse_string_arg("--row");
    let as_json = has_flag("--json");

    let dashboard = Dashboard::load(config).context("failed to load dashboard artifacts")?;

    let decomposed = match row.as_deref() {
        Some(id) => vec![RowDecomposition {
            row_id: id.to_string(),
            result: dashboard.decompose(id),
        }],
        None => dashboard.decompose_all(),
    };

    if as_json {
        let report = json_report(&dashboard, &decomposed);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text_report(&dashboard, &decomposed);
    }

    if let Some(out) = parse_path_arg("--xlsx") {
        let exported = export_workbook(&dashboard, &out)?;
        eprintln!(
            "Wrote {} ({} predictions, {} unreliable)",
            exported.path.display(),
            exported.predictions,
            exported.unreliable_rows
        );
    }

    // A row that was asked for by id and could not be explained is a failure.
    if row.is_some()
        && let Some(Err(err)) = decomposed.first().map(|d| &d.result)
    {
        anyhow::bail!("{err}");
    }
    Ok(())
}

fn print_text_report(dashboard: &Dashboard, decomposed: &[RowDecomposition]) {
    let model = dashboard.model();
    println!("Model: {}", model.label());
    if let Some(feature_set) = &model.feature_set {
        println!("Feature set: {feature_set}");
    }
    println!(
        "Preview rows: {} ({})",
        dashboard.table().len(),
        dashboard.table().source().display()
    );
    if !dashboard.drift_warnings().is_empty() {
        println!(
            "Columns without model weight: {}",
            dashboard.drift_warnings().join(", ")
        );
    }

    println!();
    print_metrics(&dashboard.metrics_view());

    println!();
    match dashboard.ranked_features() {
        Ok(ranked) => print_ranking(&ranked),
        Err(err) => println!("Feature importance unavailable: {err}"),
    }

    for d in decomposed {
        println!();
        match &d.result {
            Ok(breakdown) => print_breakdown(dashboard, breakdown),
            Err(err) => println!("Row {}: UNRELIABLE: {err}", d.row_id),
        }
    }
}

fn print_metrics(view: &MetricsView) {
    println!("Metrics on {} preview rows", view.samples);
    println!(
        "{:<14} {:>9} {:>9} {:>9}",
        "metric", "hold-out", "preview", "diff"
    );
    for entry in &view.entries {
        let preview = match entry.preview {
            PreviewValue::Computed(v) => format!("{v:.4}"),
            PreviewValue::NotApplicable(NotApplicableReason::UnknownMetric) => {
                "n/a (unknown)".to_string()
            }
            PreviewValue::NotApplicable(NotApplicableReason::Undefined) => "n/a".to_string(),
        };
        let diff = entry
            .delta()
            .map(|d| format!("{d:+.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:>9.4} {:>9} {:>9}",
            entry.name, entry.holdout, preview, diff
        );
    }
}

fn print_ranking(ranked: &[RankedFeature]) {
    println!("Feature importance");
    for f in ranked {
        println!(
            "{:>3}. {:<28} {:>+9.4} {:>5.1}%",
            f.rank,
            f.feature,
            f.weight,
            f.share * 100.0
        );
    }
}

fn print_breakdown(dashboard: &Dashboard, breakdown: &ContributionBreakdown) {
    println!(
        "Row {}: score {:+.4} -> {:.1}% blue",
        breakdown.row_id,
        breakdown.total,
        breakdown.probability() * 100.0
    );
    for c in &breakdown.contributions {
        let note = match c.status {
            ContributionStatus::Weighted => "",
            ContributionStatus::Unweighted => "  (unweighted)",
            ContributionStatus::Absent => "  (absent from row)",
        };
        println!("  {:<28} {:>+9.4}{note}", c.feature, c.contribution);
    }
    println!("  {:<28} {:>+9.4}", "bias", breakdown.bias);
    for reason in dashboard.top_reasons(breakdown) {
        println!("  * {reason}");
    }
}

fn json_report(dashboard: &Dashboard, decomposed: &[RowDecomposition]) -> Value {
    let ranking = match dashboard.ranked_features() {
        Ok(ranked) => json!(ranked),
        Err(err) => json!({ "error": err.to_string() }),
    };
    let rows: Vec<Value> = decomposed
        .iter()
        .map(|d| match &d.result {
            Ok(breakdown) => json!({
                "row_id": d.row_id,
                "reliable": true,
                "breakdown": breakdown,
                "reasons": dashboard.top_reasons(breakdown),
            }),
            Err(err) => json!({
                "row_id": d.row_id,
                "reliable": false,
                "error": err.to_string(),
            }),
        })
        .collect();
    json!({
        "model": dashboard.model(),
        "loaded_at": dashboard.loaded_at().to_rfc3339(),
        "drift": dashboard.drift_warnings(),
        "metrics": dashboard.metrics_view(),
        "ranking": ranking,
        "rows": rows,
    })
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    parse_string_arg(name).map(PathBuf::from)
}

fn parse_string_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}=")) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|a| a == flag)
}
