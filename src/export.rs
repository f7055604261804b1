use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::contributions::{ContributionStatus, RowDecomposition};
use crate::dashboard::Dashboard;
use crate::error::DecomposeError;
use crate::metrics::{MetricsView, NotApplicableReason, PreviewValue};
use crate::ranking::RankedFeature;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        value.map(Cell::Number).unwrap_or(Cell::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub metrics: usize,
    pub features: usize,
    pub predictions: usize,
    pub contributions: usize,
    pub unreliable_rows: usize,
}

/// `<export_dir>/rift_preview_<UTC timestamp>.xlsx`
pub fn default_export_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("rift_preview_{stamp}.xlsx"))
}

pub fn export_workbook(dashboard: &Dashboard, path: &Path) -> Result<ExportReport> {
    let metrics = metrics_rows(&dashboard.metrics_view());
    let features = match dashboard.ranked_features() {
        Ok(ranked) => feature_rows(&ranked),
        Err(err) => vec![vec![Cell::from("Error")], vec![Cell::from(err.to_string())]],
    };
    let predictions = prediction_rows(dashboard);
    let decomposed = dashboard.decompose_all();
    let unreliable_rows = decomposed.iter().filter(|d| !d.is_reliable()).count();
    let contributions = contribution_rows(&decomposed);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create export dir {}", parent.display()))?;
    }

    let mut workbook = Workbook::new();
    for (name, rows) in [
        ("Metrics", &metrics),
        ("Features", &features),
        ("Predictions", &predictions),
        ("Contributions", &contributions),
    ] {
        let sheet = workbook.add_worksheet();
        sheet.set_name(name)?;
        write_rows(sheet, rows)?;
    }
    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;

    Ok(ExportReport {
        path: path.to_path_buf(),
        metrics: metrics.len().saturating_sub(1),
        features: features.len().saturating_sub(1),
        predictions: predictions.len().saturating_sub(1),
        contributions: contributions.len().saturating_sub(1),
        unreliable_rows,
    })
}

pub fn metrics_rows(view: &MetricsView) -> Vec<Vec<Cell>> {
    let mut rows = vec![vec![
        Cell::from("Metric"),
        Cell::from("Hold-out"),
        Cell::from("Preview"),
        Cell::from("Difference"),
        Cell::from("Note"),
    ]];
    for entry in &view.entries {
        let note = match entry.preview {
            PreviewValue::Computed(_) => "",
            PreviewValue::NotApplicable(NotApplicableReason::UnknownMetric) => {
                "not applicable: no preview computation"
            }
            PreviewValue::NotApplicable(NotApplicableReason::Undefined) => {
                "not applicable: undefined on preview sample"
            }
        };
        rows.push(vec![
            Cell::from(entry.name.as_str()),
            Cell::from(entry.holdout),
            Cell::from(entry.preview.value()),
            Cell::from(entry.delta()),
            Cell::from(note),
        ]);
    }
    rows
}

pub fn feature_rows(ranked: &[RankedFeature]) -> Vec<Vec<Cell>> {
    let mut rows = vec![vec![
        Cell::from("Rank"),
        Cell::from("Feature"),
        Cell::from("Weight"),
        Cell::from("Share"),
        Cell::from("Direction"),
    ]];
    for f in ranked {
        rows.push(vec![
            Cell::from(f.rank as f64),
            Cell::from(f.feature.as_str()),
            Cell::from(f.weight),
            Cell::from(f.share),
            Cell::from(format!("{:?}", f.direction)),
        ]);
    }
    rows
}

fn prediction_rows(dashboard: &Dashboard) -> Vec<Vec<Cell>> {
    let table = dashboard.table();
    let mut header = vec![
        Cell::from("Row"),
        Cell::from("Probability"),
        Cell::from("Label"),
        Cell::from("Predicted"),
        Cell::from("Correct"),
    ];
    header.extend(table.feature_columns().iter().map(|c| Cell::from(c.as_str())));

    let mut rows = vec![header];
    for row in table.rows() {
        let mut out = vec![
            Cell::from(row.id.as_str()),
            Cell::from(row.probability),
            Cell::from(f64::from(row.label)),
            Cell::from(f64::from(row.predicted_label)),
            Cell::from(if row.correct { "yes" } else { "no" }),
        ];
        out.extend(
            table
                .feature_columns()
                .iter()
                .map(|c| Cell::from(row.feature(c))),
        );
        rows.push(out);
    }
    rows
}

pub fn contribution_rows(decomposed: &[RowDecomposition]) -> Vec<Vec<Cell>> {
    let mut rows = vec![vec![
        Cell::from("Row"),
        Cell::from("Feature"),
        Cell::from("Value"),
        Cell::from("Weight"),
        Cell::from("Contribution"),
        Cell::from("Flag"),
    ]];
    for d in decomposed {
        match &d.result {
            Ok(breakdown) => {
                for c in &breakdown.contributions {
                    let flag = match c.status {
                        ContributionStatus::Weighted => "",
                        ContributionStatus::Unweighted => "unweighted",
                        ContributionStatus::Absent => "absent from row",
                    };
                    rows.push(vec![
                        Cell::from(d.row_id.as_str()),
                        Cell::from(c.feature.as_str()),
                        Cell::from(c.value),
                        Cell::from(c.weight),
                        Cell::from(c.contribution),
                        Cell::from(flag),
                    ]);
                }
                rows.push(vec![
                    Cell::from(d.row_id.as_str()),
                    Cell::from("(bias)"),
                    Cell::Empty,
                    Cell::Empty,
                    Cell::from(breakdown.bias),
                    Cell::Empty,
                ]);
            }
            Err(err) => {
                let flag = match err {
                    DecomposeError::Mismatch(_) => format!("unreliable: {err}"),
                    other => other.to_string(),
                };
                rows.push(vec![
                    Cell::from(d.row_id.as_str()),
                    Cell::Empty,
                    Cell::Empty,
                    Cell::Empty,
                    Cell::Empty,
                    Cell::from(flag),
                ]);
            }
        }
    }
    rows
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<Cell>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            let (r, c) = (row_idx as u32, col_idx as u16);
            match value {
                Cell::Text(s) => worksheet.write_string(r, c, s).map(|_| ()),
                Cell::Number(n) => worksheet.write_number(r, c, *n).map(|_| ()),
                Cell::Empty => Ok(()),
            }
            .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}
