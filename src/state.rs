use std::collections::VecDeque;

use crate::artifacts::{PredictionTable, SortKey};
use crate::contributions::RowDecomposition;
use crate::dashboard::Dashboard;
use crate::error::EmptyModelError;
use crate::metrics::{CalibrationBin, Confusion, MetricsView};
use crate::ranking::RankedFeature;

const MAX_LOGS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Overview,
    Predictions,
    Breakdown,
}

/// Everything the terminal dashboard draws, derived from one [`Dashboard`].
#[derive(Debug, Clone)]
pub struct AppState {
    pub screen: Screen,
    pub sort: SortKey,
    pub descending: bool,
    /// Position in `order`, not in the table.
    pub selected: usize,
    pub order: Vec<usize>,
    pub model_label: String,
    pub metrics: MetricsView,
    pub ranking: Result<Vec<RankedFeature>, EmptyModelError>,
    pub decomposed: Vec<RowDecomposition>,
    pub confusion: Confusion,
    pub calibration: Vec<CalibrationBin>,
    pub drift: Vec<String>,
    pub top_reasons: usize,
    pub logs: VecDeque<String>,
    pub help_overlay: bool,
    pub breakdown_scroll: u16,
}

impl AppState {
    pub fn new(dashboard: &Dashboard) -> Self {
        let mut state = Self {
            screen: Screen::Overview,
            sort: SortKey::Position,
            descending: false,
            selected: 0,
            order: Vec::new(),
            model_label: String::new(),
            metrics: MetricsView {
                samples: 0,
                entries: Vec::new(),
            },
            ranking: Ok(Vec::new()),
            decomposed: Vec::new(),
            confusion: Confusion::default(),
            calibration: Vec::new(),
            drift: Vec::new(),
            top_reasons: dashboard.config().top_reasons,
            logs: VecDeque::new(),
            help_overlay: false,
            breakdown_scroll: 0,
        };
        state.refresh(dashboard);
        state
    }

    /// Recompute every view from `dashboard`, keeping the selected row when it
    /// still exists.
    pub fn refresh(&mut self, dashboard: &Dashboard) {
        let selected_id = self
            .selected_position()
            .and_then(|pos| self.decomposed.get(pos))
            .map(|d| d.row_id.clone());

        let table = dashboard.table();
        self.model_label = dashboard.model().label();
        self.metrics = dashboard.metrics_view();
        self.ranking = dashboard.ranked_features();
        self.decomposed = dashboard.decompose_all();
        self.confusion = dashboard.confusion();
        self.calibration = dashboard.calibration();
        self.drift = dashboard.drift_warnings().to_vec();
        self.top_reasons = dashboard.config().top_reasons;
        if let SortKey::Feature(col) = self.sort
            && col >= table.feature_columns().len()
        {
            self.sort = SortKey::Position;
        }
        self.order = table.sorted_order(self.sort, self.descending);
        self.select_row_id(table, selected_id.as_deref());

        self.push_log(format!(
            "[INFO] Loaded {} with {} preview rows",
            self.model_label,
            table.len()
        ));
        if let Err(err) = &self.ranking {
            self.push_log(format!("[WARN] {err}"));
        }
        if !self.drift.is_empty() {
            self.push_log(format!(
                "[WARN] Columns without model weight: {}",
                self.drift.join(", ")
            ));
        }
        let unreliable = self.decomposed.iter().filter(|d| !d.is_reliable()).count();
        if unreliable > 0 {
            self.push_log(format!(
                "[WARN] {unreliable} row(s) failed contribution reconciliation"
            ));
        }
    }

    pub fn cycle_sort(&mut self, table: &PredictionTable) {
        let features = table.feature_columns().len();
        self.sort = match self.sort {
            SortKey::Position => SortKey::Probability,
            SortKey::Probability => SortKey::Id,
            SortKey::Id => SortKey::Label,
            SortKey::Label => SortKey::Correct,
            SortKey::Correct if features > 0 => SortKey::Feature(0),
            SortKey::Feature(col) if col + 1 < features => SortKey::Feature(col + 1),
            _ => SortKey::Position,
        };
        self.resort(table);
    }

    pub fn toggle_order(&mut self, table: &PredictionTable) {
        self.descending = !self.descending;
        self.resort(table);
    }

    fn resort(&mut self, table: &PredictionTable) {
        let selected_id = self
            .selected_position()
            .and_then(|pos| table.rows().get(pos))
            .map(|row| row.id.clone());
        self.order = table.sorted_order(self.sort, self.descending);
        self.select_row_id(table, selected_id.as_deref());
    }

    fn select_row_id(&mut self, table: &PredictionTable, id: Option<&str>) {
        self.selected = id
            .and_then(|id| table.position(id))
            .and_then(|pos| self.order.iter().position(|p| *p == pos))
            .unwrap_or(0);
        self.breakdown_scroll = 0;
    }

    pub fn sort_label(&self, table: &PredictionTable) -> String {
        let name = match self.sort {
            SortKey::Position => "preview order".to_string(),
            SortKey::Id => "row id".to_string(),
            SortKey::Probability => "probability".to_string(),
            SortKey::Label => "outcome".to_string(),
            SortKey::Correct => "correct".to_string(),
            SortKey::Feature(col) => table
                .feature_columns()
                .get(col)
                .cloned()
                .unwrap_or_else(|| "feature".to_string()),
        };
        let arrow = if self.descending { "desc" } else { "asc" };
        format!("{name} {arrow}")
    }

    pub fn select_next(&mut self) {
        let total = self.order.len();
        if total == 0 {
            self.selected = 0;
            return;
        }
        self.selected = (self.selected + 1) % total;
        self.breakdown_scroll = 0;
    }

    pub fn select_prev(&mut self) {
        let total = self.order.len();
        if total == 0 {
            self.selected = 0;
            return;
        }
        if self.selected == 0 {
            self.selected = total - 1;
        } else {
            self.selected -= 1;
        }
        self.breakdown_scroll = 0;
    }

    /// Table position of the highlighted row.
    pub fn selected_position(&self) -> Option<usize> {
        self.order.get(self.selected).copied()
    }

    pub fn selected_decomposition(&self) -> Option<&RowDecomposition> {
        self.selected_position()
            .and_then(|pos| self.decomposed.get(pos))
    }

    pub fn scroll_breakdown_down(&mut self) {
        self.breakdown_scroll = self.breakdown_scroll.saturating_add(1);
    }

    pub fn scroll_breakdown_up(&mut self) {
        self.breakdown_scroll = self.breakdown_scroll.saturating_sub(1);
    }

    pub fn push_log(&mut self, msg: impl Into<String>) {
        self.logs.push_back(msg.into());
        while self.logs.len() > MAX_LOGS {
            self.logs.pop_front();
        }
    }
}
