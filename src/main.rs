use std::io;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::prelude::*;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Bar, BarChart, BarGroup, Block, Borders, Clear, Paragraph};

use rift_preview::artifacts::SortKey;
use rift_preview::config::DashboardConfig;
use rift_preview::contributions::{ContributionStatus, humanize_feature, top_reasons};
use rift_preview::dashboard::ArtifactCache;
use rift_preview::error::DecomposeError;
use rift_preview::export::{default_export_path, export_workbook};
use rift_preview::metrics::{NotApplicableReason, PreviewValue};
use rift_preview::state::{AppState, Screen};

struct App {
    cache: ArtifactCache,
    state: AppState,
    should_quit: bool,
}

impl App {
    fn new(cache: ArtifactCache) -> Self {
        let state = AppState::new(cache.dashboard());
        Self {
            cache,
            state,
            should_quit: false,
        }
    }

    fn on_key(&mut self, key: KeyEvent) {
        let table = self.cache.dashboard().table();
        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('1') => self.state.screen = Screen::Overview,
            KeyCode::Char('2') => self.state.screen = Screen::Predictions,
            KeyCode::Char('3') | KeyCode::Enter => self.state.screen = Screen::Breakdown,
            KeyCode::Char('b') | KeyCode::Esc => self.state.screen = Screen::Predictions,
            KeyCode::Char('j') | KeyCode::Down => self.state.select_next(),
            KeyCode::Char('k') | KeyCode::Up => self.state.select_prev(),
            KeyCode::PageDown => self.state.scroll_breakdown_down(),
            KeyCode::PageUp => self.state.scroll_breakdown_up(),
            KeyCode::Char('s') => self.state.cycle_sort(table),
            KeyCode::Char('r') => self.state.toggle_order(table),
            KeyCode::Char('R') => self.reload(),
            KeyCode::Char('x') | KeyCode::Char('X') => self.export(),
            KeyCode::Char('?') => self.state.help_overlay = !self.state.help_overlay,
            _ => {}
        }
    }

    fn reload(&mut self) {
        match self.cache.reload() {
            Ok(true) => self.state.refresh(self.cache.dashboard()),
            Ok(false) => self.state.push_log("[INFO] Artifacts unchanged on disk"),
            Err(err) => self
                .state
                .push_log(format!("[WARN] Reload failed, keeping previous data: {err}")),
        }
    }

    fn export(&mut self) {
        let dashboard = self.cache.dashboard();
        let path = default_export_path(&dashboard.config().export_dir);
        match export_workbook(dashboard, &path) {
            Ok(report) => self.state.push_log(format!(
                "[INFO] Exported {} predictions to {}",
                report.predictions,
                report.path.display()
            )),
            Err(err) => self.state.push_log(format!("[WARN] Export failed: {err:#}")),
        }
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let config = DashboardConfig::from_env();
    // Invalid artifacts stop startup before the terminal is touched.
    let cache = ArtifactCache::open(config).context("failed to load dashboard artifacts")?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = ratatui::Terminal::new(backend)?;

    let mut app = App::new(cache);
    let res = run_app(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("error: {err}");
    }
    Ok(())
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    let tick_rate = Duration::from_millis(250);
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            app.on_key(key);
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn ui(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(1),
            Constraint::Length(5),
            Constraint::Length(1),
        ])
        .split(frame.size());

    let header = Paragraph::new(header_text(app))
        .style(Style::default().add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, chunks[0]);

    match app.state.screen {
        Screen::Overview => render_overview(frame, chunks[1], app),
        Screen::Predictions => render_predictions(frame, chunks[1], app),
        Screen::Breakdown => render_breakdown(frame, chunks[1], app),
    }

    let console = Paragraph::new(console_text(&app.state, chunks[2].height))
        .block(Block::default().title("Console").borders(Borders::ALL));
    frame.render_widget(console, chunks[2]);

    let footer = Paragraph::new(footer_text(app.state.screen))
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(footer, chunks[3]);

    if app.state.help_overlay {
        render_help_overlay(frame, frame.size());
    }
}

fn header_text(app: &App) -> String {
    let dashboard = app.cache.dashboard();
    let screen = match app.state.screen {
        Screen::Overview => "OVERVIEW",
        Screen::Predictions => "PREDICTIONS",
        Screen::Breakdown => "BREAKDOWN",
    };
    format!(
        "RIFT PREVIEW | {screen} | {} | {} rows | loaded {} | {}",
        app.state.model_label,
        dashboard.table().len(),
        dashboard.loaded_at().format("%H:%M:%S UTC"),
        app.cache.fingerprint().short_hex()
    )
}

fn footer_text(screen: Screen) -> &'static str {
    match screen {
        Screen::Overview => {
            "1 Overview | 2 Predictions | 3 Breakdown | R Reload | x Export | ? Help | q Quit"
        }
        Screen::Predictions => {
            "j/k Move | s Sort | r Reverse | Enter Breakdown | \
             R Reload | x Export | ? Help | q Quit"
        }
        Screen::Breakdown => {
            "j/k Row | PgUp/PgDn Scroll | b/Esc Back | 1 Overview | ? Help | q Quit"
        }
    }
}

fn render_overview(frame: &mut Frame, area: Rect, app: &App) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);
    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(6), Constraint::Length(9)])
        .split(columns[0]);

    let metrics = Paragraph::new(metrics_text(&app.state)).block(
        Block::default()
            .title("Hold-out vs preview")
            .borders(Borders::ALL),
    );
    frame.render_widget(metrics, left[0]);

    let sample = Paragraph::new(sample_text(&app.state))
        .block(Block::default().title("Preview sample").borders(Borders::ALL));
    frame.render_widget(sample, left[1]);

    render_ranking(frame, columns[1], &app.state);
}

fn metrics_text(state: &AppState) -> String {
    if state.metrics.entries.is_empty() {
        return "No hold-out metrics in model metadata".to_string();
    }
    let mut lines = vec![format!(
        "{:<12} {:>9} {:>9} {:>8}",
        "Metric", "Hold-out", "Preview", "Diff"
    )];
    for entry in &state.metrics.entries {
        let (preview, diff) = match entry.preview {
            PreviewValue::Computed(v) => (format!("{v:.3}"), format!("{:+.3}", v - entry.holdout)),
            PreviewValue::NotApplicable(NotApplicableReason::UnknownMetric) => {
                ("n/a*".to_string(), "-".to_string())
            }
            PreviewValue::NotApplicable(NotApplicableReason::Undefined) => {
                ("n/a".to_string(), "-".to_string())
            }
        };
        lines.push(format!(
            "{:<12} {:>9.3} {:>9} {:>8}",
            entry.name, entry.holdout, preview, diff
        ));
    }
    if state.metrics.entries.iter().any(|e| e.unknown_metric().is_some()) {
        lines.push(String::new());
        lines.push("* no preview computation for this metric".to_string());
    }
    lines.join("\n")
}

fn sample_text(state: &AppState) -> String {
    let c = state.confusion;
    let mut lines = vec![
        format!(
            "Blue wins called right: {}   Red wins called right: {}",
            c.true_positive, c.true_negative
        ),
        format!(
            "Called blue, red won: {}   Called red, blue won: {}",
            c.false_positive, c.false_negative
        ),
        "Predicted vs actual blue-win rate:".to_string(),
    ];
    for bin in state.calibration.iter().filter(|b| b.count > 0) {
        lines.push(format!(
            "  {:>3.0}-{:<3.0}% n={:<3} predicted {:>5.1}% actual {:>5.1}%",
            bin.bucket_start * 100.0,
            bin.bucket_end * 100.0,
            bin.count,
            bin.avg_pred * 100.0,
            bin.actual_rate * 100.0
        ));
    }
    lines.join("\n")
}

fn render_ranking(frame: &mut Frame, area: Rect, state: &AppState) {
    let block = Block::default()
        .title("What the model weighs most")
        .borders(Borders::ALL);
    let ranked = match &state.ranking {
        Ok(ranked) if !ranked.is_empty() => ranked,
        Ok(_) => {
            let empty = Paragraph::new("All feature weights are zero").block(block);
            frame.render_widget(empty, area);
            return;
        }
        Err(err) => {
            let empty = Paragraph::new(err.to_string())
                .style(Style::default().fg(Color::Red))
                .block(block);
            frame.render_widget(empty, area);
            return;
        }
    };

    let bars: Vec<Bar> = ranked
        .iter()
        .map(|f| {
            let color = if f.weight >= 0.0 {
                Color::Blue
            } else {
                Color::Red
            };
            Bar::default()
                .value((f.share * 100.0).round() as u64)
                .label(format!("{}. {}", f.rank, humanize_feature(&f.feature)).into())
                .text_value(format!("{:+.2}", f.weight))
                .style(Style::default().fg(color))
        })
        .collect();
    let chart = BarChart::default()
        .block(block)
        .data(BarGroup::default().bars(&bars))
        .direction(Direction::Horizontal)
        .bar_width(1)
        .bar_gap(0)
        .max(100);
    frame.render_widget(chart, area);
}

fn prediction_columns() -> [Constraint; 6] {
    [
        Constraint::Length(18),
        Constraint::Length(8),
        Constraint::Length(9),
        Constraint::Length(9),
        Constraint::Length(8),
        Constraint::Min(10),
    ]
}

fn render_predictions(frame: &mut Frame, area: Rect, app: &App) {
    let table = app.cache.dashboard().table();
    let block = Block::default()
        .title(format!("Predictions (sorted by {})", app.state.sort_label(table)))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let sections = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(1)])
        .split(inner);

    let extra = match app.state.sort {
        SortKey::Feature(col) => table.feature_columns().get(col).cloned(),
        _ => None,
    };
    let widths = prediction_columns();
    render_prediction_header(frame, sections[0], &widths, extra.as_deref());

    let list_area = sections[1];
    if app.state.order.is_empty() {
        let empty = Paragraph::new("Prediction table is empty")
            .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(empty, list_area);
        return;
    }
    if list_area.height == 0 {
        return;
    }

    let visible = list_area.height as usize;
    let (start, end) = visible_range(app.state.selected, app.state.order.len(), visible);
    for (i, idx) in (start..end).enumerate() {
        let Some(row) = table.rows().get(app.state.order[idx]) else {
            continue;
        };
        let row_area = Rect {
            x: list_area.x,
            y: list_area.y + i as u16,
            width: list_area.width,
            height: 1,
        };
        let selected = idx == app.state.selected;
        let row_style = if selected {
            Style::default().fg(Color::White).bg(Color::DarkGray)
        } else {
            Style::default()
        };
        if selected {
            frame.render_widget(Block::default().style(row_style), row_area);
        }
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(widths)
            .split(row_area);

        let reliable = app
            .state
            .decomposed
            .get(app.state.order[idx])
            .is_none_or(|d| d.is_reliable());
        let flag = if reliable { "" } else { "UNRELIABLE" };
        let correct_style = if row.correct {
            row_style.fg(Color::Green)
        } else {
            row_style.fg(Color::Red)
        };

        render_cell_text(frame, cols[0], &row.id, row_style);
        render_cell_text(frame, cols[1], &format!("{:.1}%", row.probability * 100.0), row_style);
        render_cell_text(frame, cols[2], side_label(row.label), row_style);
        render_cell_text(frame, cols[3], side_label(row.predicted_label), row_style);
        render_cell_text(
            frame,
            cols[4],
            if row.correct { "yes" } else { "no" },
            correct_style,
        );
        let last = match extra.as_deref() {
            Some(name) => row
                .feature(name)
                .map(|v| format!("{v:.2} {flag}"))
                .unwrap_or_else(|| flag.to_string()),
            None => flag.to_string(),
        };
        render_cell_text(frame, cols[5], &last, row_style.fg(Color::Yellow));
    }
}

fn render_prediction_header(
    frame: &mut Frame,
    area: Rect,
    widths: &[Constraint],
    extra: Option<&str>,
) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(widths)
        .split(area);
    let style = Style::default().add_modifier(Modifier::BOLD);
    render_cell_text(frame, cols[0], "Match", style);
    render_cell_text(frame, cols[1], "Blue %", style);
    render_cell_text(frame, cols[2], "Winner", style);
    render_cell_text(frame, cols[3], "Called", style);
    render_cell_text(frame, cols[4], "Right?", style);
    render_cell_text(frame, cols[5], extra.unwrap_or("Flags"), style);
}

fn side_label(label: u8) -> &'static str {
    if label == 1 { "Blue" } else { "Red" }
}

fn render_breakdown(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().title("Why this prediction").borders(Borders::ALL);
    let Some(decomposition) = app.state.selected_decomposition() else {
        let empty = Paragraph::new("No row selected").block(block);
        frame.render_widget(empty, area);
        return;
    };
    let row = app
        .state
        .selected_position()
        .and_then(|pos| app.cache.dashboard().table().rows().get(pos));

    let mut lines: Vec<Line> = Vec::new();
    if let Some(row) = row {
        lines.push(Line::from(format!(
            "Match {} | model says {:.1}% blue | {} won | {}",
            row.id,
            row.probability * 100.0,
            side_label(row.label),
            if row.correct { "called right" } else { "called wrong" }
        )));
        lines.push(Line::from(""));
    }

    match &decomposition.result {
        Ok(breakdown) => {
            let max_abs = breakdown
                .contributions
                .iter()
                .map(|c| c.contribution.abs())
                .fold(breakdown.bias.abs(), f64::max)
                .max(1e-9);
            for c in &breakdown.contributions {
                let bar = contribution_bar(c.contribution, max_abs, 24);
                let (text, style) = match c.status {
                    ContributionStatus::Weighted => (
                        format!(
                            "{:<24} {:>+8.3} {bar}",
                            humanize_feature(&c.feature),
                            c.contribution
                        ),
                        Style::default().fg(if c.contribution >= 0.0 {
                            Color::Blue
                        } else {
                            Color::Red
                        }),
                    ),
                    ContributionStatus::Unweighted => (
                        format!(
                            "{:<24} {:>8} unweighted: model has no weight for this column",
                            humanize_feature(&c.feature),
                            "0"
                        ),
                        Style::default().fg(Color::Yellow),
                    ),
                    ContributionStatus::Absent => (
                        format!(
                            "{:<24} {:>8} absent: weighted feature missing from row",
                            humanize_feature(&c.feature),
                            "0"
                        ),
                        Style::default().fg(Color::Yellow),
                    ),
                };
                lines.push(Line::styled(text, style));
            }
            lines.push(Line::from(format!(
                "{:<24} {:>+8.3}",
                "Baseline (bias)", breakdown.bias
            )));
            lines.push(Line::styled(
                format!(
                    "{:<24} {:>+8.3}  => {:.1}% blue",
                    "Total score",
                    breakdown.total,
                    breakdown.probability() * 100.0
                ),
                Style::default().add_modifier(Modifier::BOLD),
            ));
            if let Some(stored) = breakdown.stored_score {
                lines.push(Line::from(format!(
                    "Stored score {stored:+.3} matches within {:e}",
                    breakdown.epsilon
                )));
            }
            lines.push(Line::from(""));
            lines.push(Line::from("Top reasons:"));
            for reason in top_reasons(breakdown, app.state.top_reasons) {
                lines.push(Line::from(format!("  - {reason}")));
            }
        }
        Err(err) => {
            let text = match err {
                DecomposeError::Mismatch(_) => {
                    format!("UNRELIABLE: {err}. The stored weights do not explain this row.")
                }
                other => other.to_string(),
            };
            lines.push(Line::styled(
                text,
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ));
        }
    }

    let paragraph = Paragraph::new(lines)
        .block(block)
        .scroll((app.state.breakdown_scroll, 0));
    frame.render_widget(paragraph, area);
}

fn contribution_bar(value: f64, max_abs: f64, width: usize) -> String {
    let len = ((value.abs() / max_abs) * width as f64).round() as usize;
    let glyph = if value >= 0.0 { '+' } else { '-' };
    std::iter::repeat_n(glyph, len.min(width)).collect()
}

fn console_text(state: &AppState, height: u16) -> String {
    let keep = height.saturating_sub(2) as usize;
    let skip = state.logs.len().saturating_sub(keep);
    state
        .logs
        .iter()
        .skip(skip)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_cell_text(frame: &mut Frame, area: Rect, text: &str, style: Style) {
    let text_area = Rect {
        x: area.x,
        y: area.y + (area.height / 2),
        width: area.width,
        height: 1,
    };
    let paragraph = Paragraph::new(text.to_string()).style(style);
    frame.render_widget(paragraph, text_area);
}

fn visible_range(selected: usize, total: usize, visible: usize) -> (usize, usize) {
    if total == 0 {
        return (0, 0);
    }
    if total <= visible {
        return (0, total);
    }
    let mut start = selected.saturating_sub(visible / 2);
    if start + visible > total {
        start = total - visible;
    }
    (start, start + visible)
}

fn render_help_overlay(frame: &mut Frame, area: Rect) {
    let width = area.width.min(62);
    let height = area.height.min(16);
    let popup = Rect {
        x: area.x + (area.width.saturating_sub(width)) / 2,
        y: area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    };
    let text = [
        "1  Overview: hold-out vs preview metrics, feature weights",
        "2  Predictions: every preview match",
        "3/Enter  Breakdown of the highlighted match",
        "j/k  Move selection",
        "s  Cycle sort column, r  reverse order",
        "PgUp/PgDn  Scroll the breakdown",
        "R  Reload artifacts from disk",
        "x  Export workbook",
        "?  Toggle help, q  Quit",
        "",
        "n/a means the metric cannot be computed on the preview sample.",
        "UNRELIABLE rows: stored score disagrees with the weights.",
    ]
    .join("\n");
    frame.render_widget(Clear, popup);
    let help = Paragraph::new(text).block(Block::default().title("Help").borders(Borders::ALL));
    frame.render_widget(help, popup);
}
