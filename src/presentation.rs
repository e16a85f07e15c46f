use crate::batch_status::BatchSnapshot;
use crate::log_feed::FeedLine;
use crate::models::{EquityPoint, JobRecord, JobState};
use std::collections::HashSet;
use std::fmt::Write;

const FEED_TAIL_LINES: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tone {
    Neutral,
    Active,
    Positive,
    Negative,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Badge {
    pub label: &'static str,
    pub tone: Tone,
}

impl Badge {
    pub fn for_state(state: &JobState) -> Self {
        let tone = match state {
            JobState::Pending => Tone::Neutral,
            JobState::Running => Tone::Active,
            JobState::Completed(_) => Tone::Positive,
            JobState::Failed(_) | JobState::SubmissionFailed(_) => Tone::Negative,
        };
        Self {
            label: state.label(),
            tone,
        }
    }
}

/// Expand/collapse flags per timeframe. Purely local; never touches job state.
#[derive(Clone, Debug, Default)]
pub struct ViewState {
    expanded: HashSet<String>,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the row and returns whether it is now expanded.
    pub fn toggle(&mut self, timeframe: &str) -> bool {
        if self.expanded.remove(timeframe) {
            false
        } else {
            self.expanded.insert(timeframe.to_string());
            true
        }
    }

    pub fn is_expanded(&self, timeframe: &str) -> bool {
        self.expanded.contains(timeframe)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobRow {
    pub timeframe: String,
    pub badge: Badge,
    pub job_id: Option<String>,
    pub log_count: usize,
    pub last_line: Option<String>,
    pub total_return_pct: Option<f64>,
    pub total_pnl: Option<f64>,
    pub total_trades: Option<u32>,
    pub win_rate: Option<f64>,
    pub error: Option<String>,
    pub expanded: bool,
    /// Only filled for expanded rows.
    pub equity_curve: Vec<EquityPoint>,
}

impl JobRow {
    fn project(record: &JobRecord, view: &ViewState) -> Self {
        let result = record.state.result();
        let expanded = view.is_expanded(&record.timeframe);
        Self {
            timeframe: record.timeframe.clone(),
            badge: Badge::for_state(&record.state),
            job_id: record.job_id.as_ref().map(|id| id.as_str().to_string()),
            log_count: record.logs.len(),
            last_line: record.logs.last().cloned(),
            total_return_pct: result.and_then(|r| r.effective_total_return()),
            total_pnl: result.map(|r| r.total_pnl),
            total_trades: result.map(|r| r.total_trades),
            win_rate: result.and_then(|r| r.win_rate()),
            error: record.state.error().map(str::to_string),
            expanded,
            equity_curve: match result {
                Some(r) if expanded => r.equity_curve.clone(),
                _ => Vec::new(),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.errored
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.errored
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchView {
    pub generation: u64,
    pub summary: BatchSummary,
    pub rows: Vec<JobRow>,
    pub feed: Vec<FeedLine>,
}

impl BatchView {
    pub fn project(snapshot: &BatchSnapshot, view: &ViewState) -> Self {
        let mut summary = BatchSummary::default();
        for record in &snapshot.records {
            match record.state {
                JobState::Pending => summary.pending += 1,
                JobState::Running => summary.running += 1,
                JobState::Completed(_) => summary.completed += 1,
                JobState::Failed(_) => summary.failed += 1,
                JobState::SubmissionFailed(_) => summary.errored += 1,
            }
        }
        Self {
            generation: snapshot.generation,
            summary,
            rows: snapshot
                .records
                .iter()
                .map(|record| JobRow::project(record, view))
                .collect(),
            feed: snapshot.feed.clone(),
        }
    }

    /// Plain-text table followed by the tail of the live feed.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "batch {}: {}/{} finished ({} completed, {} failed, {} error, {} running, {} pending)",
            self.generation,
            self.summary.finished(),
            self.summary.total(),
            self.summary.completed,
            self.summary.failed,
            self.summary.errored,
            self.summary.running,
            self.summary.pending
        );
        let _ = writeln!(
            out,
            "{:<6} {:<10} {:>9} {:>11} {:>7} {:>8}  {}",
            "tf", "status", "return", "pnl", "trades", "win", "detail"
        );
        for row in &self.rows {
            let detail = row
                .error
                .clone()
                .or_else(|| row.last_line.clone())
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{:<6} {:<10} {:>9} {:>11} {:>7} {:>8}  {}",
                row.timeframe,
                row.badge.label,
                format_optional(row.total_return_pct, |v| format!("{:.2}%", v)),
                format_optional(row.total_pnl, |v| format!("{:.2}", v)),
                format_optional(row.total_trades, |v| v.to_string()),
                format_optional(row.win_rate, |v| format!("{:.0}%", v * 100.0)),
                detail
            );
            for point in &row.equity_curve {
                let _ = writeln!(out, "         {}  {:.2}", point.time, point.equity);
            }
        }
        if !self.feed.is_empty() {
            let _ = writeln!(out, "--- live log ---");
            let start = self.feed.len().saturating_sub(FEED_TAIL_LINES);
            for line in &self.feed[start..] {
                let _ = writeln!(out, "{}", line.tagged());
            }
        }
        out
    }
}

fn format_optional<T: Copy>(value: Option<T>, format: impl Fn(T) -> String) -> String {
    value.map(format).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_status::BatchStatus;
    use crate::models::{BacktestResult, JobId, JobSnapshot};
    use crate::test_support::lines;

    fn settled_snapshot() -> BatchSnapshot {
        let status = BatchStatus::new();
        let generation = status.begin_batch(&lines(&["5m", "1h", "4h", "1d"]));
        status
            .mark_submission_failed(generation, "5m", "connection refused")
            .unwrap();
        status.assign_job(generation, "1h", &JobId::new("A")).unwrap();
        status.assign_job(generation, "4h", &JobId::new("B")).unwrap();
        status.apply_snapshot(
            generation,
            "1h",
            &JobSnapshot::completed(
                lines(&["init", "done"]),
                BacktestResult {
                    total_trades: 4,
                    wins: 3,
                    losses: 1,
                    total_pnl: 52.0,
                    total_return: Some(5.2),
                    equity_curve: vec![
                        EquityPoint {
                            time: "2024-01-01".to_string(),
                            equity: 1000.0,
                        },
                        EquityPoint {
                            time: "2024-01-02".to_string(),
                            equity: 1052.0,
                        },
                    ],
                    ..Default::default()
                },
            ),
        );
        status.apply_snapshot(
            generation,
            "4h",
            &JobSnapshot::failed(lines(&["init"]), "insufficient data"),
        );
        status.snapshot()
    }

    #[test]
    fn projects_rows_and_summary() {
        let view = BatchView::project(&settled_snapshot(), &ViewState::new());
        assert_eq!(
            view.summary,
            BatchSummary {
                pending: 1,
                running: 0,
                completed: 1,
                failed: 1,
                errored: 1,
            }
        );
        let timeframes: Vec<&str> = view.rows.iter().map(|row| row.timeframe.as_str()).collect();
        assert_eq!(timeframes, vec!["5m", "1h", "4h", "1d"]);

        let hourly = &view.rows[1];
        assert_eq!(hourly.badge.tone, Tone::Positive);
        assert_eq!(hourly.total_return_pct, Some(5.2));
        assert_eq!(hourly.win_rate, Some(0.75));
        assert_eq!(hourly.last_line.as_deref(), Some("done"));
        assert!(hourly.equity_curve.is_empty());

        assert_eq!(view.rows[0].badge.label, "error");
        assert_eq!(view.rows[0].error.as_deref(), Some("connection refused"));
        assert_eq!(view.rows[2].badge.tone, Tone::Negative);
        assert_eq!(view.rows[3].badge.tone, Tone::Neutral);
        assert_eq!(view.feed.len(), 1);
        assert_eq!(view.feed[0].timeframe, "4h");
    }

    #[test]
    fn toggle_only_affects_view() {
        let snapshot = settled_snapshot();
        let mut state = ViewState::new();
        assert!(state.toggle("1h"));
        let expanded = BatchView::project(&snapshot, &state);
        assert!(expanded.rows[1].expanded);
        assert_eq!(expanded.rows[1].equity_curve.len(), 2);
        assert!(!state.toggle("1h"));
        let collapsed = BatchView::project(&snapshot, &state);
        assert!(collapsed.rows[1].equity_curve.is_empty());
        assert_eq!(collapsed.summary, expanded.summary);
    }

    #[test]
    fn projection_is_deterministic() {
        let snapshot = settled_snapshot();
        let state = ViewState::new();
        assert_eq!(
            BatchView::project(&snapshot, &state),
            BatchView::project(&snapshot, &state)
        );
    }

    #[test]
    fn text_rendering_lists_every_row() {
        let text = BatchView::project(&settled_snapshot(), &ViewState::new()).render_text();
        assert!(text.contains("3/4 finished"));
        assert!(text.contains("5.20%"));
        assert!(text.contains("insufficient data"));
        assert!(text.contains("[4h] init"));
    }
}
