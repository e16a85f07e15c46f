use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const DEFAULT_TIMEFRAMES: [&str; 6] = ["5m", "15m", "1h", "4h", "1d", "1w"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestRequest {
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub model: String,
    pub days: u32,
    pub initial_capital: f64,
}

/// Opaque job token handed out by the remote engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(alias = "pending", alias = "queued")]
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EquityPoint {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub equity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BacktestTrade {
    #[serde(default)]
    pub entry_time: Option<String>,
    #[serde(default)]
    pub exit_time: Option<String>,
    #[serde(default, rename = "type")]
    pub side: Option<String>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BacktestResult {
    #[serde(default)]
    pub total_trades: u32,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default)]
    pub total_return: Option<f64>,
    #[serde(default)]
    pub equity_curve: Vec<EquityPoint>,
    #[serde(default)]
    pub trades: Vec<BacktestTrade>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BacktestResult {
    pub fn win_rate(&self) -> Option<f64> {
        let decided = self.wins + self.losses;
        if decided == 0 {
            return None;
        }
        Some(self.wins as f64 / decided as f64)
    }

    /// Total return in percent; derived from the equity curve when the engine omits it.
    pub fn effective_total_return(&self) -> Option<f64> {
        if self.total_return.is_some() {
            return self.total_return;
        }
        let first = self.equity_curve.first()?.equity;
        let last = self.equity_curve.last()?.equity;
        if first <= 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub result: Option<BacktestResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn running(logs: Vec<String>) -> Self {
        Self {
            status: JobStatus::Running,
            logs,
            result: None,
            error: None,
        }
    }

    pub fn completed(logs: Vec<String>, result: BacktestResult) -> Self {
        Self {
            status: JobStatus::Completed,
            logs,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(logs: Vec<String>, error: S) -> Self {
        Self {
            status: JobStatus::Failed,
            logs,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Collapses the wire snapshot into the job state it represents.
    pub fn to_state(&self) -> JobState {
        match self.status {
            JobStatus::Running => JobState::Running,
            JobStatus::Completed => {
                let result = self.result.clone().unwrap_or_default();
                match result.error.as_deref().map(str::trim) {
                    Some(message) if !message.is_empty() => JobState::Failed(message.to_string()),
                    _ => JobState::Completed(result),
                }
            }
            JobStatus::Failed => JobState::Failed(
                self.error
                    .as_deref()
                    .map(str::trim)
                    .filter(|message| !message.is_empty())
                    .unwrap_or("unknown error")
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed(BacktestResult),
    Failed(String),
    SubmissionFailed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed(_) | JobState::Failed(_) | JobState::SubmissionFailed(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed(_) => "completed",
            JobState::Failed(_) => "failed",
            JobState::SubmissionFailed(_) => "error",
        }
    }

    pub fn result(&self) -> Option<&BacktestResult> {
        match self {
            JobState::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobState::Failed(message) | JobState::SubmissionFailed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub timeframe: String,
    pub job_id: Option<JobId>,
    pub state: JobState,
    pub logs: Vec<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(timeframe: &str) -> Self {
        Self {
            timeframe: timeframe.to_string(),
            job_id: None,
            state: JobState::Pending,
            logs: Vec::new(),
            submitted_at: None,
            updated_at: None,
        }
    }
}
