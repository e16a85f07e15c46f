use crate::error::PanelError;
use crate::log_feed::{FeedLine, LogAggregator};
use crate::models::{JobId, JobRecord, JobSnapshot, JobState};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

/// Shared aggregate state of the current batch: one record per timeframe plus the live feed.
///
/// Every write is tagged with the batch generation that produced it; writes from an older
/// generation are discarded so a superseded batch can never leak into the current one.
#[derive(Clone)]
pub struct BatchStatus {
    inner: Arc<Mutex<BatchStatusData>>,
    revision: Arc<watch::Sender<u64>>,
}

#[derive(Default)]
struct BatchStatusData {
    generation: u64,
    batch_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    timeframes: Vec<String>,
    records: HashMap<String, JobRecord>,
    feed: LogAggregator,
}

#[derive(Clone, Debug)]
pub struct BatchSnapshot {
    pub generation: u64,
    pub batch_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    /// Records in batch order.
    pub records: Vec<JobRecord>,
    pub feed: Vec<FeedLine>,
    pub feed_source: Option<String>,
}

impl BatchSnapshot {
    pub fn record(&self, timeframe: &str) -> Option<&JobRecord> {
        self.records.iter().find(|record| record.timeframe == timeframe)
    }

    pub fn is_settled(&self) -> bool {
        !self.records.is_empty() && self.records.iter().all(|record| record.state.is_terminal())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Applied, and the job is now terminal.
    Terminal,
    /// The record was already terminal; nothing changed.
    AlreadyTerminal,
    /// The write came from a superseded batch and was discarded.
    Stale,
}

impl ApplyOutcome {
    /// Whether the writer should keep going.
    pub fn keep_polling(self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStatus {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(BatchStatusData::default())),
            revision: Arc::new(revision),
        }
    }

    fn data(&self) -> MutexGuard<'_, BatchStatusData> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Receiver that changes on every state mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        self.data().generation
    }

    /// Starts a new generation with every timeframe pending and an empty feed.
    pub fn begin_batch(&self, timeframes: &[String]) -> u64 {
        let generation = {
            let mut data = self.data();
            data.generation += 1;
            data.batch_id = Some(Uuid::new_v4());
            data.started_at = Some(Utc::now());
            data.timeframes = timeframes.to_vec();
            data.records = timeframes
                .iter()
                .map(|timeframe| (timeframe.clone(), JobRecord::pending(timeframe)))
                .collect();
            data.feed.clear();
            data.generation
        };
        self.bump_revision();
        generation
    }

    /// Invalidates the current generation without touching the records.
    pub fn supersede(&self) -> u64 {
        let generation = {
            let mut data = self.data();
            data.generation += 1;
            data.generation
        };
        self.bump_revision();
        generation
    }

    pub fn assign_job(
        &self,
        generation: u64,
        timeframe: &str,
        job_id: &JobId,
    ) -> Result<(), PanelError> {
        {
            let mut data = self.data();
            check_generation(&data, generation)?;
            let Some(record) = data.records.get_mut(timeframe) else {
                return Err(PanelError::InvalidBatch(format!(
                    "timeframe {} is not part of the current batch",
                    timeframe
                )));
            };
            let now = Utc::now();
            record.job_id = Some(job_id.clone());
            record.state = JobState::Running;
            record.submitted_at = Some(now);
            record.updated_at = Some(now);
        }
        self.bump_revision();
        Ok(())
    }

    pub fn mark_submission_failed(
        &self,
        generation: u64,
        timeframe: &str,
        message: &str,
    ) -> Result<(), PanelError> {
        {
            let mut data = self.data();
            check_generation(&data, generation)?;
            if let Some(record) = data.records.get_mut(timeframe) {
                record.job_id = None;
                record.state = JobState::SubmissionFailed(message.to_string());
                record.updated_at = Some(Utc::now());
            }
        }
        self.bump_revision();
        Ok(())
    }

    pub fn apply_snapshot(
        &self,
        generation: u64,
        timeframe: &str,
        snapshot: &JobSnapshot,
    ) -> ApplyOutcome {
        let outcome = {
            let mut data = self.data();
            if data.generation != generation {
                debug!(
                    "Discarding {} snapshot from batch generation {} (current {})",
                    timeframe, generation, data.generation
                );
                return ApplyOutcome::Stale;
            }
            let Some(record) = data.records.get_mut(timeframe) else {
                debug!("Discarding snapshot for unknown timeframe {}", timeframe);
                return ApplyOutcome::Stale;
            };
            if record.state.is_terminal() {
                return ApplyOutcome::AlreadyTerminal;
            }

            record.logs = snapshot.logs.clone();
            record.state = snapshot.to_state();
            record.updated_at = Some(Utc::now());
            let terminal = record.state.is_terminal();
            match &record.state {
                JobState::Completed(result) => info!(
                    "{} backtest completed: {} trades, PnL {:.2}",
                    timeframe, result.total_trades, result.total_pnl
                ),
                JobState::Failed(message) => match record.job_id.clone() {
                    Some(job_id) => warn!(
                        "{} backtest: {}",
                        timeframe,
                        PanelError::JobFailure {
                            job_id,
                            message: message.clone(),
                        }
                    ),
                    None => warn!("{} backtest failed: {}", timeframe, message),
                },
                _ => {}
            }
            data.feed.apply(timeframe, &snapshot.logs);

            if terminal {
                ApplyOutcome::Terminal
            } else {
                ApplyOutcome::Applied
            }
        };
        self.bump_revision();
        outcome
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let data = self.data();
        BatchSnapshot {
            generation: data.generation,
            batch_id: data.batch_id,
            started_at: data.started_at,
            records: data
                .timeframes
                .iter()
                .filter_map(|timeframe| data.records.get(timeframe).cloned())
                .collect(),
            feed: data.feed.lines().to_vec(),
            feed_source: data.feed.source().map(str::to_string),
        }
    }

    pub fn is_settled(&self) -> bool {
        let data = self.data();
        !data.records.is_empty() && data.records.values().all(|record| record.state.is_terminal())
    }
}

fn check_generation(data: &BatchStatusData, generation: u64) -> Result<(), PanelError> {
    if data.generation != generation {
        return Err(PanelError::StaleWrite {
            generation,
            current: data.generation,
        });
    }
    Ok(())
}
