use crate::backtest_api_client::BacktestApi;
use crate::batch_status::BatchStatus;
use crate::config::BatchConfig;
use crate::error::{PanelError, PanelResult};
use crate::models::JobId;
use crate::poller::{Poller, PollerConfig};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs batches of backtests, one job per timeframe, and owns their aggregate state.
///
/// Submissions go out one at a time; every accepted job gets its own [`Poller`] right away,
/// so polling of earlier jobs overlaps with submission of later ones. A batch that is still
/// submitting rejects a second `run_batch`; once submission is done, a new batch supersedes
/// the old one by stopping its pollers and invalidating its generation before the reset.
pub struct Orchestrator {
    api: Arc<dyn BacktestApi>,
    status: BatchStatus,
    poller_config: PollerConfig,
    pollers: DashMap<JobId, Poller>,
    submitting: AtomicBool,
    models: Vec<String>,
}

impl Orchestrator {
    /// Builds an orchestrator and loads the selectable model list once.
    pub async fn initialize(api: Arc<dyn BacktestApi>, poller_config: PollerConfig) -> Self {
        let models = match api.list_models().await {
            Ok(models) => {
                info!("Loaded {} model(s) from the trading service", models.len());
                models
            }
            Err(err) => {
                warn!("Failed to load model list: {}. Model selection is unchecked.", err);
                Vec::new()
            }
        };
        Self::with_models(api, poller_config, models)
    }

    pub fn with_models(
        api: Arc<dyn BacktestApi>,
        poller_config: PollerConfig,
        models: Vec<String>,
    ) -> Self {
        Self {
            api,
            status: BatchStatus::new(),
            poller_config,
            pollers: DashMap::new(),
            submitting: AtomicBool::new(false),
            models,
        }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn status(&self) -> BatchStatus {
        self.status.clone()
    }

    pub async fn run_single(&self, config: &BatchConfig, timeframe: &str) -> PanelResult<u64> {
        self.run_batch(config, &[timeframe.to_string()]).await
    }

    /// Submits one backtest per timeframe and returns the batch generation.
    pub async fn run_batch(&self, config: &BatchConfig, timeframes: &[String]) -> PanelResult<u64> {
        validate_timeframes(timeframes)?;
        config
            .validate()
            .map_err(|err| PanelError::InvalidBatch(err.to_string()))?;
        if self
            .submitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PanelError::BatchInFlight);
        }
        let _submitting = SubmissionGuard(&self.submitting);

        let superseded = self.stop_all_pollers();
        if superseded > 0 {
            info!("Stopped {} poller(s) from the previous batch", superseded);
        }
        let generation = self.status.begin_batch(timeframes);
        info!(
            "Starting batch {} for {} on {} ({} timeframe(s): {})",
            generation,
            config.symbol,
            config.model,
            timeframes.len(),
            timeframes.join(", ")
        );
        if !self.models.is_empty() && !self.models.contains(&config.model) {
            warn!(
                "Model {} is not in the service's model list; submitting anyway",
                config.model
            );
        }

        let mut assigned: HashMap<JobId, &str> = HashMap::new();
        for timeframe in timeframes {
            let request = config.request_for(timeframe);
            match self.api.submit_backtest(&request).await {
                Ok(job_id) => {
                    // One poller per job id: a repeated id cannot stand for a second timeframe.
                    if let Some(owner) = assigned.get(&job_id) {
                        let message =
                            format!("duplicate job id {} (already assigned to {})", job_id, owner);
                        warn!("Submission for {} rejected: {}", timeframe, message);
                        if self
                            .status
                            .mark_submission_failed(generation, timeframe, &message)
                            .is_err()
                        {
                            warn!("Batch {} was superseded during submission", generation);
                            break;
                        }
                        continue;
                    }
                    if let Err(err) = self.status.assign_job(generation, timeframe, &job_id) {
                        warn!(
                            "Batch {} was superseded during submission ({}); not polling job {}",
                            generation, err, job_id
                        );
                        break;
                    }
                    info!("Submitted {} backtest as job {}", timeframe, job_id);
                    assigned.insert(job_id.clone(), timeframe.as_str());
                    self.spawn_poller(generation, timeframe, job_id);
                }
                Err(err) => {
                    let err = PanelError::submission(timeframe, err);
                    warn!("{}", err);
                    let marked = self.status.mark_submission_failed(
                        generation,
                        timeframe,
                        &err.display_message(),
                    );
                    if marked.is_err() {
                        warn!("Batch {} was superseded during submission", generation);
                        break;
                    }
                }
            }
        }

        Ok(generation)
    }

    fn spawn_poller(&self, generation: u64, timeframe: &str, job_id: JobId) {
        let status = self.status.clone();
        let timeframe = timeframe.to_string();
        let poller = Poller::start(
            Arc::clone(&self.api),
            job_id.clone(),
            generation,
            self.poller_config,
            move |snapshot| status.apply_snapshot(generation, &timeframe, snapshot),
        );
        if let Some(previous) = self.pollers.insert(job_id.clone(), poller) {
            debug!(
                "Replacing poller for job {} from generation {}",
                job_id,
                previous.generation()
            );
            previous.stop();
        }
    }

    fn stop_all_pollers(&self) -> usize {
        let mut stopped = 0;
        for entry in self.pollers.iter() {
            if entry.value().is_active() {
                stopped += 1;
            }
            entry.value().stop();
        }
        self.pollers.clear();
        stopped
    }

    /// Number of pollers still running.
    pub fn active_pollers(&self) -> usize {
        self.pollers.retain(|_, poller| poller.is_active());
        self.pollers.len()
    }

    fn has_live_pollers(&self, generation: u64) -> bool {
        self.pollers
            .iter()
            .any(|entry| entry.value().generation() == generation && entry.value().is_active())
    }

    /// Resolves once every record of the current batch is terminal, the batch is superseded,
    /// or nothing is left that could move it forward. Reaps the batch's pollers afterwards.
    pub async fn wait_until_settled(&self) {
        let mut revisions = self.status.subscribe();
        let generation = self.status.current_generation();
        loop {
            if self.status.is_settled() || self.status.current_generation() != generation {
                break;
            }
            let submitting = self.submitting.load(Ordering::SeqCst);
            if !submitting && !self.has_live_pollers(generation) {
                break;
            }
            if revisions.changed().await.is_err() {
                break;
            }
        }

        let job_ids: Vec<JobId> = self
            .pollers
            .iter()
            .filter(|entry| entry.value().generation() == generation)
            .map(|entry| entry.key().clone())
            .collect();
        let finished = job_ids
            .iter()
            .filter_map(|job_id| self.pollers.remove(job_id))
            .map(|(_, poller)| poller.join());
        join_all(finished).await;
    }

    /// Stops every poller and invalidates the current batch. Safe to call repeatedly.
    pub fn dispose(&self) {
        let stopped = self.stop_all_pollers();
        let generation = self.status.supersede();
        info!(
            "Orchestrator disposed ({} poller(s) stopped, generation now {})",
            stopped, generation
        );
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_all_pollers();
    }
}

/// Clears the in-flight flag however `run_batch` exits, including cancellation.
struct SubmissionGuard<'a>(&'a AtomicBool);

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn validate_timeframes(timeframes: &[String]) -> PanelResult<()> {
    if timeframes.is_empty() {
        return Err(PanelError::InvalidBatch(
            "at least one timeframe is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for timeframe in timeframes {
        if timeframe.trim().is_empty() {
            return Err(PanelError::InvalidBatch("empty timeframe".to_string()));
        }
        if !seen.insert(timeframe.as_str()) {
            return Err(PanelError::InvalidBatch(format!(
                "duplicate timeframe {}",
                timeframe
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapitalSizing;
    use crate::models::{BacktestResult, JobSnapshot, JobState};
    use crate::test_support::{lines, PollStep, ScriptedApi};
    use std::time::Duration;

    fn batch_config() -> BatchConfig {
        BatchConfig {
            symbol: "BTC/USDT".to_string(),
            strategy: "trend".to_string(),
            model: "gemini-pro".to_string(),
            days: 7,
            capital: CapitalSizing::Fixed { amount: 1000.0 },
        }
    }

    fn timeframes(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn orchestrator(api: Arc<ScriptedApi>) -> Orchestrator {
        Orchestrator::with_models(api, PollerConfig::default(), Vec::new())
    }

    fn endless(job_line: &str) -> Vec<PollStep> {
        vec![PollStep::Snapshot(JobSnapshot::running(lines(&[job_line])))]
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_outcomes_settle_independently() {
        let api = Arc::new(
            ScriptedApi::new()
                .accept(
                    "1h",
                    "A",
                    vec![
                        PollStep::Snapshot(JobSnapshot::running(lines(&["init"]))),
                        PollStep::Snapshot(JobSnapshot::completed(
                            lines(&["init", "done"]),
                            BacktestResult {
                                total_return: Some(5.2),
                                ..Default::default()
                            },
                        )),
                    ],
                )
                .accept(
                    "4h",
                    "B",
                    vec![PollStep::Snapshot(JobSnapshot::failed(
                        Vec::new(),
                        "insufficient data",
                    ))],
                ),
        );
        let orchestrator = orchestrator(api.clone());
        orchestrator
            .run_batch(&batch_config(), &timeframes(&["1h", "4h"]))
            .await
            .unwrap();
        orchestrator.wait_until_settled().await;

        let snapshot = orchestrator.status().snapshot();
        let hourly = snapshot.record("1h").unwrap();
        assert_eq!(hourly.job_id, Some(JobId::new("A")));
        assert_eq!(hourly.state.result().unwrap().total_return, Some(5.2));
        let four_hour = snapshot.record("4h").unwrap();
        assert_eq!(
            four_hour.state,
            JobState::Failed("insufficient data".to_string())
        );
        assert_eq!(orchestrator.active_pollers(), 0);

        let polls_a = api.poll_count("A");
        let polls_b = api.poll_count("B");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.poll_count("A"), polls_a);
        assert_eq!(api.poll_count("B"), polls_b);
        assert_eq!(orchestrator.status().snapshot().record("1h"), Some(hourly));
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failure_does_not_stop_the_batch() {
        let api = Arc::new(
            ScriptedApi::new()
                .reject("5m", "symbol not supported")
                .accept(
                    "1h",
                    "A",
                    vec![PollStep::Snapshot(JobSnapshot::completed(
                        Vec::new(),
                        BacktestResult::default(),
                    ))],
                ),
        );
        let orchestrator = orchestrator(api.clone());
        orchestrator
            .run_batch(&batch_config(), &timeframes(&["5m", "1h"]))
            .await
            .unwrap();
        assert_eq!(api.submitted_timeframes(), timeframes(&["5m", "1h"]));

        orchestrator.wait_until_settled().await;
        let snapshot = orchestrator.status().snapshot();
        let failed = snapshot.record("5m").unwrap();
        assert_eq!(failed.state.label(), "error");
        assert!(failed.job_id.is_none());
        assert!(failed.state.error().unwrap().contains("symbol not supported"));
        assert_eq!(snapshot.record("1h").unwrap().state.label(), "completed");
        assert_eq!(api.poll_count("A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_batch_silences_previous_pollers() {
        let api = Arc::new(
            ScriptedApi::new()
                .accept("1h", "A", endless("old batch line"))
                .accept("4h", "B", endless("new batch line")),
        );
        let orchestrator = orchestrator(api.clone());
        let first = orchestrator
            .run_batch(&batch_config(), &timeframes(&["1h"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(orchestrator.active_pollers(), 1);

        let second = orchestrator
            .run_batch(&batch_config(), &timeframes(&["4h"]))
            .await
            .unwrap();
        assert!(second > first);
        let polls_a = api.poll_count("A");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(api.poll_count("A"), polls_a);
        assert_eq!(orchestrator.active_pollers(), 1);
        let snapshot = orchestrator.status().snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert!(snapshot.record("1h").is_none());
        assert!(snapshot.feed.iter().all(|line| line.timeframe == "4h"));
        orchestrator.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_job_id_is_refused_for_second_timeframe() {
        let api = Arc::new(
            ScriptedApi::new()
                .with_submit_delay(Duration::from_millis(1500))
                // Scripts are keyed by job id, so the 1h script registered last is the one polled.
                .accept("4h", "A", Vec::new())
                .accept(
                    "1h",
                    "A",
                    vec![
                        PollStep::Snapshot(JobSnapshot::running(lines(&["init"]))),
                        PollStep::Snapshot(JobSnapshot::running(lines(&["init", "training"]))),
                        PollStep::Snapshot(JobSnapshot::completed(
                            lines(&["init", "training", "done"]),
                            BacktestResult::default(),
                        )),
                    ],
                ),
        );
        let orchestrator = orchestrator(api.clone());
        orchestrator
            .run_batch(&batch_config(), &timeframes(&["1h", "4h"]))
            .await
            .unwrap();
        orchestrator.wait_until_settled().await;

        let snapshot = orchestrator.status().snapshot();
        assert!(snapshot.is_settled());
        let hourly = snapshot.record("1h").unwrap();
        assert_eq!(hourly.job_id, Some(JobId::new("A")));
        assert_eq!(hourly.state.label(), "completed");
        let four_hour = snapshot.record("4h").unwrap();
        assert_eq!(four_hour.state.label(), "error");
        assert!(four_hour.job_id.is_none());
        assert!(four_hour
            .state
            .error()
            .unwrap()
            .contains("duplicate job id A"));
        assert_eq!(api.submitted_timeframes(), timeframes(&["1h", "4h"]));
        assert_eq!(api.poll_count("A"), 3);
        assert_eq!(orchestrator.active_pollers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_submission_is_rejected() {
        let api = Arc::new(
            ScriptedApi::new()
                .with_submit_delay(Duration::from_secs(1))
                .accept("1h", "A", endless("a"))
                .accept("4h", "B", endless("b")),
        );
        let orchestrator = Arc::new(orchestrator(api.clone()));
        let background = Arc::clone(&orchestrator);
        let running = tokio::spawn(async move {
            background
                .run_batch(&batch_config(), &timeframes(&["1h", "4h"]))
                .await
        });
        tokio::task::yield_now().await;

        let rejected = orchestrator
            .run_batch(&batch_config(), &timeframes(&["1h"]))
            .await;
        assert!(matches!(rejected, Err(PanelError::BatchInFlight)));

        let generation = running.await.unwrap().unwrap();
        assert_eq!(orchestrator.status().current_generation(), generation);
        assert_eq!(api.submitted_timeframes(), timeframes(&["1h", "4h"]));
        assert!(orchestrator.active_pollers() <= 2);
        orchestrator.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_timeframes_leave_state_untouched() {
        let api = Arc::new(ScriptedApi::new());
        let orchestrator = orchestrator(api.clone());
        let duplicate = orchestrator
            .run_batch(&batch_config(), &timeframes(&["1h", "1h"]))
            .await;
        assert!(matches!(duplicate, Err(PanelError::InvalidBatch(_))));
        let empty = orchestrator.run_batch(&batch_config(), &[]).await;
        assert!(matches!(empty, Err(PanelError::InvalidBatch(_))));
        assert_eq!(orchestrator.status().current_generation(), 0);
        assert!(api.submitted_timeframes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_everything_and_is_idempotent() {
        let api = Arc::new(ScriptedApi::new().accept("1h", "A", endless("a")));
        let orchestrator = orchestrator(api.clone());
        orchestrator
            .run_single(&batch_config(), "1h")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        orchestrator.dispose();
        orchestrator.dispose();
        let polls = api.poll_count("A");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.poll_count("A"), polls);
        assert_eq!(orchestrator.active_pollers(), 0);
        assert_eq!(
            orchestrator.status().snapshot().record("1h").unwrap().state,
            JobState::Running
        );
        orchestrator.wait_until_settled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_loads_models_once() {
        let api = Arc::new(ScriptedApi::new().with_models(&["gemini-pro", "gemini-flash"]));
        let orchestrator = Orchestrator::initialize(api.clone(), PollerConfig::default()).await;
        assert_eq!(orchestrator.models(), &["gemini-pro", "gemini-flash"]);
        assert_eq!(api.list_calls(), 1);
    }
}
