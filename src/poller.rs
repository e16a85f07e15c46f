use crate::backtest_api_client::BacktestApi;
use crate::batch_status::ApplyOutcome;
use crate::config::PanelSettings;
use crate::error::PanelError;
use crate::models::{JobId, JobSnapshot};
use crate::retry::{retry_with_backoff, RetryPolicy};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub retry: RetryPolicy,
    /// Wall-clock ceiling for a job that keeps reporting `running`.
    pub job_timeout: Option<Duration>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            job_timeout: None,
        }
    }
}

impl From<&PanelSettings> for PollerConfig {
    fn from(settings: &PanelSettings) -> Self {
        Self {
            interval: settings.poll_interval,
            retry: settings.retry,
            job_timeout: settings.job_timeout,
        }
    }
}

/// Repeatedly fetches one job's snapshot until it is terminal.
///
/// The first fetch happens immediately. A terminal snapshot is delivered once and ends the
/// task; so does a sink answer other than [`ApplyOutcome::Applied`]. Transport failures are
/// retried per the configured policy, after which the job is reported failed with a
/// synthetic "polling lost contact" error instead of going quiet.
pub struct Poller {
    job_id: JobId,
    generation: u64,
    stopped: AtomicBool,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn start<F>(
        api: Arc<dyn BacktestApi>,
        job_id: JobId,
        generation: u64,
        config: PollerConfig,
        on_snapshot: F,
    ) -> Self
    where
        F: FnMut(&JobSnapshot) -> ApplyOutcome + Send + 'static,
    {
        let handle = tokio::spawn(poll_loop(api, job_id.clone(), config, on_snapshot));
        Self {
            job_id,
            generation,
            stopped: AtomicBool::new(false),
            handle: Some(handle),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self
                .handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Idempotent; harmless after the poller has finished on its own.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.as_ref() {
            handle.abort();
        }
    }

    /// Waits for the poller to finish, whether naturally or through [`Poller::stop`].
    pub async fn join(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(err) = handle.await {
            if err.is_panic() {
                warn!("Poller for job {} panicked", self.job_id);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn poll_loop<F>(
    api: Arc<dyn BacktestApi>,
    job_id: JobId,
    config: PollerConfig,
    mut on_snapshot: F,
) where
    F: FnMut(&JobSnapshot) -> ApplyOutcome + Send + 'static,
{
    let started = Instant::now();
    // A ceiling too far out to represent is the same as no ceiling.
    let deadline = config
        .job_timeout
        .and_then(|limit| started.checked_add(limit));
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_logs: Vec<String> = Vec::new();
    let context = format!("job {}", job_id);

    loop {
        ticker.tick().await;

        let fetch = retry_with_backoff(&config.retry, &context, || {
            api.get_backtest_snapshot(&job_id)
        });
        let fetched = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                timeout(remaining, fetch).await.ok()
            }
            None => Some(fetch.await),
        };

        let snapshot = match fetched {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(err)) => {
                let err = PanelError::polling(&job_id, err);
                warn!("{}; marking job as failed", err);
                JobSnapshot::failed(
                    last_logs.clone(),
                    format!("polling lost contact: {}", err.display_message()),
                )
            }
            None => timed_out(&job_id, &config, &last_logs),
        };

        let snapshot = match deadline {
            Some(deadline) if !snapshot.is_terminal() && Instant::now() >= deadline => {
                timed_out(&job_id, &config, &snapshot.logs)
            }
            _ => snapshot,
        };

        last_logs.clone_from(&snapshot.logs);
        let terminal = snapshot.is_terminal();
        let outcome = on_snapshot(&snapshot);
        if terminal || !outcome.keep_polling() {
            debug!(
                "Poller for job {} stopping ({}, {:?})",
                job_id,
                snapshot.status.as_str(),
                outcome
            );
            break;
        }
    }
}

fn timed_out(job_id: &JobId, config: &PollerConfig, logs: &[String]) -> JobSnapshot {
    let limit = config.job_timeout.unwrap_or_default();
    warn!(
        "Job {} still running after {}s; giving up",
        job_id,
        limit.as_secs()
    );
    JobSnapshot::failed(
        logs.to_vec(),
        format!("timed out after {}s", limit.as_secs()),
    )
}
