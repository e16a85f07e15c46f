use crate::backtest_api_client::BacktestApi;
use crate::error::{PanelError, PanelResult};
use crate::models::{BacktestRequest, JobId, JobSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum PollStep {
    Snapshot(JobSnapshot),
    Unreachable,
}

/// In-memory engine: submissions map timeframes to job ids, polls replay a script per job.
/// The last scripted step repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedApi {
    submissions: Mutex<HashMap<String, Result<String, String>>>,
    scripts: Mutex<HashMap<String, VecDeque<PollStep>>>,
    submitted: Mutex<Vec<BacktestRequest>>,
    poll_counts: Mutex<HashMap<String, usize>>,
    models: Vec<String>,
    submit_delay: Option<Duration>,
    list_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|model| model.to_string()).collect();
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn accept(self, timeframe: &str, job_id: &str, steps: Vec<PollStep>) -> Self {
        self.submissions
            .lock()
            .unwrap()
            .insert(timeframe.to_string(), Ok(job_id.to_string()));
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), steps.into_iter().collect());
        self
    }

    pub fn reject(self, timeframe: &str, message: &str) -> Self {
        self.submissions
            .lock()
            .unwrap()
            .insert(timeframe.to_string(), Err(message.to_string()));
        self
    }

    pub fn submitted_timeframes(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.timeframe.clone())
            .collect()
    }

    pub fn poll_count(&self, job_id: &str) -> usize {
        self.poll_counts
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BacktestApi for ScriptedApi {
    async fn submit_backtest(&self, request: &BacktestRequest) -> PanelResult<JobId> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        self.submitted.lock().unwrap().push(request.clone());
        let outcome = self
            .submissions
            .lock()
            .unwrap()
            .get(&request.timeframe)
            .cloned()
            .unwrap_or_else(|| Err(format!("no script for {}", request.timeframe)));
        match outcome {
            Ok(job_id) => Ok(JobId::new(job_id)),
            Err(message) => Err(PanelError::Api {
                status: 422,
                body: message,
            }),
        }
    }

    async fn get_backtest_snapshot(&self, job_id: &JobId) -> PanelResult<JobSnapshot> {
        *self
            .poll_counts
            .lock()
            .unwrap()
            .entry(job_id.as_str().to_string())
            .or_insert(0) += 1;
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            let Some(script) = scripts.get_mut(job_id.as_str()) else {
                return Err(PanelError::Api {
                    status: 404,
                    body: format!("unknown job {}", job_id),
                });
            };
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match step {
            Some(PollStep::Snapshot(snapshot)) => Ok(snapshot),
            Some(PollStep::Unreachable) | None => Err(PanelError::Api {
                status: 503,
                body: "engine unreachable".to_string(),
            }),
        }
    }

    async fn list_models(&self) -> PanelResult<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.models.clone())
    }
}

pub fn lines(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
