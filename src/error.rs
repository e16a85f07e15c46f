use crate::models::JobId;
use thiserror::Error;

pub type PanelResult<T> = std::result::Result<T, PanelError>;

#[derive(Debug, Error)]
pub enum PanelError {
    /// Request rejected or unreachable before a job id existed.
    #[error("submission for {timeframe} failed: {source}")]
    Submission {
        timeframe: String,
        #[source]
        source: Box<PanelError>,
    },

    /// Fetch failure while a job is being polled.
    #[error("polling job {job_id} failed: {source}")]
    Polling {
        job_id: JobId,
        #[source]
        source: Box<PanelError>,
    },

    /// The remote engine reported the job as failed.
    #[error("job {job_id} failed: {message}")]
    JobFailure { job_id: JobId, message: String },

    #[error("write from batch generation {generation} discarded (current generation {current})")]
    StaleWrite { generation: u64, current: u64 },

    #[error("a batch is already being submitted")]
    BatchInFlight,

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("API responded with {status}: {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PanelError {
    pub fn submission(timeframe: &str, source: PanelError) -> Self {
        PanelError::Submission {
            timeframe: timeframe.to_string(),
            source: Box::new(source),
        }
    }

    pub fn polling(job_id: &JobId, source: PanelError) -> Self {
        PanelError::Polling {
            job_id: job_id.clone(),
            source: Box::new(source),
        }
    }

    /// Message shown next to a job when this error ends up on its record.
    pub fn display_message(&self) -> String {
        match self {
            PanelError::Submission { source, .. } | PanelError::Polling { source, .. } => {
                source.display_message()
            }
            PanelError::JobFailure { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_unwraps_to_the_engine_text() {
        let failure = PanelError::JobFailure {
            job_id: JobId::new("job-4h"),
            message: "insufficient data".to_string(),
        };
        assert_eq!(failure.to_string(), "job job-4h failed: insufficient data");
        assert_eq!(failure.display_message(), "insufficient data");

        let wrapped = PanelError::polling(&JobId::new("job-4h"), failure);
        assert_eq!(wrapped.display_message(), "insufficient data");

        let submission = PanelError::submission(
            "5m",
            PanelError::Api {
                status: 503,
                body: "engine busy".to_string(),
            },
        );
        assert_eq!(submission.display_message(), "API responded with 503: engine busy");
    }
}
