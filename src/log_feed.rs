//! Live log feed shared by every job of a batch.
//!
//! The feed shows the cumulative log of whichever job reported last, each
//! line tagged with that job's timeframe. Snapshots carry no timestamps, so
//! there is no cross-job interleave: the last writer replaces the feed.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLine {
    pub timeframe: String,
    pub line: String,
}

impl FeedLine {
    pub fn tagged(&self) -> String {
        format!("[{}] {}", self.timeframe, self.line)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogAggregator {
    lines: Vec<FeedLine>,
    source: Option<String>,
}

impl LogAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the feed with `logs` tagged as `timeframe`.
    pub fn apply(&mut self, timeframe: &str, logs: &[String]) {
        self.lines = logs
            .iter()
            .map(|line| FeedLine {
                timeframe: timeframe.to_string(),
                line: line.clone(),
            })
            .collect();
        self.source = Some(timeframe.to_string());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.source = None;
    }

    pub fn lines(&self) -> &[FeedLine] {
        &self.lines
    }

    /// Timeframe whose log is currently shown.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}
