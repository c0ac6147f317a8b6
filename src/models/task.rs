//! A single unit of work sent through the task queue

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbineError};

/// A shell command belonging to a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task id, `<job>-<index:05>`
    pub id: String,
    /// Job name
    pub job: String,
    /// Position of the task in the manifest
    pub index: usize,
    /// Shell command line
    pub command: String,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Attempts allowed before the task is reported failed
    pub max_attempts: u32,
    /// Wall-clock limit in seconds
    pub timeout_secs: u64,
    /// Extra environment for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// When the job was submitted
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Build the id of the task at `index` in `job`
    pub fn make_id(job: &str, index: usize) -> String {
        format!("{}-{:05}", job, index)
    }

    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// True if a failure of this attempt is final
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// The same task scheduled for its next attempt
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt = (self.attempt + 1).min(self.max_attempts);
        next
    }

    /// Message attributes published alongside the payload
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("job".to_string(), self.job.clone());
        attrs.insert("task_id".to_string(), self.id.clone());
        attrs.insert("attempt".to_string(), self.attempt.to_string());
        attrs
    }

    /// Serialize the task as a message payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a message payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        let task: Task =
            serde_json::from_slice(data).map_err(|e| TurbineError::TaskDecode(e.to_string()))?;
        if task.attempt == 0 || task.max_attempts == 0 || task.attempt > task.max_attempts {
            return Err(TurbineError::TaskDecode(format!(
                "task {} has invalid attempt {}/{}",
                task.id, task.attempt, task.max_attempts
            )));
        }
        Ok(task)
    }
}
