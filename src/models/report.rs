//! Task outcomes and job summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final state of a task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Exited with status 0
    Succeeded,
    /// Exited non-zero or could not be started
    Failed,
    /// Killed after exceeding its timeout
    TimedOut,
}

impl TaskStatus {
    /// True for a zero exit status
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// The stored record of a task's final attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub job: String,
    pub index: usize,
    pub command: String,
    pub attempt: u32,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Host that ran the task
    pub worker: String,
    pub stdout_object: String,
    pub stderr_object: String,
    pub stdout_sha256: String,
    pub stderr_sha256: String,
    /// Spawn failure or other message not captured in stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub pending: usize,
}

impl JobSummary {
    /// Build a summary from the reports found for a job of `total` tasks
    pub fn from_reports<'a>(
        job: &str,
        total: usize,
        reports: impl IntoIterator<Item = &'a TaskReport>,
    ) -> Self {
        let mut summary = Self {
            job: job.to_string(),
            total,
            ..Self::default()
        };

        for report in reports {
            match report.status {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::TimedOut => summary.timed_out += 1,
            }
        }

        summary.pending = total.saturating_sub(summary.finished());
        summary
    }

    /// Tasks with a final report
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }

    /// True when every task has a final report
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Percentage of finished tasks
    pub fn percent_done(&self) -> f32 {
        (self.finished() as f32 / self.total.max(1) as f32) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: TaskStatus) -> TaskReport {
        let now = Utc::now();
        TaskReport {
            task_id: "j-00000".to_string(),
            job: "j".to_string(),
            index: 0,
            command: "true".to_string(),
            attempt: 1,
            status,
            exit_code: Some(0),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            worker: "host".to_string(),
            stdout_object: String::new(),
            stderr_object: String::new(),
            stdout_sha256: String::new(),
            stderr_sha256: String::new(),
            error: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let reports = vec![
            report(TaskStatus::Succeeded),
            report(TaskStatus::Succeeded),
            report(TaskStatus::Failed),
            report(TaskStatus::TimedOut),
        ];
        let summary = JobSummary::from_reports("j", 6, &reports);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.pending, 2);
        assert!(!summary.is_complete());
        assert!((summary.percent_done() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&TaskStatus::TimedOut).unwrap(), "\"timed_out\"");
        assert_eq!(TaskStatus::TimedOut.to_string(), "timed out");
    }
}
