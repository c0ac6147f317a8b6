//! Data models for turbine

pub mod manifest;
pub mod report;
pub mod task;

pub use manifest::{JobManifest, ManifestTask};
pub use report::{JobSummary, TaskReport, TaskStatus};
pub use task::Task;

use regex::Regex;

use crate::error::{Result, TurbineError};

/// Check a name used for jobs, topics, subscriptions and instance prefixes.
///
/// The rule is the intersection of what Pub/Sub, Cloud Storage object
/// prefixes and Compute Engine instance names accept.
pub fn validate_resource_name(name: &str) -> Result<()> {
    lazy_static::lazy_static! {
        static ref NAME_RE: Regex = Regex::new(r"^[a-z][a-z0-9-]{0,62}$").unwrap();
    }

    if !NAME_RE.is_match(name) {
        return Err(TurbineError::invalid_name(
            name,
            "must start with a lowercase letter and contain only lowercase letters, digits and '-' (max 63 chars)",
        ));
    }
    if name.ends_with('-') {
        return Err(TurbineError::invalid_name(name, "must not end with '-'"));
    }
    Ok(())
}

/// Object paths inside the result store
pub mod paths {
    /// Prefix holding everything for a job
    pub fn job_prefix(job: &str) -> String {
        format!("jobs/{}/", job)
    }

    /// Stored job manifest
    pub fn manifest(job: &str) -> String {
        format!("jobs/{}/manifest.json", job)
    }

    /// Prefix of the uploaded support files
    pub fn bundle_prefix(job: &str) -> String {
        format!("jobs/{}/bundle/", job)
    }

    /// Prefix of the final task reports
    pub fn results_prefix(job: &str) -> String {
        format!("jobs/{}/results/", job)
    }

    /// Final report of a task
    pub fn report(job: &str, task_id: &str) -> String {
        format!("jobs/{}/results/{}.json", job, task_id)
    }

    /// Prefix of a task's captured output
    pub fn output_prefix(job: &str, task_id: &str) -> String {
        format!("jobs/{}/output/{}/", job, task_id)
    }

    /// Captured stdout of a task
    pub fn stdout(job: &str, task_id: &str) -> String {
        format!("jobs/{}/output/{}/stdout", job, task_id)
    }

    /// Captured stderr of a task
    pub fn stderr(job: &str, task_id: &str) -> String {
        format!("jobs/{}/output/{}/stderr", job, task_id)
    }

    /// Stderr of a failed attempt that was retried
    pub fn attempt_stderr(job: &str, task_id: &str, attempt: u32) -> String {
        format!("jobs/{}/output/{}/attempt-{}.stderr", job, task_id, attempt)
    }
}
