//! Job manifest parsing
//!
//! A job is described either by a plain text file with one shell command
//! per line, or by a TOML file with per-task overrides:
//!
//! ```toml
//! name = "sweep"
//! timeout_secs = 600
//! max_attempts = 3
//!
//! [env]
//! SEED = "1"
//!
//! [[task]]
//! command = "./run.sh 1"
//! timeout_secs = 60
//! ```
//!
//! In the text form blank lines and lines starting with `#` are skipped and a
//! trailing `\` continues the command on the next line.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{validate_resource_name, Task};
use crate::config::WorkerConfig;
use crate::error::{Result, TurbineError};

/// A job: a named list of shell commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobManifest {
    /// Job name
    pub name: String,
    /// Default timeout for tasks in this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Default attempts for tasks in this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Environment shared by every task
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// The tasks, in order
    #[serde(rename = "task", default)]
    pub tasks: Vec<ManifestTask>,
}

/// One entry of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTask {
    /// Shell command line
    pub command: String,
    /// Timeout override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Environment added on top of the job environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ManifestTask {
    /// A task with only a command
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }
}

impl JobManifest {
    /// Load a manifest from disk.
    ///
    /// `.toml` files are parsed as TOML, anything else as a command list.
    /// `name` overrides the job name; for command lists the file stem is
    /// used otherwise.
    pub fn load(path: &Path, name: Option<&str>) -> Result<Self> {
        if !path.exists() {
            return Err(TurbineError::file_not_found(path));
        }
        let content = std::fs::read_to_string(path)?;

        let mut manifest = if path.extension().map_or(false, |ext| ext == "toml") {
            Self::from_toml(&content)?
        } else {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            Self::from_text(name.unwrap_or(&stem), &content)?
        };

        if let Some(name) = name {
            manifest.name = name.to_string();
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a TOML manifest
    pub fn from_toml(content: &str) -> Result<Self> {
        let manifest: JobManifest = toml::from_str(content)?;
        Ok(manifest)
    }

    /// Parse a command list
    pub fn from_text(name: &str, content: &str) -> Result<Self> {
        let mut tasks = Vec::new();
        let mut pending = String::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if pending.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
                continue;
            }

            if let Some(head) = trimmed.strip_suffix('\\') {
                pending.push_str(head.trim_end());
                pending.push(' ');
                continue;
            }

            pending.push_str(trimmed);
            let command = std::mem::take(&mut pending);
            let command = command.trim();
            if !command.is_empty() {
                tasks.push(ManifestTask::new(command));
            }
        }

        if !pending.trim().is_empty() {
            return Err(TurbineError::manifest(
                "last command ends with a line continuation",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            timeout_secs: None,
            max_attempts: None,
            env: BTreeMap::new(),
            tasks,
        })
    }

    /// Check the manifest can be submitted
    pub fn validate(&self) -> Result<()> {
        validate_resource_name(&self.name)?;

        if self.tasks.is_empty() {
            return Err(TurbineError::manifest(format!("job '{}' has no tasks", self.name)));
        }
        if self.max_attempts == Some(0) {
            return Err(TurbineError::manifest("max_attempts must be at least 1"));
        }
        if self.timeout_secs == Some(0) {
            return Err(TurbineError::manifest("timeout_secs must be at least 1"));
        }

        for (index, task) in self.tasks.iter().enumerate() {
            if task.command.trim().is_empty() {
                return Err(TurbineError::manifest(format!("task {} has an empty command", index)));
            }
            if task.timeout_secs == Some(0) {
                return Err(TurbineError::manifest(format!("task {} has a zero timeout", index)));
            }
        }

        let keys = self.env.keys().chain(self.tasks.iter().flat_map(|t| t.env.keys()));
        for key in keys {
            if key.is_empty() || key.contains('=') || key.starts_with("TURBINE_") {
                return Err(TurbineError::manifest(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the manifest has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Expand the manifest into first-attempt tasks
    pub fn expand(&self, defaults: &WorkerConfig, submitted_at: DateTime<Utc>) -> Vec<Task> {
        let max_attempts = self.max_attempts.unwrap_or(defaults.max_attempts).max(1);
        let job_timeout = self.timeout_secs.unwrap_or(defaults.task_timeout);

        self.tasks
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let mut env = self.env.clone();
                env.extend(entry.env.clone());

                Task {
                    id: Task::make_id(&self.name, index),
                    job: self.name.clone(),
                    index,
                    command: entry.command.clone(),
                    attempt: 1,
                    max_attempts,
                    timeout_secs: entry.timeout_secs.unwrap_or(job_timeout),
                    env,
                    submitted_at,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_manifest() {
        let content = "\
# parameter sweep
./run.sh 1

./run.sh 2 \\
    --verbose
  # indented comment
./run.sh 3
";
        let manifest = JobManifest::from_text("sweep", content).unwrap();
        let commands: Vec<_> = manifest.tasks.iter().map(|t| t.command.as_str()).collect();
        assert_eq!(commands, vec!["./run.sh 1", "./run.sh 2 --verbose", "./run.sh 3"]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_dangling_continuation() {
        assert!(JobManifest::from_text("sweep", "echo a \\\n").is_err());
    }

    #[test]
    fn test_empty_manifest_is_rejected() {
        let manifest = JobManifest::from_text("sweep", "# nothing\n\n").unwrap();
        assert!(manifest.is_empty());
        assert!(matches!(manifest.validate(), Err(TurbineError::Manifest(_))));
    }

    #[test]
    fn test_toml_manifest_and_expand() {
        let content = r#"
name = "sweep"
timeout_secs = 600
max_attempts = 2

[env]
SEED = "1"

[[task]]
command = "./run.sh a"

[[task]]
command = "./run.sh b"
timeout_secs = 5
env = { SEED = "2", EXTRA = "x" }
"#;
        let manifest = JobManifest::from_toml(content).unwrap();
        manifest.validate().unwrap();

        let tasks = manifest.expand(&WorkerConfig::default(), Utc::now());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "sweep-00000");
        assert_eq!(tasks[0].timeout_secs, 600);
        assert_eq!(tasks[0].max_attempts, 2);
        assert_eq!(tasks[0].env.get("SEED").map(String::as_str), Some("1"));
        assert_eq!(tasks[1].timeout_secs, 5);
        assert_eq!(tasks[1].env.get("SEED").map(String::as_str), Some("2"));
        assert_eq!(tasks[1].env.get("EXTRA").map(String::as_str), Some("x"));
        assert!(tasks.iter().all(|t| t.attempt == 1));
    }

    #[test]
    fn test_expand_uses_worker_defaults() {
        let manifest = JobManifest::from_text("sweep", "true\n").unwrap();
        let defaults = WorkerConfig {
            task_timeout: 42,
            max_attempts: 5,
            ..WorkerConfig::default()
        };
        let tasks = manifest.expand(&defaults, Utc::now());
        assert_eq!(tasks[0].timeout_secs, 42);
        assert_eq!(tasks[0].max_attempts, 5);
    }

    #[test]
    fn test_reserved_env_is_rejected() {
        let mut manifest = JobManifest::from_text("sweep", "true\n").unwrap();
        manifest.env.insert("TURBINE_JOB".to_string(), "x".to_string());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_load_uses_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Sweep.txt");
        std::fs::write(&path, "echo 1\necho 2\n").unwrap();

        let manifest = JobManifest::load(&path, None).unwrap();
        assert_eq!(manifest.name, "sweep");
        assert_eq!(manifest.len(), 2);

        let renamed = JobManifest::load(&path, Some("other")).unwrap();
        assert_eq!(renamed.name, "other");

        assert!(JobManifest::load(&dir.path().join("missing.txt"), None).is_err());
    }
}
