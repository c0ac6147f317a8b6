//! Configuration management for turbine

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurbineError};
use crate::models::validate_resource_name;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "TURBINE_CONFIG";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cloud project and resource names
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Worker behaviour
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Compute Engine worker fleet
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cloud resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Google Cloud project id
    pub project: Option<String>,
    /// Compute Engine zone for workers
    pub zone: String,
    /// Bucket location used when the bucket is created
    pub location: String,
    /// Pub/Sub topic tasks are published to
    pub topic: String,
    /// Pub/Sub subscription workers pull from
    pub subscription: String,
    /// Cloud Storage bucket for manifests, bundles and results
    pub bucket: Option<String>,
    /// Cloud Logging log name
    pub log_name: String,
    /// Pub/Sub endpoint override (emulator)
    pub pubsub_endpoint: Option<String>,
    /// Cloud Storage endpoint override (emulator)
    pub storage_endpoint: Option<String>,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks run concurrently by one worker
    pub concurrency: usize,
    /// Default task timeout in seconds
    pub task_timeout: u64,
    /// Default attempts per task before it is reported failed
    pub max_attempts: u32,
    /// Pub/Sub ack deadline in seconds
    pub ack_deadline: u64,
    /// Maximum messages requested per pull
    pub pull_batch: usize,
    /// Seconds to wait after an empty pull
    pub poll_interval: u64,
    /// Consecutive empty pulls before the worker exits (0 = never)
    pub idle_polls: u32,
    /// Shell used to run commands
    pub shell: Option<String>,
    /// Directory job bundles are unpacked into
    pub work_dir: Option<PathBuf>,
}

/// Compute Engine fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Machine type of worker instances
    pub machine_type: String,
    /// Boot image project
    pub image_project: String,
    /// Boot image family
    pub image_family: String,
    /// Boot disk size in GB
    pub disk_size_gb: u32,
    /// Prefix for instance names
    pub instance_prefix: String,
    /// Use preemptible instances
    pub preemptible: bool,
    /// Service account email (None = default compute account)
    pub service_account: Option<String>,
    /// Command on the instance that starts a worker
    pub worker_command: String,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// HTTP timeout in seconds
    pub timeout: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Send task logs to Cloud Logging
    pub cloud: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            project: None,
            zone: "us-central1-a".to_string(),
            location: "US".to_string(),
            topic: "turbine-tasks".to_string(),
            subscription: "turbine-workers".to_string(),
            bucket: None,
            log_name: "turbine".to_string(),
            pubsub_endpoint: None,
            storage_endpoint: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            task_timeout: 3600,
            max_attempts: 3,
            ack_deadline: 60,
            pull_batch: 10,
            poll_interval: 5,
            idle_polls: 0,
            shell: None,
            work_dir: None,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            machine_type: "e2-standard-2".to_string(),
            image_project: "debian-cloud".to_string(),
            image_family: "debian-12".to_string(),
            disk_size_gb: 20,
            instance_prefix: "turbine".to_string(),
            preemptible: false,
            service_account: None,
            worker_command: "/usr/local/bin/turbine".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { timeout: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            cloud: true,
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| TurbineError::config("Could not find config directory"))?;
        Ok(config_dir.join("turbine").join("config.toml"))
    }

    /// Resolve an explicit path or fall back to the default location
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::config_path(),
        }
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a file, using defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(project) = std::env::var("GOOGLE_CLOUD_PROJECT") {
            if !project.is_empty() {
                self.cloud.project = Some(project);
            }
        }
        if let Ok(host) = std::env::var("PUBSUB_EMULATOR_HOST") {
            if !host.is_empty() {
                self.cloud.pubsub_endpoint = Some(format!("http://{}", host));
            }
        }
        if let Ok(host) = std::env::var("STORAGE_EMULATOR_HOST") {
            if !host.is_empty() {
                let endpoint = if host.starts_with("http") {
                    host
                } else {
                    format!("http://{}", host)
                };
                self.cloud.storage_endpoint = Some(endpoint);
            }
        }
    }

    /// Save configuration to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| TurbineError::config(e.to_string()))?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Initialize a configuration file
    pub fn init(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(TurbineError::config(
                "Configuration file already exists. Use --force to overwrite.",
            ));
        }

        Self::default().save_to(path)
    }

    /// The configured project id
    pub fn project(&self) -> Result<&str> {
        self.cloud.project.as_deref().ok_or_else(|| {
            TurbineError::config("cloud.project is not set (or export GOOGLE_CLOUD_PROJECT)")
        })
    }

    /// The configured bucket, defaulting to `<project>-turbine`
    pub fn bucket(&self) -> Result<String> {
        match &self.cloud.bucket {
            Some(bucket) => Ok(bucket.clone()),
            None => Ok(format!("{}-turbine", self.project()?)),
        }
    }

    /// HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout)
    }

    /// Check values that would be rejected by the cloud APIs
    pub fn validate(&self) -> Result<()> {
        validate_resource_name(&self.cloud.topic)?;
        validate_resource_name(&self.cloud.subscription)?;
        validate_resource_name(&self.fleet.instance_prefix)?;

        if self.worker.concurrency == 0 {
            return Err(TurbineError::config("worker.concurrency must be at least 1"));
        }
        if self.worker.max_attempts == 0 {
            return Err(TurbineError::config("worker.max_attempts must be at least 1"));
        }
        if !(10..=600).contains(&self.worker.ack_deadline) {
            return Err(TurbineError::config(
                "worker.ack_deadline must be between 10 and 600 seconds",
            ));
        }
        if self.worker.pull_batch == 0 {
            return Err(TurbineError::config("worker.pull_batch must be at least 1"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "cloud.project" => self.cloud.project.clone(),
            "cloud.zone" => Some(self.cloud.zone.clone()),
            "cloud.location" => Some(self.cloud.location.clone()),
            "cloud.topic" => Some(self.cloud.topic.clone()),
            "cloud.subscription" => Some(self.cloud.subscription.clone()),
            "cloud.bucket" => self.cloud.bucket.clone(),
            "cloud.log_name" => Some(self.cloud.log_name.clone()),
            "cloud.pubsub_endpoint" => self.cloud.pubsub_endpoint.clone(),
            "cloud.storage_endpoint" => self.cloud.storage_endpoint.clone(),

            "worker.concurrency" => Some(self.worker.concurrency.to_string()),
            "worker.task_timeout" => Some(self.worker.task_timeout.to_string()),
            "worker.max_attempts" => Some(self.worker.max_attempts.to_string()),
            "worker.ack_deadline" => Some(self.worker.ack_deadline.to_string()),
            "worker.pull_batch" => Some(self.worker.pull_batch.to_string()),
            "worker.poll_interval" => Some(self.worker.poll_interval.to_string()),
            "worker.idle_polls" => Some(self.worker.idle_polls.to_string()),
            "worker.shell" => self.worker.shell.clone(),
            "worker.work_dir" => self.worker.work_dir.as_ref().map(|p| p.display().to_string()),

            "fleet.machine_type" => Some(self.fleet.machine_type.clone()),
            "fleet.image_project" => Some(self.fleet.image_project.clone()),
            "fleet.image_family" => Some(self.fleet.image_family.clone()),
            "fleet.disk_size_gb" => Some(self.fleet.disk_size_gb.to_string()),
            "fleet.instance_prefix" => Some(self.fleet.instance_prefix.clone()),
            "fleet.preemptible" => Some(self.fleet.preemptible.to_string()),
            "fleet.service_account" => self.fleet.service_account.clone(),
            "fleet.worker_command" => Some(self.fleet.worker_command.clone()),

            "network.timeout" => Some(self.network.timeout.to_string()),

            "logging.level" => Some(self.logging.level.clone()),
            "logging.cloud" => Some(self.logging.cloud.to_string()),

            _ => None,
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn optional(value: &str) -> Option<String> {
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }

        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| TurbineError::config(format!("Invalid value for {}: {}", key, value)))
        }

        match key {
            "cloud.project" => self.cloud.project = optional(value),
            "cloud.zone" => self.cloud.zone = value.to_string(),
            "cloud.location" => self.cloud.location = value.to_string(),
            "cloud.topic" => self.cloud.topic = value.to_string(),
            "cloud.subscription" => self.cloud.subscription = value.to_string(),
            "cloud.bucket" => self.cloud.bucket = optional(value),
            "cloud.log_name" => self.cloud.log_name = value.to_string(),
            "cloud.pubsub_endpoint" => self.cloud.pubsub_endpoint = optional(value),
            "cloud.storage_endpoint" => self.cloud.storage_endpoint = optional(value),

            "worker.concurrency" => self.worker.concurrency = parse(key, value)?,
            "worker.task_timeout" => self.worker.task_timeout = parse(key, value)?,
            "worker.max_attempts" => self.worker.max_attempts = parse(key, value)?,
            "worker.ack_deadline" => self.worker.ack_deadline = parse(key, value)?,
            "worker.pull_batch" => self.worker.pull_batch = parse(key, value)?,
            "worker.poll_interval" => self.worker.poll_interval = parse(key, value)?,
            "worker.idle_polls" => self.worker.idle_polls = parse(key, value)?,
            "worker.shell" => self.worker.shell = optional(value),
            "worker.work_dir" => self.worker.work_dir = optional(value).map(PathBuf::from),

            "fleet.machine_type" => self.fleet.machine_type = value.to_string(),
            "fleet.image_project" => self.fleet.image_project = value.to_string(),
            "fleet.image_family" => self.fleet.image_family = value.to_string(),
            "fleet.disk_size_gb" => self.fleet.disk_size_gb = parse(key, value)?,
            "fleet.instance_prefix" => self.fleet.instance_prefix = value.to_string(),
            "fleet.preemptible" => self.fleet.preemptible = parse(key, value)?,
            "fleet.service_account" => self.fleet.service_account = optional(value),
            "fleet.worker_command" => self.fleet.worker_command = value.to_string(),

            "network.timeout" => self.network.timeout = parse(key, value)?,

            "logging.level" => self.logging.level = value.to_string(),
            "logging.cloud" => self.logging.cloud = parse(key, value)?,

            _ => {
                return Err(TurbineError::config(format!(
                    "Unknown configuration key: {}",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Directory job bundles are unpacked into
    pub fn work_dir(&self) -> PathBuf {
        self.worker.work_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("turbine")
                .join("work")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cloud.topic, "turbine-tasks");
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.network.timeout, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_get_set() {
        let mut config = Config::default();

        config.set("cloud.project", "my-proj").unwrap();
        assert_eq!(config.get("cloud.project"), Some("my-proj".to_string()));
        assert_eq!(config.bucket().unwrap(), "my-proj-turbine");

        config.set("worker.concurrency", "8").unwrap();
        assert_eq!(config.get("worker.concurrency"), Some("8".to_string()));

        config.set("cloud.bucket", "").unwrap();
        assert_eq!(config.get("cloud.bucket"), None);

        assert!(config.set("worker.concurrency", "many").is_err());
        assert!(config.set("nope.key", "1").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.worker.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.ack_deadline = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cloud.topic = "Bad Topic".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set("fleet.machine_type", "n2-standard-4").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.fleet.machine_type, "n2-standard-4");

        assert!(Config::init(&path, false).is_err());
        Config::init(&path, true).unwrap();
        let reset = Config::load_from(&path).unwrap();
        assert_eq!(reset.fleet.machine_type, "e2-standard-2");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[worker]\nconcurrency = 4\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.cloud.subscription, "turbine-workers");
    }
}
