//! The task worker
//!
//! A worker pulls task messages, runs each command with [`ShellExecutor`],
//! stores the outcome and only then acknowledges the message. Delivery is
//! at-least-once, so a task whose final report already exists is acked
//! without running again.
//!
//! Failed attempts are retried by publishing the task again with its
//! attempt number bumped; the final attempt writes a failed report.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::backend::{put_json, Delivery, LogRecord, LogSink, ResultStore, Severity, TaskQueue};
use crate::config::Config;
use crate::error::{Result, TurbineError};
use crate::executor::{Execution, ShellExecutor};
use crate::models::{paths, Task, TaskReport, TaskStatus};

/// Knobs for a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Name recorded in reports and log labels
    pub name: String,
    /// Tasks run at once
    pub concurrency: usize,
    /// Messages requested per pull
    pub pull_batch: usize,
    /// Wait after an empty pull
    pub poll_interval: Duration,
    /// Consecutive empty pulls with nothing running before exiting (0 = never)
    pub idle_polls: u32,
    /// Message lease, renewed at half-time while a task runs
    pub lease: Duration,
    /// Where job bundles are unpacked and commands run
    pub work_dir: PathBuf,
    /// Shell override
    pub shell: Option<String>,
    /// Only run tasks of this job; others are released back to the queue
    pub job: Option<String>,
}

impl WorkerSettings {
    /// Settings from configuration
    pub fn from_config(config: &Config, name: &str) -> Self {
        Self {
            name: name.to_string(),
            concurrency: config.worker.concurrency.max(1),
            pull_batch: config.worker.pull_batch.max(1),
            poll_interval: Duration::from_secs(config.worker.poll_interval),
            idle_polls: config.worker.idle_polls,
            lease: Duration::from_secs(config.worker.ack_deadline.max(10)),
            work_dir: config.work_dir(),
            shell: config.worker.shell.clone(),
            job: None,
        }
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
    /// Attempt failed and the task was queued again
    Retried,
    /// Task already had a final report
    Duplicate,
    /// Message could not be decoded and was dropped
    Poisoned,
    /// Storing the outcome failed; the message was released
    Errored,
}

/// Why the worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Shutdown was requested
    #[default]
    Shutdown,
    /// No work for the configured number of polls
    Idle,
}

/// Counters reported when a worker stops
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub retried: usize,
    pub duplicates: usize,
    pub poisoned: usize,
    pub errors: usize,
    pub exit: ExitReason,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Duplicate => self.duplicates += 1,
            Outcome::Poisoned => self.poisoned += 1,
            Outcome::Errored => self.errors += 1,
        }
    }

    /// Tasks that reached a final report on this worker
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Pulls and runs tasks
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn ResultStore>,
    logs: Arc<dyn LogSink>,
    executor: ShellExecutor,
    settings: WorkerSettings,
    prepared: Mutex<HashSet<String>>,
}

impl Worker {
    /// Create a worker
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn ResultStore>,
        logs: Arc<dyn LogSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            logs,
            executor: ShellExecutor::new(settings.shell.clone()),
            settings,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Pull and run tasks until shutdown or, if configured, until idle
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<WorkerStats> {
        let slots = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut running: JoinSet<Outcome> = JoinSet::new();
        let mut stats = WorkerStats::default();
        let mut idle = 0u32;

        tracing::info!(
            worker = %self.settings.name,
            concurrency = self.settings.concurrency,
            "Worker started"
        );

        loop {
            while let Some(joined) = running.try_join_next() {
                record_joined(&mut stats, joined);
            }

            if shutdown.is_cancelled() {
                break;
            }

            let free = slots.available_permits();
            if free == 0 {
                tokio::select! {
                    joined = running.join_next() => {
                        if let Some(joined) = joined {
                            record_joined(&mut stats, joined);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }

            let max = free.min(self.settings.pull_batch);
            let pulled = tokio::select! {
                pulled = self.queue.pull(max) => pulled,
                _ = shutdown.cancelled() => break,
            };

            let deliveries = match pulled {
                Ok(deliveries) => self.claim(deliveries).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Pull failed");
                    if self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                if running.is_empty() {
                    idle += 1;
                    if self.settings.idle_polls > 0 && idle >= self.settings.idle_polls {
                        tracing::info!(polls = idle, "No work left, stopping");
                        stats.exit = ExitReason::Idle;
                        break;
                    }
                }
                if self.pause(&shutdown).await {
                    break;
                }
                continue;
            }

            idle = 0;
            for delivery in deliveries {
                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker = Arc::clone(&self);
                running.spawn(async move {
                    let _permit = permit;
                    worker.handle(delivery).await
                });
            }
        }

        if !running.is_empty() {
            tracing::info!(running = running.len(), "Waiting for running tasks");
        }
        while let Some(joined) = running.join_next().await {
            record_joined(&mut stats, joined);
        }

        if let Err(e) = self.logs.flush().await {
            tracing::warn!(error = %e, "Could not flush task logs");
        }

        tracing::info!(
            worker = %self.settings.name,
            succeeded = stats.succeeded,
            failed = stats.failed + stats.timed_out,
            retried = stats.retried,
            "Worker stopped"
        );
        Ok(stats)
    }

    /// Keep the deliveries this worker runs, releasing those of other jobs
    async fn claim(&self, deliveries: Vec<Delivery>) -> Vec<Delivery> {
        let Some(job) = &self.settings.job else {
            return deliveries;
        };

        // messages without a job attribute stay so the poison path can drop them
        let (mine, others): (Vec<_>, Vec<_>) = deliveries
            .into_iter()
            .partition(|d| d.attributes.get("job").map_or(true, |j| j == job));

        if !others.is_empty() {
            let ids: Vec<String> = others.into_iter().map(|d| d.ack_id).collect();
            tracing::debug!(count = ids.len(), job = %job, "Releasing tasks of other jobs");
            if let Err(e) = self.queue.release(&ids).await {
                tracing::warn!(error = %e, "Could not release messages");
            }
        }
        mine
    }

    /// Sleep for the poll interval; true if shutdown was requested meanwhile
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => false,
            _ = shutdown.cancelled() => true,
        }
    }

    /// Process one delivery, releasing it if its outcome could not be stored
    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        match self.process(&delivery).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(ack_id = %delivery.ack_id, error = %e, "Could not process task");
                if let Err(e) = self.queue.release(&[delivery.ack_id.clone()]).await {
                    tracing::warn!(error = %e, "Could not release message");
                }
                Outcome::Errored
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<Outcome> {
        let ack_ids = [delivery.ack_id.clone()];

        let task = match Task::decode(&delivery.data) {
            Ok(task) => task,
            Err(e) => {
                let job = delivery.attributes.get("job").cloned().unwrap_or_default();
                self.logs
                    .emit(
                        LogRecord::new(Severity::Error, &job, "Dropping undecodable message")
                            .field("error", e.to_string())
                            .field("worker", self.settings.name.as_str()),
                    )
                    .await;
                self.queue.ack(&ack_ids).await?;
                return Ok(Outcome::Poisoned);
            }
        };

        if self.store.exists(&paths::report(&task.job, &task.id)).await? {
            tracing::info!(task_id = %task.id, "Task already has a report, skipping");
            self.queue.ack(&ack_ids).await?;
            return Ok(Outcome::Duplicate);
        }

        let workdir = self.prepare_job(&task.job).await?;

        let keeper = self.spawn_lease_keeper(delivery.ack_id.clone());
        let execution = self.executor.run(&task, &workdir).await;
        let recorded = self.record(&task, &execution).await;
        keeper.abort();

        let outcome = recorded?;
        self.queue.ack(&ack_ids).await?;
        Ok(outcome)
    }

    /// Keep a message leased while its task runs
    fn spawn_lease_keeper(&self, ack_id: String) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let lease = self.settings.lease;
        let every = lease / 2;

        tokio::spawn(async move {
            let ids = [ack_id];
            loop {
                tokio::time::sleep(every).await;
                if let Err(e) = queue.extend(&ids, lease).await {
                    tracing::warn!(ack_id = %ids[0], error = %e, "Could not extend lease");
                }
            }
        })
    }

    /// Store the outcome of an attempt: a retry or a final report
    async fn record(&self, task: &Task, execution: &Execution) -> Result<Outcome> {
        if !execution.status.is_success() && !task.is_last_attempt() {
            let next = task.next_attempt();
            self.store
                .put(
                    &paths::attempt_stderr(&task.job, &task.id, task.attempt),
                    execution.stderr.clone(),
                    "text/plain",
                )
                .await?;
            self.queue.publish(std::slice::from_ref(&next)).await?;

            self.logs
                .emit(
                    LogRecord::new(Severity::Warning, &task.job, "Task attempt failed, retrying")
                        .task(&task.id)
                        .field("attempt", task.attempt)
                        .field("next_attempt", next.attempt)
                        .field("status", execution.status.to_string())
                        .field("exit_code", execution.exit_code)
                        .field("worker", self.settings.name.as_str()),
                )
                .await;
            return Ok(Outcome::Retried);
        }

        let stdout_object = paths::stdout(&task.job, &task.id);
        let stderr_object = paths::stderr(&task.job, &task.id);
        self.store
            .put(&stdout_object, execution.stdout.clone(), "text/plain")
            .await?;
        self.store
            .put(&stderr_object, execution.stderr.clone(), "text/plain")
            .await?;

        let report = TaskReport {
            task_id: task.id.clone(),
            job: task.job.clone(),
            index: task.index,
            command: task.command.clone(),
            attempt: task.attempt,
            status: execution.status,
            exit_code: execution.exit_code,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            duration_ms: execution.duration.as_millis() as u64,
            worker: self.settings.name.clone(),
            stdout_object,
            stderr_object,
            stdout_sha256: hex::encode(Sha256::digest(&execution.stdout)),
            stderr_sha256: hex::encode(Sha256::digest(&execution.stderr)),
            error: execution.error.clone(),
        };

        // the report is written last; its presence marks the task finished
        put_json(self.store.as_ref(), &paths::report(&task.job, &task.id), &report).await?;

        let (severity, message) = match execution.status {
            TaskStatus::Succeeded => (Severity::Info, "Task succeeded"),
            TaskStatus::Failed => (Severity::Error, "Task failed"),
            TaskStatus::TimedOut => (Severity::Error, "Task timed out"),
        };
        self.logs
            .emit(
                LogRecord::new(severity, &task.job, message)
                    .task(&task.id)
                    .field("attempt", task.attempt)
                    .field("exit_code", execution.exit_code)
                    .field("duration_ms", report.duration_ms)
                    .field("worker", self.settings.name.as_str()),
            )
            .await;

        Ok(match execution.status {
            TaskStatus::Succeeded => Outcome::Succeeded,
            TaskStatus::Failed => Outcome::Failed,
            TaskStatus::TimedOut => Outcome::TimedOut,
        })
    }

    /// Create the job's working directory and unpack its bundle once
    async fn prepare_job(&self, job: &str) -> Result<PathBuf> {
        let workdir = self.settings.work_dir.join(job);
        let mut prepared = self.prepared.lock().await;
        if prepared.contains(job) {
            return Ok(workdir);
        }

        tokio::fs::create_dir_all(&workdir).await?;

        let prefix = paths::bundle_prefix(job);
        let objects = self.store.list(&prefix).await?;
        for object in &objects {
            let Some(relative) = object.strip_prefix(&prefix) else {
                continue;
            };
            let target = bundle_target(&workdir, relative)?;
            let data = self.store.get(object).await?;
            let executable = looks_executable(relative, &data);
            tokio::task::spawn_blocking(move || install_file(&target, &data, executable))
                .await
                .map_err(|e| TurbineError::Other(e.to_string()))??;
        }

        if !objects.is_empty() {
            tracing::info!(job, files = objects.len(), dir = %workdir.display(), "Unpacked job bundle");
        }
        prepared.insert(job.to_string());
        Ok(workdir)
    }
}

fn record_joined(stats: &mut WorkerStats, joined: std::result::Result<Outcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => stats.record(outcome),
        Err(e) => {
            tracing::error!(error = %e, "Task handler panicked");
            stats.errors += 1;
        }
    }
}

/// Resolve a bundle path inside the work directory
fn bundle_target(workdir: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let valid = !relative.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(TurbineError::invalid_name(relative, "bundle paths must stay inside the job directory"));
    }
    Ok(workdir.join(path))
}

fn looks_executable(name: &str, data: &[u8]) -> bool {
    name.ends_with(".sh") || data.starts_with(b"#!")
}

/// Write a bundle file beside its target and rename it into place, so a
/// script another task is running is replaced rather than truncated
fn install_file(target: &Path, data: &[u8], executable: bool) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| TurbineError::invalid_name(target.display().to_string(), "no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(data)?;
    if executable {
        mark_executable(file.path())?;
    }
    file.persist(target).map_err(|e| TurbineError::Io(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Best-effort name of this machine
pub fn worker_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(name) = std::env::var("COMPUTERNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{get_json, LocalStore, MemoryQueue, TracingSink};
    use crate::config::WorkerConfig;
    use crate::models::JobManifest;
    use chrono::Utc;

    struct Harness {
        _dir: tempfile::TempDir,
        queue: MemoryQueue,
        store: LocalStore,
        worker: Arc<Worker>,
    }

    fn harness(concurrency: usize) -> Harness {
        harness_with(concurrency, None, Duration::from_secs(30))
    }

    fn harness_for(concurrency: usize, job: Option<&str>) -> Harness {
        harness_with(concurrency, job, Duration::from_secs(30))
    }

    fn harness_with(concurrency: usize, job: Option<&str>, lease: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new(lease);
        let store = LocalStore::new(&dir.path().join("store"));
        let settings = WorkerSettings {
            name: "test-worker".to_string(),
            concurrency,
            pull_batch: 4,
            poll_interval: Duration::from_millis(10),
            idle_polls: 3,
            lease,
            work_dir: dir.path().join("work"),
            shell: None,
            job: job.map(str::to_string),
        };
        let worker = Arc::new(Worker::new(
            Arc::new(queue.clone()),
            Arc::new(store.clone()),
            Arc::new(TracingSink),
            settings,
        ));
        Harness {
            _dir: dir,
            queue,
            store,
            worker,
        }
    }

    fn tasks(job: &str, content: &str, max_attempts: u32) -> Vec<Task> {
        let defaults = WorkerConfig {
            max_attempts,
            task_timeout: 10,
            ..WorkerConfig::default()
        };
        JobManifest::from_text(job, content)
            .unwrap()
            .expand(&defaults, Utc::now())
    }

    #[tokio::test]
    async fn test_runs_all_tasks_until_idle() {
        let h = harness(2);
        h.queue
            .publish(&tasks("ok", "echo one\necho two\necho three\n", 1))
            .await
            .unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.exit, ExitReason::Idle);
        assert!(h.queue.is_drained());

        let report: TaskReport = get_json(&h.store, &paths::report("ok", "ok-00001")).await.unwrap();
        assert_eq!(report.status, TaskStatus::Succeeded);
        assert_eq!(report.worker, "test-worker");
        assert_eq!(h.store.get(&report.stdout_object).await.unwrap(), b"two\n");
        assert_eq!(report.stdout_sha256, hex::encode(Sha256::digest(b"two\n")));
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_then_reported() {
        let h = harness(1);
        h.queue
            .publish(&tasks("flaky", "echo attempt $TURBINE_ATTEMPT >&2; exit 4\n", 3))
            .await
            .unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(h.queue.published(), 3);

        let report: TaskReport = get_json(&h.store, &paths::report("flaky", "flaky-00000"))
            .await
            .unwrap();
        assert_eq!(report.attempt, 3);
        assert_eq!(report.exit_code, Some(4));

        let first = h
            .store
            .get(&paths::attempt_stderr("flaky", "flaky-00000", 1))
            .await
            .unwrap();
        assert_eq!(first, b"attempt 1\n");
        assert!(!h
            .store
            .exists(&paths::attempt_stderr("flaky", "flaky-00000", 3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_retry_can_succeed() {
        let h = harness(1);
        h.queue
            .publish(&tasks("retry", "test $TURBINE_ATTEMPT -ge 2\n", 3))
            .await
            .unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.succeeded, 1);

        let report: TaskReport = get_json(&h.store, &paths::report("retry", "retry-00000"))
            .await
            .unwrap();
        assert_eq!(report.attempt, 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let h = harness(1);
        let batch = tasks("dup", "echo once >> ../dup-count\n", 1);
        h.queue.publish(&batch).await.unwrap();
        h.queue.publish(&batch).await.unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.duplicates, 1);
    }

    /// Store that accepts nothing
    struct BrokenStore;

    #[async_trait::async_trait]
    impl ResultStore for BrokenStore {
        async fn put(&self, name: &str, _data: Vec<u8>, _content_type: &str) -> Result<()> {
            Err(TurbineError::Other(format!("disk full writing {}", name)))
        }
        async fn get(&self, name: &str) -> Result<Vec<u8>> {
            Err(TurbineError::NotFound(name.to_string()))
        }
        async fn exists(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unstored_outcome_is_released_not_acked() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let mut settings = WorkerSettings::from_config(&Config::default(), "broken");
        settings.work_dir = dir.path().join("work");
        let worker = Worker::new(
            Arc::new(queue.clone()),
            Arc::new(BrokenStore),
            Arc::new(TracingSink),
            settings,
        );

        queue.publish(&tasks("lost", "echo result\n", 1)).await.unwrap();
        let delivery = queue.pull(1).await.unwrap().remove(0);

        assert_eq!(worker.handle(delivery).await, Outcome::Errored);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.ready(), 1);

        let again = queue.pull(1).await.unwrap();
        assert_eq!(Task::decode(&again[0].data).unwrap().id, "lost-00000");
    }

    #[tokio::test]
    async fn test_lease_is_kept_while_task_runs() {
        let h = harness_with(2, None, Duration::from_millis(200));
        h.queue.publish(&tasks("slow", "sleep 1\n", 1)).await.unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(h.queue.redelivered(), 0);
    }

    #[tokio::test]
    async fn test_binary_output_is_stored_verbatim() {
        let h = harness(1);
        h.queue
            .publish(&tasks("raw", "printf '\\377\\376\\000x'\n", 1))
            .await
            .unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 1);

        let stdout = h.store.get(&paths::stdout("raw", "raw-00000")).await.unwrap();
        assert_eq!(stdout, vec![0xff, 0xfe, 0x00, b'x']);
        let report: TaskReport = get_json(&h.store, &paths::report("raw", "raw-00000")).await.unwrap();
        assert_eq!(report.stdout_sha256, hex::encode(Sha256::digest([0xffu8, 0xfe, 0x00, b'x'])));
    }

    #[tokio::test]
    async fn test_poison_message_is_dropped() {
        let h = harness(1);
        h.queue.publish_raw(b"garbage".to_vec()).unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.poisoned, 1);
        assert!(h.queue.is_drained());
    }

    #[tokio::test]
    async fn test_job_filter_releases_other_jobs() {
        let h = harness_for(1, Some("mine"));
        h.queue.publish(&tasks("other", "echo a\necho b\n", 1)).await.unwrap();
        h.queue.publish(&tasks("mine", "echo c\necho d\n", 1)).await.unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.exit, ExitReason::Idle);
        assert_eq!(h.queue.ready(), 2);
        assert_eq!(h.queue.in_flight(), 0);
        assert!(!h.store.exists(&paths::report("other", "other-00000")).await.unwrap());
    }

    #[tokio::test]
    async fn test_bundle_is_unpacked_into_workdir() {
        let h = harness(1);
        h.store
            .put(
                "jobs/bundled/bundle/bin/run.sh",
                b"#!/bin/sh\necho from bundle $1\n".to_vec(),
                "text/plain",
            )
            .await
            .unwrap();
        h.queue
            .publish(&tasks("bundled", "./bin/run.sh 9\n", 1))
            .await
            .unwrap();

        let stats = Arc::clone(&h.worker).run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        let stdout = h.store.get(&paths::stdout("bundled", "bundled-00000")).await.unwrap();
        assert_eq!(stdout, b"from bundle 9\n");
    }

    #[tokio::test]
    async fn test_shutdown_stops_pulling() {
        let h = harness(1);
        h.queue.publish(&tasks("stop", "echo a\necho b\n", 1)).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let stats = Arc::clone(&h.worker).run(token).await.unwrap();
        assert_eq!(stats.exit, ExitReason::Shutdown);
        assert_eq!(stats.completed(), 0);
        assert_eq!(h.queue.ready(), 2);
    }

    #[test]
    fn test_bundle_target_rejects_escape() {
        let root = Path::new("/tmp/work/job");
        assert!(bundle_target(root, "data/in.txt").is_ok());
        assert!(bundle_target(root, "../other").is_err());
        assert!(bundle_target(root, "").is_err());
    }
}
