//! Running a whole job on this machine
//!
//! `turbine local` wires the same dispatcher, workers and collector used in
//! the cloud to an in-memory queue and a directory store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::{LocalStore, MemoryQueue, ResultStore, TracingSink};
use crate::collector;
use crate::config::Config;
use crate::dispatcher::{self, SubmitOptions};
use crate::error::{Result, TurbineError};
use crate::models::{JobManifest, JobSummary};
use crate::worker::{Worker, WorkerSettings, WorkerStats};

/// Options for [`run_local`]
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Number of workers
    pub workers: usize,
    /// Directory holding the store (manifests, outputs, reports)
    pub output: std::path::PathBuf,
    /// Optional bundle directory
    pub bundle: Option<std::path::PathBuf>,
    /// Replace previous results for the same job
    pub force: bool,
}

/// Submit a job to local workers and wait for it to finish
pub async fn run_local(
    manifest: &JobManifest,
    config: &Config,
    options: &LocalOptions,
    shutdown: CancellationToken,
) -> Result<(JobSummary, Vec<WorkerStats>)> {
    if options.workers == 0 {
        return Err(TurbineError::config("at least one worker is required"));
    }

    let lease = Duration::from_secs(config.worker.ack_deadline.max(10));
    let queue = MemoryQueue::new(lease);
    let store = LocalStore::new(&store_dir(&options.output));

    let submit_options = SubmitOptions {
        bundle: options.bundle.clone(),
        force: options.force,
    };
    dispatcher::submit(manifest, &config.worker, &queue, &store, &submit_options, None).await?;

    let queue = Arc::new(queue);
    let shared_store: Arc<dyn ResultStore> = Arc::new(store);

    let mut handles = Vec::with_capacity(options.workers);
    for index in 0..options.workers {
        let mut settings = WorkerSettings::from_config(config, &format!("local-{}", index));
        settings.work_dir = options.output.join("work").join(&settings.name);
        settings.poll_interval = Duration::from_millis(100);
        settings.idle_polls = 3;

        let worker = Arc::new(Worker::new(
            queue.clone(),
            Arc::clone(&shared_store),
            Arc::new(TracingSink),
            settings,
        ));
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    let mut stats = Vec::with_capacity(handles.len());
    for handle in handles {
        stats.push(handle.await.map_err(|e| TurbineError::Other(e.to_string()))??);
    }

    let (summary, _) = collector::status(shared_store, &manifest.name).await?;
    Ok((summary, stats))
}

/// Store directory used by [`run_local`] under an output directory
pub fn store_dir(output: &Path) -> std::path::PathBuf {
    output.join("store")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workers_share_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("run.sh"), "#!/bin/sh\nsleep 0.1\necho task $1\n").unwrap();

        let content: String = (0..16).map(|i| format!("./run.sh {}\n", i)).collect();
        let manifest = JobManifest::from_text("bundled", &content).unwrap();

        let mut config = Config::default();
        config.worker.max_attempts = 1;
        config.worker.task_timeout = 30;

        let options = LocalOptions {
            workers: 8,
            output: dir.path().join("out"),
            bundle: Some(bundle),
            force: false,
        };

        let (summary, stats) = run_local(&manifest, &config, &options, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 16);
        assert_eq!(summary.failed, 0);
        assert_eq!(stats.iter().map(|s| s.errors).sum::<usize>(), 0);
        let unpacked = std::fs::read_dir(dir.path().join("out/work"))
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().path().join("bundled/run.sh").exists())
            .count();
        assert!(unpacked >= 1);
    }

    #[tokio::test]
    async fn test_local_run_completes_job() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JobManifest::from_text(
            "local",
            "echo a\necho b\nexit 1\necho c\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.worker.max_attempts = 2;
        config.worker.task_timeout = 10;

        let options = LocalOptions {
            workers: 2,
            output: dir.path().to_path_buf(),
            bundle: None,
            force: false,
        };

        let (summary, stats) = run_local(&manifest, &config, &options, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_complete());
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.iter().map(|s| s.retried).sum::<usize>(), 1);
        assert!(store_dir(dir.path()).join("jobs/local/manifest.json").exists());
    }
}
