//! Job progress and result collection

use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::ProgressBar;
use tokio::task::JoinSet;

use crate::backend::{get_json, ResultStore};
use crate::error::{Result, TurbineError};
use crate::models::{paths, JobManifest, JobSummary, TaskReport};

/// Objects fetched at once
const FETCH_CONCURRENCY: usize = 16;

/// Load the stored manifest of a job
pub async fn load_manifest(store: &dyn ResultStore, job: &str) -> Result<JobManifest> {
    match get_json(store, &paths::manifest(job)).await {
        Err(e) if e.is_not_found() => Err(TurbineError::NotFound(format!("job '{}'", job))),
        other => other,
    }
}

/// All final reports of a job, ordered by task index
pub async fn reports(store: Arc<dyn ResultStore>, job: &str) -> Result<Vec<TaskReport>> {
    let names: Vec<String> = store
        .list(&paths::results_prefix(job))
        .await?
        .into_iter()
        .filter(|name| name.ends_with(".json"))
        .collect();

    let mut reports = Vec::with_capacity(names.len());
    for chunk in names.chunks(FETCH_CONCURRENCY) {
        let mut set = JoinSet::new();
        for name in chunk {
            let store = Arc::clone(&store);
            let name = name.clone();
            set.spawn(async move { get_json::<TaskReport>(store.as_ref(), &name).await });
        }
        while let Some(joined) = set.join_next().await {
            let report = joined.map_err(|e| TurbineError::Other(e.to_string()))??;
            reports.push(report);
        }
    }

    reports.sort_by_key(|r| r.index);
    Ok(reports)
}

/// Summarize a job's progress
pub async fn status(store: Arc<dyn ResultStore>, job: &str) -> Result<(JobSummary, Vec<TaskReport>)> {
    let manifest = load_manifest(store.as_ref(), job).await?;
    let reports = reports(store, job).await?;
    let summary = JobSummary::from_reports(job, manifest.len(), &reports);
    Ok((summary, reports))
}

/// Reports of tasks that ended failed or timed out
pub fn failures(reports: &[TaskReport]) -> Vec<&TaskReport> {
    reports.iter().filter(|r| !r.status.is_success()).collect()
}

/// Final reports of a job's failed and timed-out tasks
pub async fn failed_tasks(store: Arc<dyn ResultStore>, job: &str) -> Result<Vec<TaskReport>> {
    load_manifest(store.as_ref(), job).await?;
    let reports = reports(store, job).await?;
    Ok(reports.into_iter().filter(|r| !r.status.is_success()).collect())
}

/// Download reports and outputs to `dest/<task_id>/`; returns the task count
pub async fn collect(
    store: Arc<dyn ResultStore>,
    job: &str,
    dest: &Path,
    progress: Option<&ProgressBar>,
) -> Result<usize> {
    let manifest = load_manifest(store.as_ref(), job).await?;
    let reports = reports(Arc::clone(&store), job).await?;

    tokio::fs::create_dir_all(dest).await?;
    tokio::fs::write(
        dest.join("manifest.json"),
        serde_json::to_vec_pretty(&manifest)?,
    )
    .await?;

    if let Some(pb) = progress {
        pb.set_length(reports.len() as u64);
        pb.set_message("Downloading results...");
    }

    for report in &reports {
        let task_dir = dest.join(&report.task_id);
        tokio::fs::create_dir_all(&task_dir).await?;
        tokio::fs::write(task_dir.join("report.json"), serde_json::to_vec_pretty(report)?).await?;

        for (object, file) in [(&report.stdout_object, "stdout"), (&report.stderr_object, "stderr")] {
            match store.get(object).await {
                Ok(data) => tokio::fs::write(task_dir.join(file), data).await?,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(task_id = %report.task_id, object = %object, "Output object missing");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(pb) = progress {
            pb.inc(1);
        }
    }

    tracing::info!(job, tasks = reports.len(), dest = %dest.display(), "Collected results");
    Ok(reports.len())
}

/// Write a directory into a `.tar.gz` archive rooted at `prefix`
pub fn archive_dir(dir: &Path, prefix: &str, archive: &Path) -> Result<PathBuf> {
    if let Some(parent) = archive.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = std::fs::File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(prefix, dir)?;
    builder.into_inner()?.finish()?;

    Ok(archive.to_path_buf())
}

/// Collect into a temporary directory and pack it as `archive`
pub async fn collect_archive(
    store: Arc<dyn ResultStore>,
    job: &str,
    archive: &Path,
    progress: Option<&ProgressBar>,
) -> Result<usize> {
    let staging = tempfile::tempdir()?;
    let count = collect(store, job, staging.path(), progress).await?;

    let dir = staging.path().to_path_buf();
    let prefix = job.to_string();
    let target = archive.to_path_buf();
    tokio::task::spawn_blocking(move || archive_dir(&dir, &prefix, &target))
        .await
        .map_err(|e| TurbineError::Other(e.to_string()))??;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{put_json, LocalStore};
    use crate::models::TaskStatus;
    use chrono::Utc;
    use std::io::Read;

    fn report(job: &str, index: usize, status: TaskStatus) -> TaskReport {
        let task_id = crate::models::Task::make_id(job, index);
        TaskReport {
            task_id: task_id.clone(),
            job: job.to_string(),
            index,
            command: format!("echo {}", index),
            attempt: 1,
            status,
            exit_code: Some(0),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 5,
            worker: "w".to_string(),
            stdout_object: paths::stdout(job, &task_id),
            stderr_object: paths::stderr(job, &task_id),
            stdout_sha256: String::new(),
            stderr_sha256: String::new(),
            error: None,
        }
    }

    async fn seeded() -> (tempfile::TempDir, Arc<dyn ResultStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(&dir.path().join("store"));
        let manifest = JobManifest::from_text("job", "echo 0\necho 1\necho 2\n").unwrap();
        put_json(&store, &paths::manifest("job"), &manifest).await.unwrap();

        for (index, status) in [(1, TaskStatus::Failed), (0, TaskStatus::Succeeded)] {
            let r = report("job", index, status);
            put_json(&store, &paths::report("job", &r.task_id), &r).await.unwrap();
            store
                .put(&r.stdout_object, format!("out {}\n", index).into_bytes(), "text/plain")
                .await
                .unwrap();
        }
        let store: Arc<dyn ResultStore> = Arc::new(store);
        (dir, store)
    }

    #[tokio::test]
    async fn test_status_summary() {
        let (_dir, store) = seeded().await;
        let (summary, reports) = status(store, "job").await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(reports[0].index, 0);
        assert_eq!(reports[1].index, 1);
    }

    #[tokio::test]
    async fn test_failed_tasks() {
        let (_dir, store) = seeded().await;
        let failed = failed_tasks(store, "job").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, "job-00001");
        assert_eq!(failed[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (_dir, store) = seeded().await;
        let err = status(store, "missing").await.unwrap_err();
        assert!(matches!(err, TurbineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_collect_writes_task_dirs() {
        let (dir, store) = seeded().await;
        let dest = dir.path().join("out");

        let count = collect(store, "job", &dest, None).await.unwrap();
        assert_eq!(count, 2);
        assert!(dest.join("manifest.json").exists());
        assert_eq!(std::fs::read_to_string(dest.join("job-00000").join("stdout")).unwrap(), "out 0\n");
        assert!(dest.join("job-00001").join("report.json").exists());
        // stderr was never uploaded in this fixture
        assert!(!dest.join("job-00001").join("stderr").exists());
    }

    #[tokio::test]
    async fn test_collect_archive() {
        let (dir, store) = seeded().await;
        let archive = dir.path().join("results.tar.gz");

        collect_archive(store, "job", &archive, None).await.unwrap();

        let file = std::fs::File::open(&archive).unwrap();
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let mut found = false;
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "job/job-00000/stdout" {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                assert_eq!(content, "out 0\n");
                found = true;
            }
        }
        assert!(found);
    }
}
