//! Submitting jobs

use std::path::Path;

use chrono::Utc;
use indicatif::ProgressBar;
use walkdir::WalkDir;

use crate::backend::{put_json, ResultStore, TaskQueue};
use crate::config::WorkerConfig;
use crate::error::{Result, TurbineError};
use crate::models::{paths, JobManifest};

/// Tasks published per queue call, so progress can be reported
const PUBLISH_CHUNK: usize = 1000;

/// Options for [`submit`]
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Directory uploaded as the job bundle
    pub bundle: Option<std::path::PathBuf>,
    /// Replace an existing job of the same name, deleting its results
    pub force: bool,
}

/// What a submission did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job: String,
    pub tasks: usize,
    pub bundle_files: usize,
    /// Objects removed from a previous job of the same name
    pub replaced_objects: usize,
}

/// Store a job's manifest and bundle, then publish its tasks
pub async fn submit(
    manifest: &JobManifest,
    defaults: &WorkerConfig,
    queue: &dyn TaskQueue,
    store: &dyn ResultStore,
    options: &SubmitOptions,
    progress: Option<&ProgressBar>,
) -> Result<Submission> {
    manifest.validate()?;
    let job = manifest.name.as_str();

    let mut replaced_objects = 0;
    if store.exists(&paths::manifest(job)).await? {
        if !options.force {
            return Err(TurbineError::manifest(format!(
                "job '{}' was already submitted; use --force to replace it",
                job
            )));
        }
        replaced_objects = clear_job(store, job).await?;
        tracing::info!(job, objects = replaced_objects, "Removed previous job");
    }

    let bundle_files = match &options.bundle {
        Some(dir) => upload_bundle(store, job, dir).await?,
        None => 0,
    };

    put_json(store, &paths::manifest(job), manifest).await?;

    let tasks = manifest.expand(defaults, Utc::now());
    if let Some(pb) = progress {
        pb.set_length(tasks.len() as u64);
        pb.set_message("Publishing tasks...");
    }

    let mut published = 0;
    for chunk in tasks.chunks(PUBLISH_CHUNK) {
        published += queue.publish(chunk).await?;
        if let Some(pb) = progress {
            pb.set_position(published as u64);
        }
    }

    tracing::info!(job, tasks = published, bundle_files, "Submitted job");
    Ok(Submission {
        job: job.to_string(),
        tasks: published,
        bundle_files,
        replaced_objects,
    })
}

/// Delete every object belonging to a job
pub async fn clear_job(store: &dyn ResultStore, job: &str) -> Result<usize> {
    let objects = store.list(&paths::job_prefix(job)).await?;
    for object in &objects {
        store.delete(object).await?;
    }
    Ok(objects.len())
}

/// Upload the files of `dir` (hidden entries skipped) under the job's bundle prefix
pub async fn upload_bundle(store: &dyn ResultStore, job: &str, dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Err(TurbineError::file_not_found(dir));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), name));
    }

    let prefix = paths::bundle_prefix(job);
    for (path, name) in &files {
        let data = tokio::fs::read(path).await?;
        store
            .put(&format!("{}{}", prefix, name), data, "application/octet-stream")
            .await?;
        tracing::debug!(job, file = %name, "Uploaded bundle file");
    }

    Ok(files.len())
}
