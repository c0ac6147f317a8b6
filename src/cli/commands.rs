//! Command execution handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::backend::{LogSink, ResultStore, TracingSink};
use crate::cloud::auth::MetadataServer;
use crate::cloud::compute::JOB_LABEL;
use crate::cloud::{
    CloudLogSink, ComputeClient, GcpClient, LoggingClient, PubSubClient, PubSubQueue,
    StorageClient,
};
use crate::collector;
use crate::config::Config;
use crate::dispatcher::{self, SubmitOptions};
use crate::error::{Result, TurbineError};
use crate::fleet;
use crate::local::{self, LocalOptions};
use crate::models::{JobManifest, JobSummary, TaskReport};
use crate::shutdown::install_shutdown_handler;
use crate::worker::{worker_name, ExitReason, Worker, WorkerSettings, WorkerStats};

use super::{OutputFormat, StatusArgs};

/// Settings shared by every command
#[derive(Debug, Clone)]
pub struct Context {
    /// Loaded configuration
    pub config: Config,
    /// File the configuration was loaded from
    pub config_path: PathBuf,
    /// Suppress progress bars and banners
    pub quiet: bool,
}

impl Context {
    /// Load the configuration from `explicit` or the default location
    pub fn load(explicit: Option<&Path>, quiet: bool) -> Result<Self> {
        let config_path = Config::resolve_path(explicit)?;
        let config = Config::load_from(&config_path)?;
        Ok(Self {
            config,
            config_path,
            quiet,
        })
    }
}

/// Authenticated clients for the configured project
struct Cloud {
    gcp: GcpClient,
    project: String,
    config: Config,
}

impl Cloud {
    async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let project = config.project()?.to_string();
        let gcp = GcpClient::from_environment(config.http_timeout()).await?;
        Ok(Self {
            gcp,
            project,
            config: config.clone(),
        })
    }

    fn pubsub(&self) -> PubSubClient {
        PubSubClient::new(
            self.gcp.clone(),
            &self.project,
            self.config.cloud.pubsub_endpoint.as_deref(),
        )
    }

    fn queue(&self) -> PubSubQueue {
        PubSubQueue::new(
            self.pubsub(),
            &self.config.cloud.topic,
            &self.config.cloud.subscription,
        )
    }

    fn storage(&self) -> Result<StorageClient> {
        Ok(StorageClient::new(
            self.gcp.clone(),
            &self.config.bucket()?,
            self.config.cloud.storage_endpoint.as_deref(),
        ))
    }

    fn compute(&self) -> ComputeClient {
        ComputeClient::new(self.gcp.clone(), &self.project, &self.config.cloud.zone)
    }

    fn log_sink(&self, worker: &str) -> Arc<dyn LogSink> {
        if self.config.logging.cloud {
            let client = LoggingClient::new(self.gcp.clone(), &self.project, &self.config.cloud.log_name);
            Arc::new(CloudLogSink::new(client, worker))
        } else {
            Arc::new(TracingSink)
        }
    }
}

fn progress_bar(quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let style = ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map_err(|e| TurbineError::Other(e.to_string()))?
        .progress_chars("█▓▒░ ");
    let pb = ProgressBar::new(0);
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn spinner(quiet: bool, message: &str) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .map_err(|e| TurbineError::Other(e.to_string()))?,
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

/// Execute the init command
pub async fn execute_init(args: &super::InitArgs, ctx: &Context) -> Result<()> {
    let cloud = Cloud::connect(&ctx.config).await?;
    let pubsub = cloud.pubsub();
    let cloud_config = &ctx.config.cloud;

    let pb = spinner(ctx.quiet, "Creating topic...")?;
    pubsub.ensure_topic(&cloud_config.topic).await?;

    pb.set_message("Creating subscription...");
    pubsub
        .ensure_subscription(
            &cloud_config.subscription,
            &cloud_config.topic,
            ctx.config.worker.ack_deadline,
        )
        .await?;

    if !args.no_bucket {
        pb.set_message("Creating bucket...");
        cloud
            .storage()?
            .ensure_bucket(&cloud.project, &cloud_config.location)
            .await?;
    }
    pb.finish_and_clear();

    println!("{} Project {} is ready", style("✓").green(), style(&cloud.project).cyan());
    println!("  Topic:        {}", pubsub.topic_path(&cloud_config.topic));
    println!("  Subscription: {}", pubsub.subscription_path(&cloud_config.subscription));
    if !args.no_bucket {
        println!("  Bucket:       gs://{}", ctx.config.bucket()?);
    }
    Ok(())
}

/// Execute the submit command
pub async fn execute_submit(args: &super::SubmitArgs, ctx: &Context) -> Result<()> {
    let manifest = JobManifest::load(&args.manifest, args.name.as_deref())?;
    manifest.validate()?;

    let cloud = Cloud::connect(&ctx.config).await?;
    let queue = cloud.queue();
    let store = cloud.storage()?;

    let options = SubmitOptions {
        bundle: args.bundle.clone(),
        force: args.force,
    };

    let pb = progress_bar(ctx.quiet)?;
    pb.set_message("Uploading...");
    let submission =
        dispatcher::submit(&manifest, &ctx.config.worker, &queue, &store, &options, Some(&pb)).await?;
    pb.finish_and_clear();

    println!(
        "{} Submitted job {} with {} task(s)",
        style("✓").green(),
        style(&submission.job).cyan().bold(),
        submission.tasks
    );
    if submission.bundle_files > 0 {
        println!("  Bundle: {} file(s)", submission.bundle_files);
    }
    if submission.replaced_objects > 0 {
        println!(
            "  Replaced {} object(s) from the previous run",
            submission.replaced_objects
        );
    }
    if !ctx.quiet {
        println!(
            "\nStart workers with {} or watch with {}",
            style(format!("turbine launch {} -n <count>", submission.job)).dim(),
            style(format!("turbine status {} --watch 30", submission.job)).dim()
        );
    }
    Ok(())
}

/// Execute the worker command
pub async fn execute_worker(args: &super::WorkerArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(idle_polls) = args.idle_polls {
        config.worker.idle_polls = idle_polls;
    }

    let cloud = Cloud::connect(&config).await?;
    let name = worker_name();
    let mut settings = WorkerSettings::from_config(&config, &name);
    if let Some(job) = &args.job {
        crate::models::validate_resource_name(job)?;
        settings.job = Some(job.clone());
    }

    let worker = Arc::new(Worker::new(
        Arc::new(cloud.queue()),
        Arc::new(cloud.storage()?),
        cloud.log_sink(&name),
        settings,
    ));

    let stats = worker.run(install_shutdown_handler()).await?;
    print_worker_stats(&name, &stats);

    if args.shutdown_when_idle && stats.exit == ExitReason::Idle {
        delete_own_instance(&cloud).await?;
    }
    Ok(())
}

/// Delete the Compute Engine instance this process runs on
async fn delete_own_instance(cloud: &Cloud) -> Result<()> {
    let metadata = MetadataServer::new(cloud.gcp.http().clone());
    if !metadata.is_available().await {
        tracing::warn!("Not running on Compute Engine; leaving the machine up");
        return Ok(());
    }

    let name = metadata.instance_name().await?;
    let zone = metadata.instance_zone().await?;
    tracing::info!(instance = %name, zone = %zone, "Queue is idle, deleting instance");
    ComputeClient::new(cloud.gcp.clone(), &cloud.project, &zone)
        .delete_instance(&name)
        .await
}

fn print_worker_stats(name: &str, stats: &WorkerStats) {
    let reason = match stats.exit {
        ExitReason::Shutdown => "shutdown requested",
        ExitReason::Idle => "queue idle",
    };
    println!(
        "{} Worker {} stopped ({})",
        style("■").dim(),
        style(name).bold(),
        reason
    );
    println!(
        "  {} succeeded, {} failed, {} timed out, {} retried",
        style(stats.succeeded).green(),
        style(stats.failed).red(),
        style(stats.timed_out).yellow(),
        stats.retried
    );
    if stats.duplicates + stats.poisoned + stats.errors > 0 {
        println!(
            "  {} duplicate(s), {} undecodable, {} storage error(s)",
            stats.duplicates, stats.poisoned, stats.errors
        );
    }
}

/// Execute the launch command
pub async fn execute_launch(args: &super::LaunchArgs, ctx: &Context) -> Result<()> {
    if args.count == 0 {
        return Err(TurbineError::config("--count must be at least 1"));
    }

    let cloud = Cloud::connect(&ctx.config).await?;
    let store = cloud.storage()?;

    // Workers for an unknown job would idle out immediately
    collector::load_manifest(&store, &args.job).await?;

    let pb = spinner(ctx.quiet, "Preparing...")?;
    if let Some(binary) = &args.binary {
        if !binary.is_file() {
            return Err(TurbineError::file_not_found(binary));
        }
        pb.set_message("Uploading worker binary...");
        let data = tokio::fs::read(binary).await?;
        store
            .upload(fleet::BINARY_OBJECT, data, "application/octet-stream")
            .await?;
    }

    pb.set_message(format!("Creating {} instance(s)...", args.count));
    let names = fleet::launch(&cloud.compute(), &ctx.config, &args.job, args.count, args.idle_polls).await?;
    pb.finish_and_clear();

    println!(
        "{} Launched {} worker(s) for {} in {}",
        style("✓").green(),
        names.len(),
        style(&args.job).cyan().bold(),
        ctx.config.cloud.zone
    );
    for name in &names {
        println!("  {}", name);
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusView<'a> {
    #[serde(flatten)]
    summary: &'a JobSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<&'a TaskReport>,
}

/// Execute the status command
pub async fn execute_status(args: &StatusArgs, ctx: &Context) -> Result<()> {
    let cloud = Cloud::connect(&ctx.config).await?;
    let store: Arc<dyn ResultStore> = Arc::new(cloud.storage()?);

    let Some(interval) = args.watch else {
        let (summary, reports) = collector::status(store, &args.job).await?;
        return print_status(args, &summary, &reports);
    };

    let shutdown = install_shutdown_handler();
    loop {
        let (summary, reports) = collector::status(Arc::clone(&store), &args.job).await?;
        print_status(args, &summary, &reports)?;
        if summary.is_complete() {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
        }
        if args.format == OutputFormat::Pretty {
            println!();
        }
    }
}

fn print_status(args: &StatusArgs, summary: &JobSummary, reports: &[TaskReport]) -> Result<()> {
    let failures: Vec<&TaskReport> = if args.failed {
        collector::failures(reports)
    } else {
        Vec::new()
    };

    match args.format {
        OutputFormat::Json => {
            let view = StatusView { summary, failures };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        OutputFormat::Pretty => {
            let state = if summary.is_complete() {
                style("complete").green()
            } else {
                style("running").yellow()
            };
            println!("{} {} ({})", style("Job").bold(), style(&summary.job).cyan().bold(), state);
            println!("  Tasks:      {}", summary.total);
            println!("  Succeeded:  {}", style(summary.succeeded).green());
            println!("  Failed:     {}", style(summary.failed).red());
            println!("  Timed out:  {}", style(summary.timed_out).yellow());
            println!("  Pending:    {}", summary.pending);
            println!("  Progress:   {:.1}%", summary.percent_done());

            if !failures.is_empty() {
                println!("\n{}", style("Failed tasks").bold().underlined());
                for report in failures {
                    let code = report
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {} {} (exit {}, attempt {}) {}",
                        style(&report.task_id).bold(),
                        style(report.status).red(),
                        code,
                        report.attempt,
                        style(&report.command).dim()
                    );
                }
            }
        }
    }
    Ok(())
}

/// Execute the collect command
pub async fn execute_collect(args: &super::CollectArgs, ctx: &Context) -> Result<()> {
    let cloud = Cloud::connect(&ctx.config).await?;
    let store: Arc<dyn ResultStore> = Arc::new(cloud.storage()?);

    let pb = progress_bar(ctx.quiet)?;
    let (count, target) = match &args.archive {
        Some(archive) => {
            let count = collector::collect_archive(store, &args.job, archive, Some(&pb)).await?;
            (count, archive.clone())
        }
        None => {
            let dest = args
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(&args.job));
            let count = collector::collect(store, &args.job, &dest, Some(&pb)).await?;
            (count, dest)
        }
    };
    pb.finish_and_clear();

    println!(
        "{} Collected {} task result(s) into {}",
        style("✓").green(),
        count,
        style(target.display()).cyan()
    );
    Ok(())
}

/// Execute the teardown command
pub async fn execute_teardown(args: &super::TeardownArgs, ctx: &Context) -> Result<()> {
    let cloud = Cloud::connect(&ctx.config).await?;
    let compute = cloud.compute();

    let instances = compute.list_instances(JOB_LABEL, &args.job).await?;
    if instances.is_empty() {
        println!("No workers are running for {}", style(&args.job).cyan());
    } else {
        println!("Workers for {}:", style(&args.job).cyan().bold());
        for instance in &instances {
            println!("  {} ({})", instance.name, style(&instance.status).dim());
        }

        let proceed = args.yes
            || Confirm::new()
                .with_prompt(format!("Delete {} instance(s)?", instances.len()))
                .default(false)
                .interact()
                .map_err(|e| TurbineError::Other(e.to_string()))?;
        if !proceed {
            println!("Teardown cancelled");
            return Ok(());
        }

        let pb = spinner(ctx.quiet, "Deleting instances...")?;
        let deleted = fleet::teardown(&compute, &args.job).await?;
        pb.finish_and_clear();
        println!("{} Deleted {} instance(s)", style("✓").green(), deleted.len());
    }

    if args.all {
        let proceed = args.yes
            || Confirm::new()
                .with_prompt(format!(
                    "Delete subscription '{}' and topic '{}'? Pending tasks of every job are lost",
                    ctx.config.cloud.subscription, ctx.config.cloud.topic
                ))
                .default(false)
                .interact()
                .map_err(|e| TurbineError::Other(e.to_string()))?;
        if proceed {
            let pubsub = cloud.pubsub();
            pubsub.delete_subscription(&ctx.config.cloud.subscription).await?;
            pubsub.delete_topic(&ctx.config.cloud.topic).await?;
            println!("{} Deleted subscription and topic", style("✓").green());
        }
    }
    Ok(())
}

/// Execute the local command
pub async fn execute_local(args: &super::LocalArgs, ctx: &Context) -> Result<()> {
    let manifest = JobManifest::load(&args.manifest, args.name.as_deref())?;
    let options = LocalOptions {
        workers: args.workers,
        output: args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from("turbine-local")),
        bundle: args.bundle.clone(),
        force: args.force,
    };

    let pb = spinner(
        ctx.quiet,
        &format!("Running {} task(s) on {} worker(s)...", manifest.len(), options.workers),
    )?;
    let (summary, stats) =
        local::run_local(&manifest, &ctx.config, &options, install_shutdown_handler()).await?;
    pb.finish_and_clear();

    let retried: usize = stats.iter().map(|s| s.retried).sum();
    println!(
        "{} {}: {} succeeded, {} failed, {} timed out, {} pending ({} retried)",
        if summary.succeeded == summary.total {
            style("✓").green()
        } else {
            style("✗").red()
        },
        style(&summary.job).cyan().bold(),
        summary.succeeded,
        summary.failed,
        summary.timed_out,
        summary.pending,
        retried
    );
    println!(
        "  Results in {}",
        style(local::store_dir(&options.output).join("jobs").join(&summary.job).display()).dim()
    );

    if summary.failed + summary.timed_out > 0 {
        return Err(TurbineError::Execution(format!(
            "{} task(s) of job '{}' did not succeed",
            summary.failed + summary.timed_out,
            summary.job
        )));
    }
    Ok(())
}

/// Execute the config command
pub async fn execute_config(args: &super::ConfigArgs, ctx: &Context) -> Result<()> {
    use super::ConfigCommands;

    let path = &ctx.config_path;
    match &args.command {
        ConfigCommands::Show => {
            let content = toml::to_string_pretty(&ctx.config)
                .map_err(|e| TurbineError::config(e.to_string()))?;
            println!("{}", content);
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
        }
        ConfigCommands::Reset => {
            Config::default().save_to(path)?;
            println!("Configuration reset to defaults");
        }
        ConfigCommands::Set { key, value } => {
            // Start from the file, not the environment-adjusted view
            let mut config = if path.exists() {
                toml::from_str(&std::fs::read_to_string(path)?)?
            } else {
                Config::default()
            };
            config.set(key, value)?;
            config.save_to(path)?;
            println!("Set {} = {}", key, value);
        }
        ConfigCommands::Get { key } => match ctx.config.get(key) {
            Some(value) => println!("{}", value),
            None => return Err(TurbineError::config(format!("Unknown or unset key: {}", key))),
        },
        ConfigCommands::Init { force } => {
            Config::init(path, *force)?;
            println!("Configuration initialized at {}", path.display());
        }
    }

    Ok(())
}
