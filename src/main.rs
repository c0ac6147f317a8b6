//! Turbine - run shell scripts on the Google Cloud
//!
//! Main entry point for the turbine CLI application.

use std::process::ExitCode;

use console::style;
use tracing_subscriber::EnvFilter;

use turbine::cli::{self, Cli, Commands, Context};
use turbine::error::Result;

/// Application banner
const BANNER: &str = r#"
  ╔╦╗╦ ╦╦═╗╔╗ ╦╔╗╔╔═╗
   ║ ║ ║╠╦╝╠╩╗║║║║║╣
   ╩ ╚═╝╩╚═╚═╝╩╝╚╝╚═╝
"#;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Load configuration before logging so its level applies
    let ctx = match Context::load(cli.config.as_deref(), cli.quiet) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    setup_logging(&cli, &ctx.config.logging.level);

    match run(cli, ctx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Set up logging based on CLI arguments and the configured level
fn setup_logging(cli: &Cli, configured: &str) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        configured
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Workers run unattended, so they keep timestamps
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if matches!(cli.command, Commands::Worker(_)) {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

/// Main application logic
async fn run(cli: Cli, ctx: Context) -> Result<()> {
    if !ctx.quiet {
        if let Commands::Init(_) | Commands::Local(_) = &cli.command {
            println!("{}", style(BANNER).cyan());
            println!("  {} v{}\n", style("turbine").bold(), style(turbine::VERSION).dim());
        }
    }

    match cli.command {
        Commands::Init(args) => cli::execute_init(&args, &ctx).await,
        Commands::Submit(args) => cli::execute_submit(&args, &ctx).await,
        Commands::Worker(args) => cli::execute_worker(&args, &ctx).await,
        Commands::Launch(args) => cli::execute_launch(&args, &ctx).await,
        Commands::Status(args) => cli::execute_status(&args, &ctx).await,
        Commands::Collect(args) => cli::execute_collect(&args, &ctx).await,
        Commands::Teardown(args) => cli::execute_teardown(&args, &ctx).await,
        Commands::Local(args) => cli::execute_local(&args, &ctx).await,
        Commands::Config(args) => cli::execute_config(&args, &ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner() {
        assert!(!BANNER.trim().is_empty());
        assert_eq!(BANNER.trim_matches('\n').lines().count(), 3);
    }
}
