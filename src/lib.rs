//! Turbine - run shell scripts on the Google Cloud
//!
//! Turbine takes a manifest of shell commands, publishes one Pub/Sub message
//! per command, and runs them on a fleet of Compute Engine workers. Every
//! task's output and a JSON report land in Cloud Storage, and task logs go
//! to Cloud Logging.
//!
//! # Features
//!
//! - **At-least-once**: tasks are acked only after their report is stored
//! - **Retries**: failed attempts are queued again up to a per-task limit
//! - **Self-cleaning**: fleet workers delete their instance once idle
//! - **Local mode**: the same pipeline runs on an in-memory queue
//!
//! # Quick Start
//!
//! ```bash
//! # Create the topic, subscription and bucket
//! turbine init
//!
//! # Submit one task per line and start four workers
//! turbine submit sweep.txt --bundle ./scripts
//! turbine launch sweep -n 4
//!
//! # Watch progress, then download outputs
//! turbine status sweep --watch 30
//! turbine collect sweep
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod cli;
pub mod cloud;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod local;
pub mod models;
pub mod shutdown;
pub mod worker;

// Re-export commonly used types
pub use error::{Result, TurbineError};
pub use models::{JobManifest, JobSummary, Task, TaskReport, TaskStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "turbine");
    }
}
