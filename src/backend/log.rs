//! Task log records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Severity of a log record, named as Cloud Logging names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// A structured event about a task
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub job: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Extra fields placed in the JSON payload
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Create a record for a job
    pub fn new(severity: Severity, job: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            timestamp: Utc::now(),
            message: message.into(),
            job: job.to_string(),
            task_id: None,
            fields: Map::new(),
        }
    }

    /// Attach a task id
    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    /// Attach a payload field
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for task log records
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Record an event. Sinks must not fail the caller.
    async fn emit(&self, record: LogRecord);

    /// Push out anything buffered
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Forwards records to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn emit(&self, record: LogRecord) {
        let task_id = record.task_id.as_deref().unwrap_or("-");
        let fields = Value::Object(record.fields);
        match record.severity {
            Severity::Debug => {
                tracing::debug!(job = %record.job, task_id, %fields, "{}", record.message)
            }
            Severity::Info => {
                tracing::info!(job = %record.job, task_id, %fields, "{}", record.message)
            }
            Severity::Warning => {
                tracing::warn!(job = %record.job, task_id, %fields, "{}", record.message)
            }
            Severity::Error => {
                tracing::error!(job = %record.job, task_id, %fields, "{}", record.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = LogRecord::new(Severity::Warning, "sweep", "retrying")
            .task("sweep-00001")
            .field("attempt", 2)
            .field("exit_code", Value::Null);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["severity"], "WARNING");
        assert_eq!(json["task_id"], "sweep-00001");
        assert_eq!(json["fields"]["attempt"], 2);
    }
}
