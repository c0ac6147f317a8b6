//! Cloud Logging client and the log sink built on it

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::GcpClient;
use crate::backend::{LogRecord, LogSink, Severity, TracingSink};
use crate::error::Result;

const LOGGING_URL: &str = "https://logging.googleapis.com/v2/entries:write";
const SERVICE: &str = "logging";

/// Entries buffered before the sink writes them out
const FLUSH_THRESHOLD: usize = 50;

/// One entry of an `entries:write` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub severity: Severity,
    pub timestamp: String,
    pub labels: BTreeMap<String, String>,
    pub json_payload: Value,
}

impl LogEntry {
    /// Convert a record, labelling it with the worker name
    pub fn from_record(record: &LogRecord, worker: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), record.job.clone());
        labels.insert("worker".to_string(), worker.to_string());
        if let Some(task_id) = &record.task_id {
            labels.insert("task_id".to_string(), task_id.clone());
        }

        let mut payload = record.fields.clone();
        payload.insert("message".to_string(), Value::String(record.message.clone()));

        Self {
            severity: record.severity,
            timestamp: record.timestamp.to_rfc3339(),
            labels,
            json_payload: Value::Object(payload),
        }
    }
}

/// Writes entries to one log
#[derive(Clone)]
pub struct LoggingClient {
    gcp: GcpClient,
    project: String,
    log_name: String,
}

impl LoggingClient {
    /// Create a client for `projects/<project>/logs/<log_name>`
    pub fn new(gcp: GcpClient, project: &str, log_name: &str) -> Self {
        Self {
            gcp,
            project: project.to_string(),
            log_name: log_name.to_string(),
        }
    }

    /// Full log name
    pub fn log_path(&self) -> String {
        format!("projects/{}/logs/{}", self.project, self.log_name)
    }

    /// Write a batch of entries
    pub async fn write(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let body = json!({
            "logName": self.log_path(),
            "resource": { "type": "global", "labels": { "project_id": self.project } },
            "entries": entries,
        });
        let request = self.gcp.http().post(LOGGING_URL).json(&body);
        self.gcp.send(SERVICE, request).await?;
        Ok(())
    }
}

/// Buffers records and writes them to Cloud Logging, echoing to tracing
pub struct CloudLogSink {
    client: LoggingClient,
    worker: String,
    buffer: Mutex<Vec<LogEntry>>,
    echo: TracingSink,
}

impl CloudLogSink {
    /// Create a sink labelling entries with `worker`
    pub fn new(client: LoggingClient, worker: &str) -> Self {
        Self {
            client,
            worker: worker.to_string(),
            buffer: Mutex::new(Vec::new()),
            echo: TracingSink,
        }
    }

    async fn write_out(&self, entries: Vec<LogEntry>) -> Result<()> {
        let count = entries.len();
        if let Err(e) = self.client.write(&entries).await {
            tracing::warn!(error = %e, count, "Could not write to Cloud Logging");
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for CloudLogSink {
    async fn emit(&self, record: LogRecord) {
        let entry = LogEntry::from_record(&record, &self.worker);
        self.echo.emit(record).await;

        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(entry);
            if buffer.len() >= FLUSH_THRESHOLD {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(entries) = full {
            let _ = self.write_out(entries).await;
        }
    }

    async fn flush(&self) -> Result<()> {
        let entries = std::mem::take(&mut *self.buffer.lock().await);
        self.write_out(entries).await
    }
}
