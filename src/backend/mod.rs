//! Storage and messaging seams between the worker and the cloud
//!
//! The worker, dispatcher and collector only talk to these traits. The
//! cloud module implements them on top of Pub/Sub, Cloud Storage and Cloud
//! Logging; [`MemoryQueue`], [`LocalStore`] and [`TracingSink`] implement them
//! in-process for `turbine local` and for tests.

mod local;
mod log;
mod memory;

pub use local::LocalStore;
pub use log::{LogRecord, LogSink, Severity, TracingSink};
pub use memory::MemoryQueue;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TurbineError};
use crate::models::Task;

/// A message handed to a worker, owned until acked or its lease expires
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Handle used to ack, extend or release the message
    pub ack_id: String,
    /// Message payload
    pub data: Vec<u8>,
    /// Message attributes
    pub attributes: BTreeMap<String, String>,
}

/// At-least-once task queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publish tasks; returns the number published
    async fn publish(&self, tasks: &[Task]) -> Result<usize>;

    /// Lease up to `max` messages. May return fewer, or none.
    async fn pull(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Remove messages for good
    async fn ack(&self, ack_ids: &[String]) -> Result<()>;

    /// Push the lease deadline of messages `lease` into the future
    async fn extend(&self, ack_ids: &[String], lease: Duration) -> Result<()>;

    /// Give messages back for immediate redelivery
    async fn release(&self, ack_ids: &[String]) -> Result<()>;
}

/// Flat object store addressed by `/`-separated names
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write an object, replacing any existing one
    async fn put(&self, name: &str, data: Vec<u8>, content_type: &str) -> Result<()>;

    /// Read an object. Missing objects are a not-found error.
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Check whether an object exists
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Names of all objects starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Missing objects are not an error.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Store a value as pretty JSON
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ResultStore,
    name: &str,
    value: &T,
) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    store.put(name, data, "application/json").await
}

/// Load a JSON value
pub async fn get_json<T: DeserializeOwned>(store: &dyn ResultStore, name: &str) -> Result<T> {
    let data = store.get(name).await?;
    serde_json::from_slice(&data)
        .map_err(|e| TurbineError::Other(format!("could not parse {}: {}", name, e)))
}
