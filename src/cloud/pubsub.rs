//! Cloud Pub/Sub REST client and the task queue built on it

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::GcpClient;
use crate::backend::{Delivery, TaskQueue};
use crate::error::{Result, TurbineError};
use crate::models::Task;

const PUBSUB_URL: &str = "https://pubsub.googleapis.com";
const SERVICE: &str = "pubsub";

/// Most messages accepted by one publish call
pub const MAX_PUBLISH_MESSAGES: usize = 1000;

/// Request size we stay under when batching (the API limit is 10 MB)
const MAX_PUBLISH_BYTES: usize = 9 * 1024 * 1024;

/// Most ack ids sent in one acknowledge/modifyAckDeadline call
const MAX_ACK_IDS: usize = 2500;

/// A message as sent to the publish endpoint
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    /// Base64 payload
    pub data: String,
    pub attributes: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// Encode a task
    pub fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            data: STANDARD.encode(task.encode()?),
            attributes: task.attributes(),
        })
    }

    fn approx_size(&self) -> usize {
        self.data.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len() + 8)
                .sum::<usize>()
            + 32
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

/// Split messages into publish requests under the count and size limits
pub fn batch_messages(messages: Vec<OutgoingMessage>) -> Vec<Vec<OutgoingMessage>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for message in messages {
        let size = message.approx_size();
        if !current.is_empty()
            && (current.len() >= MAX_PUBLISH_MESSAGES || current_bytes + size > MAX_PUBLISH_BYTES)
        {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(message);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Client for one project's topics and subscriptions
#[derive(Clone)]
pub struct PubSubClient {
    gcp: GcpClient,
    base_url: String,
    project: String,
}

impl PubSubClient {
    /// Create a client, optionally against an emulator endpoint
    pub fn new(gcp: GcpClient, project: &str, endpoint: Option<&str>) -> Self {
        Self {
            gcp,
            base_url: endpoint.unwrap_or(PUBSUB_URL).trim_end_matches('/').to_string(),
            project: project.to_string(),
        }
    }

    /// Full resource name of a topic
    pub fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project, topic)
    }

    /// Full resource name of a subscription
    pub fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project, subscription)
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.base_url, resource)
    }

    /// Create a topic if it does not exist
    pub async fn ensure_topic(&self, topic: &str) -> Result<()> {
        let request = self.gcp.http().put(self.url(&self.topic_path(topic))).json(&json!({}));
        match self.gcp.send(SERVICE, request).await {
            Ok(_) => {
                tracing::info!(topic, "Created topic");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(topic, "Topic already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create a subscription on `topic` if it does not exist
    pub async fn ensure_subscription(
        &self,
        subscription: &str,
        topic: &str,
        ack_deadline_secs: u64,
    ) -> Result<()> {
        let body = json!({
            "topic": self.topic_path(topic),
            "ackDeadlineSeconds": ack_deadline_secs,
            "retainAckedMessages": false,
        });
        let request = self
            .gcp
            .http()
            .put(self.url(&self.subscription_path(subscription)))
            .json(&body);

        match self.gcp.send(SERVICE, request).await {
            Ok(_) => {
                tracing::info!(subscription, topic, "Created subscription");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(subscription, "Subscription already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish messages, batching as needed; returns message ids
    pub async fn publish(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<Vec<String>> {
        let url = format!("{}:publish", self.url(&self.topic_path(topic)));
        let mut ids = Vec::with_capacity(messages.len());

        for batch in batch_messages(messages) {
            let count = batch.len();
            let request = self.gcp.http().post(&url).json(&json!({ "messages": batch }));
            let response: PublishResponse = self.gcp.send_json(SERVICE, request).await?;
            if response.message_ids.len() != count {
                return Err(TurbineError::api(
                    SERVICE,
                    200,
                    format!("published {} messages but got {} ids", count, response.message_ids.len()),
                ));
            }
            tracing::debug!(topic, count, "Published batch");
            ids.extend(response.message_ids);
        }

        Ok(ids)
    }

    /// Pull up to `max` messages
    pub async fn pull(&self, subscription: &str, max: usize) -> Result<Vec<Delivery>> {
        let url = format!("{}:pull", self.url(&self.subscription_path(subscription)));
        let request = self
            .gcp
            .http()
            .post(&url)
            .json(&json!({ "maxMessages": max }));
        let response: PullResponse = self.gcp.send_json(SERVICE, request).await?;
        decode_pull(response)
    }

    /// Acknowledge messages
    pub async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<()> {
        let url = format!("{}:acknowledge", self.url(&self.subscription_path(subscription)));
        for chunk in ack_ids.chunks(MAX_ACK_IDS) {
            let request = self.gcp.http().post(&url).json(&json!({ "ackIds": chunk }));
            self.gcp.send(SERVICE, request).await?;
        }
        Ok(())
    }

    /// Change the ack deadline of messages; 0 makes them redeliverable now
    pub async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u64,
    ) -> Result<()> {
        let url = format!(
            "{}:modifyAckDeadline",
            self.url(&self.subscription_path(subscription))
        );
        for chunk in ack_ids.chunks(MAX_ACK_IDS) {
            let request = self
                .gcp
                .http()
                .post(&url)
                .json(&json!({ "ackIds": chunk, "ackDeadlineSeconds": seconds.min(600) }));
            self.gcp.send(SERVICE, request).await?;
        }
        Ok(())
    }

    /// Delete a subscription; a missing one is not an error
    pub async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        let request = self.gcp.http().delete(self.url(&self.subscription_path(subscription)));
        ignore_not_found(self.gcp.send(SERVICE, request).await.map(|_| ()))
    }

    /// Delete a topic; a missing one is not an error
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        let request = self.gcp.http().delete(self.url(&self.topic_path(topic)));
        ignore_not_found(self.gcp.send(SERVICE, request).await.map(|_| ()))
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn decode_pull(response: PullResponse) -> Result<Vec<Delivery>> {
    response
        .received_messages
        .into_iter()
        .map(|received| {
            let data = STANDARD
                .decode(received.message.data.as_bytes())
                .map_err(|e| TurbineError::TaskDecode(format!("bad base64 payload: {}", e)))?;
            Ok(Delivery {
                ack_id: received.ack_id,
                data,
                attributes: received.message.attributes,
            })
        })
        .collect()
}

/// Task queue over one topic and its subscription
#[derive(Clone)]
pub struct PubSubQueue {
    client: PubSubClient,
    topic: String,
    subscription: String,
}

impl PubSubQueue {
    /// Create a queue
    pub fn new(client: PubSubClient, topic: &str, subscription: &str) -> Self {
        Self {
            client,
            topic: topic.to_string(),
            subscription: subscription.to_string(),
        }
    }
}

#[async_trait]
impl TaskQueue for PubSubQueue {
    async fn publish(&self, tasks: &[Task]) -> Result<usize> {
        let messages = tasks
            .iter()
            .map(OutgoingMessage::from_task)
            .collect::<Result<Vec<_>>>()?;
        let ids = self.client.publish(&self.topic, messages).await?;
        Ok(ids.len())
    }

    async fn pull(&self, max: usize) -> Result<Vec<Delivery>> {
        self.client.pull(&self.subscription, max).await
    }

    async fn ack(&self, ack_ids: &[String]) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.client.acknowledge(&self.subscription, ack_ids).await
    }

    async fn extend(&self, ack_ids: &[String], lease: Duration) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.client
            .modify_ack_deadline(&self.subscription, ack_ids, lease.as_secs().max(10))
            .await
    }

    async fn release(&self, ack_ids: &[String]) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.client.modify_ack_deadline(&self.subscription, ack_ids, 0).await
    }
}
