//! In-process task queue with Pub/Sub-like leases

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Delivery, TaskQueue};
use crate::error::{Result, TurbineError};
use crate::models::Task;

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Inner {
    ready: VecDeque<Message>,
    leased: HashMap<String, (Message, Instant)>,
    next_ack: u64,
    published: usize,
    redelivered: usize,
}

/// Queue shared by local workers.
///
/// Pulled messages are leased for `lease`; a lease that runs out without an
/// ack puts the message back at the end of the queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    lease: Duration,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new(lease: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ready: VecDeque::new(),
                leased: HashMap::new(),
                next_ack: 0,
                published: 0,
                redelivered: 0,
            })),
            lease,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| TurbineError::Other("memory queue lock poisoned".into()))
    }

    /// Messages waiting to be pulled
    pub fn ready(&self) -> usize {
        self.lock().map(|inner| inner.ready.len()).unwrap_or(0)
    }

    /// Messages currently leased
    pub fn in_flight(&self) -> usize {
        self.lock().map(|inner| inner.leased.len()).unwrap_or(0)
    }

    /// True when nothing is waiting or leased
    pub fn is_drained(&self) -> bool {
        self.lock()
            .map(|inner| inner.ready.is_empty() && inner.leased.is_empty())
            .unwrap_or(false)
    }

    /// Total messages ever published
    pub fn published(&self) -> usize {
        self.lock().map(|inner| inner.published).unwrap_or(0)
    }

    /// Messages put back after their lease ran out
    pub fn redelivered(&self) -> usize {
        self.lock().map(|inner| inner.redelivered).unwrap_or(0)
    }

    /// Publish a raw payload, bypassing task encoding
    pub fn publish_raw(&self, data: Vec<u8>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ready.push_back(Message {
            data,
            attributes: BTreeMap::new(),
        });
        inner.published += 1;
        Ok(())
    }
}

impl Inner {
    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some((message, _)) = self.leased.remove(&id) {
                tracing::debug!(ack_id = %id, "Lease expired, redelivering");
                self.ready.push_back(message);
                self.redelivered += 1;
            }
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, tasks: &[Task]) -> Result<usize> {
        let mut messages = Vec::with_capacity(tasks.len());
        for task in tasks {
            messages.push(Message {
                data: task.encode()?,
                attributes: task.attributes(),
            });
        }

        let mut inner = self.lock()?;
        inner.published += messages.len();
        inner.ready.extend(messages);
        Ok(tasks.len())
    }

    async fn pull(&self, max: usize) -> Result<Vec<Delivery>> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.expire_leases(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(message) = inner.ready.pop_front() else {
                break;
            };
            inner.next_ack += 1;
            let ack_id = format!("ack-{}", inner.next_ack);
            deliveries.push(Delivery {
                ack_id: ack_id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
            });
            inner.leased.insert(ack_id, (message, now + self.lease));
        }

        Ok(deliveries)
    }

    async fn ack(&self, ack_ids: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        for id in ack_ids {
            inner.leased.remove(id);
        }
        Ok(())
    }

    async fn extend(&self, ack_ids: &[String], lease: Duration) -> Result<()> {
        let deadline = Instant::now() + lease;
        let mut inner = self.lock()?;
        for id in ack_ids {
            if let Some(entry) = inner.leased.get_mut(id) {
                entry.1 = deadline;
            }
        }
        Ok(())
    }

    async fn release(&self, ack_ids: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        for id in ack_ids {
            if let Some((message, _)) = inner.leased.remove(id) {
                inner.ready.push_back(message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::models::JobManifest;
    use chrono::Utc;

    fn tasks(n: usize) -> Vec<Task> {
        let content: String = (0..n).map(|i| format!("echo {}\n", i)).collect();
        JobManifest::from_text("job", &content)
            .unwrap()
            .expand(&WorkerConfig::default(), Utc::now())
    }

    #[tokio::test]
    async fn test_pull_and_ack() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        assert_eq!(queue.publish(&tasks(3)).await.unwrap(), 3);

        let batch = queue.pull(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.ready(), 1);
        assert_eq!(queue.in_flight(), 2);

        let first = Task::decode(&batch[0].data).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(batch[0].attributes.get("job").map(String::as_str), Some("job"));

        let ids: Vec<String> = batch.iter().map(|d| d.ack_id.clone()).collect();
        queue.ack(&ids).await.unwrap();
        assert_eq!(queue.in_flight(), 0);

        let rest = queue.pull(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        queue.ack(&[rest[0].ack_id.clone()]).await.unwrap();
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new(Duration::from_millis(20));
        queue.publish(&tasks(1)).await.unwrap();

        let first = queue.pull(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.pull(1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = queue.pull(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].ack_id, first[0].ack_id);
        assert_eq!(queue.redelivered(), 1);

        // acking the stale handle does not remove the new lease
        queue.ack(&[first[0].ack_id.clone()]).await.unwrap();
        assert_eq!(queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_extend_and_release() {
        let queue = MemoryQueue::new(Duration::from_millis(20));
        queue.publish(&tasks(2)).await.unwrap();

        let batch = queue.pull(2).await.unwrap();
        queue
            .extend(&[batch[0].ack_id.clone()], Duration::from_secs(60))
            .await
            .unwrap();
        queue.release(&[batch[1].ack_id.clone()]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let next = queue.pull(5).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(Task::decode(&next[0].data).unwrap().index, 1);
    }
}
