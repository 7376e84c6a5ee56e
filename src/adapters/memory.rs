//! In-memory adapters for tests. Not durable.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    AdapterResult, BlobStore, ByteStream, DeferredPublish, ObjectInfo, QueuePublisher,
    QueueSubscriber, ReceivedMessage, SecretStore, TaskRecord, TaskScheduler,
};
use crate::clock::Clock;
use crate::errors::AdapterError;
use crate::types::BackupTriggerMessage;

/// Clock pinned to an instant until moved by the test.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub message_id: String,
    pub message: BackupTriggerMessage,
}

/// Topic-per-subscription queue: a subscription named like the topic sees
/// every message published to it.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct QueueInner {
    ready: HashMap<String, VecDeque<Delivery>>,
    leased: HashMap<String, (String, Delivery)>,
    published: Vec<(String, PublishedMessage)>,
}

#[derive(Debug, Clone)]
struct Delivery {
    message_id: String,
    data: Vec<u8>,
    attempts: u32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message ever published to `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        let inner = self.inner.lock().unwrap();
        inner
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Messages waiting for delivery on `topic`.
    pub fn pending(&self, topic: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.get(topic).map(VecDeque::len).unwrap_or(0)
    }

    /// Enqueues an arbitrary payload, bypassing serialization.
    pub fn push_raw(&self, topic: &str, data: &[u8]) -> String {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut inner = self.inner.lock().unwrap();
        inner
            .ready
            .entry(topic.to_string())
            .or_default()
            .push_back(Delivery {
                message_id: message_id.clone(),
                data: data.to_vec(),
                attempts: 0,
            });
        message_id
    }

    /// Messages delivered but neither acked nor nacked.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().leased.len()
    }
}

#[async_trait]
impl QueuePublisher for MemoryQueue {
    async fn publish(&self, topic: &str, message: &BackupTriggerMessage) -> AdapterResult<String> {
        let data = serde_json::to_vec(message)?;
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut inner = self.inner.lock().unwrap();
        inner
            .ready
            .entry(topic.to_string())
            .or_default()
            .push_back(Delivery {
                message_id: message_id.clone(),
                data,
                attempts: 0,
            });
        inner.published.push((
            topic.to_string(),
            PublishedMessage {
                message_id: message_id.clone(),
                message: message.clone(),
            },
        ));
        Ok(message_id)
    }
}

#[async_trait]
impl QueueSubscriber for MemoryQueue {
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> AdapterResult<Vec<ReceivedMessage>> {
        let mut inner = self.inner.lock().unwrap();
        let mut received = Vec::new();
        for _ in 0..max_messages {
            let Some(mut delivery) = inner
                .ready
                .get_mut(subscription)
                .and_then(VecDeque::pop_front)
            else {
                break;
            };
            delivery.attempts += 1;
            let ack_id = format!("{}-{}", delivery.message_id, delivery.attempts);
            received.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message_id: delivery.message_id.clone(),
                data: delivery.data.clone(),
                delivery_attempt: Some(delivery.attempts),
            });
            inner
                .leased
                .insert(ack_id, (subscription.to_string(), delivery));
        }
        Ok(received)
    }

    async fn ack(&self, _subscription: &str, ack_ids: &[String]) -> AdapterResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for ack_id in ack_ids {
            inner.leased.remove(ack_id);
        }
        Ok(())
    }

    async fn nack(&self, _subscription: &str, ack_ids: &[String]) -> AdapterResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for ack_id in ack_ids {
            if let Some((subscription, delivery)) = inner.leased.remove(ack_id) {
                inner
                    .ready
                    .entry(subscription)
                    .or_default()
                    .push_back(delivery);
            }
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        _subscription: &str,
        ack_ids: &[String],
        _seconds: u32,
    ) -> AdapterResult<()> {
        let inner = self.inner.lock().unwrap();
        match ack_ids.iter().find(|id| !inner.leased.contains_key(*id)) {
            Some(id) => Err(AdapterError::NotFound(format!("ack id {id}"))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredTask {
    record: TaskRecord,
    topic: String,
    message: BackupTriggerMessage,
}

/// Delayed-task scheduler that fires into a [`QueuePublisher`] when told to.
pub struct MemoryScheduler {
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<String, StoredTask>>,
    target_url: String,
}

impl MemoryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(HashMap::new()),
            target_url: "memory://queue/publish".to_string(),
        }
    }

    /// Publishes every task due at `now` and removes it, as the managed
    /// scheduler does once a callback succeeds. Failed publishes stay queued
    /// with their dispatch count bumped. Returns the number of fired tasks.
    pub async fn fire_due(&self, now: DateTime<Utc>, queue: &dyn QueuePublisher) -> usize {
        let due: Vec<StoredTask> = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .values()
                .filter(|t| t.record.schedule_time <= now)
                .cloned()
                .collect()
        };
        let mut fired = 0;
        for task in due {
            let outcome = queue.publish(&task.topic, &task.message).await;
            let mut tasks = self.tasks.lock().unwrap();
            match outcome {
                Ok(_) => {
                    tasks.remove(&task.record.name);
                    fired += 1;
                }
                Err(e) => {
                    if let Some(stored) = tasks.get_mut(&task.record.name) {
                        stored.record.dispatch_count += 1;
                        stored.record.response_count += 1;
                        stored.record.last_attempt_status = Some(e.to_string());
                    }
                }
            }
        }
        fired
    }

    /// Records a delivery attempt without firing, for exercising derived state.
    pub fn mark_dispatched(&self, task_name: &str) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(task_name) {
            task.record.dispatch_count += 1;
        }
    }
}

#[async_trait]
impl TaskScheduler for MemoryScheduler {
    async fn create_task(&self, task: DeferredPublish) -> AdapterResult<TaskRecord> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.task_name) {
            return Err(AdapterError::FailureResponseCode {
                code: 409,
                message: format!("task {} already exists", task.task_name),
            });
        }
        let record = TaskRecord {
            name: task.task_name.clone(),
            schedule_time: task.schedule_time,
            create_time: Some(self.clock.now()),
            dispatch_count: 0,
            response_count: 0,
            target_url: Some(format!("{}/{}", self.target_url, task.topic)),
            payload: Some(task.message.clone()),
            last_attempt_status: None,
        };
        tasks.insert(
            task.task_name,
            StoredTask {
                record: record.clone(),
                topic: task.topic,
                message: task.message,
            },
        );
        Ok(record)
    }

    async fn list_tasks(&self) -> AdapterResult<Vec<TaskRecord>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks.values().map(|t| t.record.clone()).collect())
    }

    async fn get_task(&self, task_name: &str) -> AdapterResult<TaskRecord> {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .get(task_name)
            .map(|t| t.record.clone())
            .ok_or_else(|| AdapterError::NotFound(task_name.to_string()))
    }

    async fn delete_task(&self, task_name: &str) -> AdapterResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks
            .remove(task_name)
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(task_name.to_string()))
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    info: ObjectInfo,
    data: Bytes,
}

pub struct MemoryBlobStore {
    bucket: String,
    clock: Arc<dyn Clock>,
    objects: Mutex<HashMap<String, StoredObject>>,
    signed: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new(bucket: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            bucket: bucket.to_string(),
            clock,
            objects: Mutex::new(HashMap::new()),
            signed: AtomicUsize::new(0),
        }
    }

    pub fn contents(&self, name: &str) -> Option<Bytes> {
        let objects = self.objects.lock().unwrap();
        objects.get(name).map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Number of signed urls issued so far.
    pub fn signed_url_count(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        name: &str,
        _content_type: &str,
        size: Option<u64>,
        metadata: HashMap<String, String>,
        data: ByteStream,
    ) -> AdapterResult<ObjectInfo> {
        // buffer first so a failed stream never becomes visible
        let data = data.collect().await?;
        if let Some(expected) = size {
            if expected != data.len() as u64 {
                return Err(AdapterError::UnexpectedResponse(format!(
                    "short upload for {name}: expected {expected} bytes, got {}",
                    data.len()
                )));
            }
        }
        let now = self.clock.now();
        let info = ObjectInfo {
            name: name.to_string(),
            size: data.len() as u64,
            created: now,
            updated: now,
            metadata,
        };
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            name.to_string(),
            StoredObject {
                info: info.clone(),
                data,
            },
        );
        Ok(info)
    }

    async fn list(&self, prefix: &str) -> AdapterResult<Vec<ObjectInfo>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .values()
            .filter(|o| o.info.name.starts_with(prefix))
            .map(|o| o.info.clone())
            .collect())
    }

    async fn stat(&self, name: &str) -> AdapterResult<ObjectInfo> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(name)
            .map(|o| o.info.clone())
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> AdapterResult<()> {
        let mut objects = self.objects.lock().unwrap();
        objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))
    }

    async fn signed_url(&self, name: &str, expires_in: Duration) -> AdapterResult<String> {
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "memory://{}/{}?expires={}",
            self.bucket,
            name,
            expires_in.as_secs()
        ))
    }

    fn storage_url(&self, name: &str) -> String {
        format!("memory://{}/{}", self.bucket, name)
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: &str, value: &str) -> Self {
        self.secrets
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn secret(&self, name: &str) -> AdapterResult<String> {
        let secrets = self.secrets.lock().unwrap();
        secrets
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("secret {name}")))
    }
}
