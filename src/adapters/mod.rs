//! Capability interfaces consumed by the orchestrator and the workers.
//!
//! Concrete implementations live in [`crate::gcp`]. In-memory fakes for tests
//! live in `memory`, built only with the `testing` feature.

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod stream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::errors::AdapterError;
use crate::types::BackupTriggerMessage;
pub use stream::ByteStream;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publishes a trigger message and returns the queue-assigned message id.
    async fn publish(&self, topic: &str, message: &BackupTriggerMessage) -> AdapterResult<String>;
}

/// A message handed to a consumer, acknowledged by `ack_id`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub data: Vec<u8>,
    pub delivery_attempt: Option<u32>,
}

#[async_trait]
pub trait QueueSubscriber: Send + Sync {
    async fn pull(&self, subscription: &str, max_messages: u32)
        -> AdapterResult<Vec<ReceivedMessage>>;
    async fn ack(&self, subscription: &str, ack_ids: &[String]) -> AdapterResult<()>;
    /// Makes the messages immediately available for redelivery.
    async fn nack(&self, subscription: &str, ack_ids: &[String]) -> AdapterResult<()>;
    async fn extend_lease(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u32,
    ) -> AdapterResult<()>;
}

/// A publish deferred until `schedule_time`; the scheduler performs it on our behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredPublish {
    pub task_name: String,
    pub schedule_time: DateTime<Utc>,
    pub topic: String,
    pub message: BackupTriggerMessage,
}

/// A task as reported by the scheduler backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub name: String,
    pub schedule_time: DateTime<Utc>,
    pub create_time: Option<DateTime<Utc>>,
    pub dispatch_count: u32,
    pub response_count: u32,
    pub target_url: Option<String>,
    /// Trigger message carried by the task callback, when the backend exposes it.
    pub payload: Option<BackupTriggerMessage>,
    pub last_attempt_status: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn create_task(&self, task: DeferredPublish) -> AdapterResult<TaskRecord>;
    async fn list_tasks(&self) -> AdapterResult<Vec<TaskRecord>>;
    /// Fails with a not-found error when the task has fired or was deleted.
    async fn get_task(&self, task_name: &str) -> AdapterResult<TaskRecord>;
    async fn delete_task(&self, task_name: &str) -> AdapterResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads the stream as one object; readers never observe a partial object.
    async fn upload(
        &self,
        name: &str,
        content_type: &str,
        size: Option<u64>,
        metadata: HashMap<String, String>,
        data: ByteStream,
    ) -> AdapterResult<ObjectInfo>;
    async fn list(&self, prefix: &str) -> AdapterResult<Vec<ObjectInfo>>;
    async fn stat(&self, name: &str) -> AdapterResult<ObjectInfo>;
    async fn delete(&self, name: &str) -> AdapterResult<()>;
    async fn signed_url(&self, name: &str, expires_in: std::time::Duration)
        -> AdapterResult<String>;
    /// Public location of an object, e.g. `gs://bucket/name`.
    fn storage_url(&self, name: &str) -> String;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn secret(&self, name: &str) -> AdapterResult<String>;
}
