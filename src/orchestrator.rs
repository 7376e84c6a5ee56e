//! Trigger, schedule, inspect and cancel backups; list, sign and delete artifacts.
//!
//! "Schedule" is a trigger deferred by the scheduler: the task it creates
//! publishes the same [`BackupTriggerMessage`] to the same topic when it fires,
//! so workers handle both paths identically.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::sync::Arc;

use crate::adapters::{BlobStore, DeferredPublish, ObjectInfo, QueuePublisher, TaskRecord, TaskScheduler};
use crate::clock::Clock;
use crate::config::TopicConfig;
use crate::errors::{AdapterError, PlatformError};
use crate::types::{
    task_id_from_name, BackupArtifact, BackupTriggerMessage, DatabaseKind, ScheduledTask,
    TaskDetail, TaskId, TaskQueuePath, TaskState,
};

pub const MIN_DELAY_MINUTES: i64 = 1;
/// 30 days
pub const MAX_DELAY_MINUTES: i64 = 43_200;
pub const DEFAULT_DOWNLOAD_EXPIRY_MINUTES: u32 = 60;
/// Longest lifetime of a V4 signed url (7 days).
pub const MAX_DOWNLOAD_EXPIRY_MINUTES: u32 = 10_080;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBackup {
    pub task_id: String,
    pub task_name: String,
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadUrl {
    pub signed_url: String,
    pub expires_at: DateTime<Utc>,
}

pub struct BackupOrchestrator {
    queue: Arc<dyn QueuePublisher>,
    scheduler: Arc<dyn TaskScheduler>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    topics: TopicConfig,
    task_queue: TaskQueuePath,
}

impl BackupOrchestrator {
    pub fn new(
        queue: Arc<dyn QueuePublisher>,
        scheduler: Arc<dyn TaskScheduler>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        topics: TopicConfig,
        task_queue: TaskQueuePath,
    ) -> Self {
        Self {
            queue,
            scheduler,
            blobs,
            clock,
            topics,
            task_queue,
        }
    }

    /// Publishes a manual trigger for `database` and returns the queue message id.
    pub async fn trigger_immediate(&self, database: DatabaseKind) -> Result<String, PlatformError> {
        let message = BackupTriggerMessage::manual(database, self.clock.now());
        let topic = self.topics.topic(database);
        let message_id = self
            .queue
            .publish(topic, &message)
            .await
            .map_err(PlatformError::PublishError)?;
        info!(
            "published manual {} backup trigger to {}: message_id={}",
            database, topic, message_id
        );
        Ok(message_id)
    }

    /// Creates a task that publishes a trigger for `database` in `delay_minutes`.
    pub async fn schedule_delayed(
        &self,
        database: DatabaseKind,
        delay_minutes: i64,
    ) -> Result<ScheduledBackup, PlatformError> {
        if !(MIN_DELAY_MINUTES..=MAX_DELAY_MINUTES).contains(&delay_minutes) {
            return Err(PlatformError::InvalidArgument(format!(
                "delayMinutes must be between {} and {} (30 days), got {}",
                MIN_DELAY_MINUTES, MAX_DELAY_MINUTES, delay_minutes
            )));
        }
        let now = self.clock.now();
        let scheduled_for = now + Duration::minutes(delay_minutes);
        let task_id = TaskId::new(database, now);
        let task_name = self.task_queue.task_name(&task_id);

        let record = self
            .scheduler
            .create_task(DeferredPublish {
                task_name: task_name.clone(),
                schedule_time: scheduled_for,
                topic: self.topics.topic(database).to_string(),
                message: BackupTriggerMessage::scheduled(database, now, scheduled_for),
            })
            .await
            .map_err(PlatformError::SchedulingError)?;
        info!(
            "scheduled {} backup task {} for {}",
            database, record.name, scheduled_for
        );

        Ok(ScheduledBackup {
            task_id: task_id.to_string(),
            task_name: record.name,
            scheduled_for,
        })
    }

    /// Every pending or dispatched backup task, soonest first.
    pub async fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, PlatformError> {
        let records = self
            .scheduler
            .list_tasks()
            .await
            .map_err(PlatformError::SchedulingError)?;

        let mut tasks: Vec<ScheduledTask> = records
            .into_iter()
            .filter_map(|record| {
                let task = scheduled_task(record, false);
                if task.is_none() {
                    warn!("skipping task without a recognizable database kind");
                }
                task
            })
            .collect();
        tasks.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    pub async fn get_task_details(&self, task_id: &str) -> Result<ScheduledTask, PlatformError> {
        let task_name = self.task_name(task_id)?;
        let record = self
            .scheduler
            .get_task(&task_name)
            .await
            .map_err(|e| not_found_or(e, format!("task {task_id}"), PlatformError::SchedulingError))?;
        scheduled_task(record, true).ok_or_else(|| {
            PlatformError::NotFoundError(format!("task {task_id} is not a backup task"))
        })
    }

    /// Deletes a task before it fires. A task that already fired is gone and
    /// reported as not found.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), PlatformError> {
        let task_name = self.task_name(task_id)?;
        self.scheduler
            .delete_task(&task_name)
            .await
            .map_err(|e| not_found_or(e, format!("task {task_id}"), PlatformError::SchedulingError))?;
        info!("cancelled backup task {}", task_name);
        Ok(())
    }

    /// Artifacts of `database`, most recent first.
    pub async fn list_artifacts(
        &self,
        database: DatabaseKind,
    ) -> Result<Vec<BackupArtifact>, PlatformError> {
        let objects = self
            .blobs
            .list(&database.storage_prefix())
            .await
            .map_err(PlatformError::StorageError)?;
        let mut artifacts: Vec<BackupArtifact> = objects
            .into_iter()
            .filter_map(|object| self.artifact(object))
            .collect();
        artifacts.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));
        Ok(artifacts)
    }

    pub async fn generate_download_url(
        &self,
        name: &str,
        expires_in_minutes: Option<u32>,
    ) -> Result<DownloadUrl, PlatformError> {
        validate_artifact_name(name)?;
        let minutes = expires_in_minutes.unwrap_or(DEFAULT_DOWNLOAD_EXPIRY_MINUTES);
        if !(1..=MAX_DOWNLOAD_EXPIRY_MINUTES).contains(&minutes) {
            return Err(PlatformError::InvalidArgument(format!(
                "expiresInMinutes must be between 1 and {MAX_DOWNLOAD_EXPIRY_MINUTES}, got {minutes}"
            )));
        }
        self.blobs
            .stat(name)
            .await
            .map_err(|e| not_found_or(e, format!("backup {name}"), PlatformError::StorageError))?;

        let expires_at = self.clock.now() + Duration::minutes(i64::from(minutes));
        let signed_url = self
            .blobs
            .signed_url(name, std::time::Duration::from_secs(u64::from(minutes) * 60))
            .await
            .map_err(PlatformError::StorageError)?;
        Ok(DownloadUrl {
            signed_url,
            expires_at,
        })
    }

    pub async fn delete_artifact(&self, name: &str) -> Result<(), PlatformError> {
        validate_artifact_name(name)?;
        self.blobs
            .delete(name)
            .await
            .map_err(|e| not_found_or(e, format!("backup {name}"), PlatformError::StorageError))?;
        info!("deleted backup {}", name);
        Ok(())
    }

    fn task_name(&self, task_id: &str) -> Result<String, PlatformError> {
        let task_id: TaskId = task_id.parse()?;
        Ok(self.task_queue.task_name(&task_id))
    }

    fn artifact(&self, object: ObjectInfo) -> Option<BackupArtifact> {
        let database = DatabaseKind::from_storage_key(&object.name)?;
        Some(BackupArtifact {
            storage_url: self.blobs.storage_url(&object.name),
            name: object.name,
            database,
            size: object.size,
            created: object.created,
            updated: object.updated,
            metadata: object.metadata,
        })
    }
}

/// Resolves the database kind from the task payload first, then from a strict
/// parse of the task id.
fn scheduled_task(record: TaskRecord, with_detail: bool) -> Option<ScheduledTask> {
    let task_id = task_id_from_name(&record.name).to_string();
    let database = match &record.payload {
        Some(payload) => payload.database,
        None => task_id.parse::<TaskId>().ok()?.database(),
    };
    let detail = with_detail.then(|| TaskDetail {
        target_url: record.target_url.clone(),
        payload: record.payload.clone(),
        last_attempt_status: record.last_attempt_status.clone(),
    });
    Some(ScheduledTask {
        task_id,
        state: TaskState::from_dispatch_count(record.dispatch_count),
        task_name: record.name,
        database,
        scheduled_for: record.schedule_time,
        dispatch_count: record.dispatch_count,
        response_count: record.response_count,
        create_time: record.create_time,
        detail,
    })
}

fn validate_artifact_name(name: &str) -> Result<(), PlatformError> {
    if name.trim().is_empty() {
        return Err(PlatformError::InvalidArgument(
            "fileName is required".to_string(),
        ));
    }
    if DatabaseKind::from_storage_key(name).is_none() || name.contains("..") {
        return Err(PlatformError::InvalidArgument(format!(
            "fileName must start with a database prefix such as postgres/, got {name}"
        )));
    }
    Ok(())
}

fn not_found_or(
    e: AdapterError,
    what: String,
    otherwise: fn(AdapterError) -> PlatformError,
) -> PlatformError {
    if e.is_not_found() {
        PlatformError::NotFoundError(format!("{what} not found"))
    } else {
        otherwise(e)
    }
}
