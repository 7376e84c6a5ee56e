use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The database kinds this system knows how to back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Mongodb,
    Questdb,
    Qdrantdb,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 4] = [
        DatabaseKind::Postgres,
        DatabaseKind::Mongodb,
        DatabaseKind::Questdb,
        DatabaseKind::Qdrantdb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Mongodb => "mongodb",
            DatabaseKind::Questdb => "questdb",
            DatabaseKind::Qdrantdb => "qdrantdb",
        }
    }

    /// Key prefix under which this kind's artifacts are stored, e.g. `postgres/`.
    pub fn storage_prefix(&self) -> String {
        format!("{}/", self.as_str())
    }

    /// Resolves the kind owning a storage key by its exact first path segment.
    pub fn from_storage_key(key: &str) -> Option<DatabaseKind> {
        let (prefix, rest) = key.split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        prefix.parse().ok()
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown database kind `{0}`, expected one of postgres, mongodb, questdb, qdrantdb")]
pub struct UnknownDatabase(pub String);

impl FromStr for DatabaseKind {
    type Err = UnknownDatabase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(DatabaseKind::Postgres),
            "mongodb" => Ok(DatabaseKind::Mongodb),
            "questdb" => Ok(DatabaseKind::Questdb),
            "qdrantdb" => Ok(DatabaseKind::Qdrantdb),
            other => Err(UnknownDatabase(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupAction {
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggeredBy {
    Manual,
    ScheduledTask,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggeredBy::Manual => f.write_str("manual"),
            TriggeredBy::ScheduledTask => f.write_str("scheduled-task"),
        }
    }
}

/// Payload placed on a database kind's topic.
///
/// Workers never learn whether they were triggered immediately or on a delay
/// except through `triggered_by`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTriggerMessage {
    pub action: BackupAction,
    pub database: DatabaseKind,
    pub triggered_by: TriggeredBy,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl BackupTriggerMessage {
    pub fn manual(database: DatabaseKind, now: DateTime<Utc>) -> Self {
        Self {
            action: BackupAction::Backup,
            database,
            triggered_by: TriggeredBy::Manual,
            timestamp: now,
            scheduled_for: None,
        }
    }

    pub fn scheduled(
        database: DatabaseKind,
        now: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            action: BackupAction::Backup,
            database,
            triggered_by: TriggeredBy::ScheduledTask,
            timestamp: now,
            scheduled_for: Some(scheduled_for),
        }
    }
}

/// Identifier of a scheduled backup task: `{database}-backup-{unixMillisAtCreation}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    database: DatabaseKind,
    created_millis: i64,
}

const TASK_ID_INFIX: &str = "-backup-";

impl TaskId {
    pub fn new(database: DatabaseKind, created_at: DateTime<Utc>) -> Self {
        Self {
            database,
            created_millis: created_at.timestamp_millis(),
        }
    }

    pub fn database(&self) -> DatabaseKind {
        self.database
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.database, TASK_ID_INFIX, self.created_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed task id `{0}`, expected {{database}}-backup-{{unixMillis}}")]
pub struct MalformedTaskId(pub String);

impl FromStr for TaskId {
    type Err = MalformedTaskId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedTaskId(s.to_string());
        let (kind, millis) = s.split_once(TASK_ID_INFIX).ok_or_else(malformed)?;
        let database = kind.parse::<DatabaseKind>().map_err(|_| malformed())?;
        if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let created_millis = millis.parse::<i64>().map_err(|_| malformed())?;
        Ok(Self {
            database,
            created_millis,
        })
    }
}

/// Location of the delayed-task queue; task names are derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueuePath {
    pub project: String,
    pub location: String,
    pub queue: String,
}

impl TaskQueuePath {
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project, self.location, self.queue
        )
    }

    pub fn task_name(&self, task_id: &TaskId) -> String {
        format!("{}/tasks/{}", self.parent(), task_id)
    }
}

/// Returns the last path segment of a fully-qualified task name.
pub fn task_id_from_name(task_name: &str) -> &str {
    task_name.rsplit('/').next().unwrap_or(task_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Dispatched,
}

impl TaskState {
    pub fn from_dispatch_count(dispatch_count: u32) -> Self {
        if dispatch_count == 0 {
            TaskState::Pending
        } else {
            TaskState::Dispatched
        }
    }
}

/// A delayed backup as surfaced to API callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub task_id: String,
    pub task_name: String,
    pub database: DatabaseKind,
    pub scheduled_for: DateTime<Utc>,
    pub state: TaskState,
    pub dispatch_count: u32,
    pub response_count: u32,
    pub create_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<TaskDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    pub target_url: Option<String>,
    pub payload: Option<BackupTriggerMessage>,
    pub last_attempt_status: Option<String>,
}

/// A compressed backup stored in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub name: String,
    pub database: DatabaseKind,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub storage_url: String,
    pub metadata: HashMap<String, String>,
}
