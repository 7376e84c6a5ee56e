use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::errors::ConfigError;
use crate::types::{DatabaseKind, TaskQueuePath};
use crate::worker::recipes::RecipeConfig;
use crate::worker::retry::RetryPolicy;

/// Google Cloud project, bucket and API endpoints, shared by the API server
/// and the workers.
#[derive(Clone, Debug)]
pub struct GcpConfig {
    pub project_id: String,
    pub backup_bucket: String,
    pub pubsub_endpoint: Url,
    pub tasks_endpoint: Url,
    pub secrets_endpoint: Url,
}

impl GcpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            project_id: from_env_required("GCP_PROJECT_ID")?,
            backup_bucket: from_env_required("BACKUP_BUCKET")?,
            pubsub_endpoint: parse_env("PUBSUB_ENDPOINT", "https://pubsub.googleapis.com/v1/")?,
            tasks_endpoint: parse_env("TASKS_ENDPOINT", "https://cloudtasks.googleapis.com/v2/")?,
            secrets_endpoint: parse_env(
                "SECRETS_ENDPOINT",
                "https://secretmanager.googleapis.com/v1/",
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("GCP_PROJECT_ID", &self.project_id),
            ("BACKUP_BUCKET", &self.backup_bucket),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key.to_string()));
            }
        }
        Ok(())
    }
}

/// Settings of the API server.
#[derive(Clone, Debug)]
pub struct Config {
    pub gcp: GcpConfig,
    /// Cloud Tasks location, e.g. `europe-west1`
    pub location: String,
    pub tasks_queue: String,
    /// Identity the scheduler authenticates as when it publishes on fire
    pub tasks_service_account: String,
    pub topics: TopicConfig,
    pub api_key: String,
    pub server_port: u16,
    pub server_workers: u16,
}

/// Queue topic per database kind. Every kind has its own topic; there is no
/// shared fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    pub postgres: String,
    pub mongodb: String,
    pub questdb: String,
    pub qdrantdb: String,
}

impl TopicConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |kind: DatabaseKind| {
            from_env_default(&Self::env_key(kind), &format!("{kind}-backup-trigger"))
        };
        let cfg = Self {
            postgres: read(DatabaseKind::Postgres),
            mongodb: read(DatabaseKind::Mongodb),
            questdb: read(DatabaseKind::Questdb),
            qdrantdb: read(DatabaseKind::Qdrantdb),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn topic(&self, database: DatabaseKind) -> &str {
        match database {
            DatabaseKind::Postgres => &self.postgres,
            DatabaseKind::Mongodb => &self.mongodb,
            DatabaseKind::Questdb => &self.questdb,
            DatabaseKind::Qdrantdb => &self.qdrantdb,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in DatabaseKind::ALL {
            if self.topic(kind).trim().is_empty() {
                return Err(ConfigError::Missing(Self::env_key(kind)));
            }
        }
        Ok(())
    }

    fn env_key(kind: DatabaseKind) -> String {
        format!("PUBSUB_TOPIC_{}", kind.as_str().to_uppercase())
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            postgres: "postgres-backup-trigger".to_string(),
            mongodb: "mongodb-backup-trigger".to_string(),
            questdb: "questdb-backup-trigger".to_string(),
            qdrantdb: "qdrantdb-backup-trigger".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Self {
            gcp: GcpConfig::from_env()?,
            location: from_env_default("GCP_LOCATION", "europe-west1"),
            tasks_queue: from_env_default("TASKS_QUEUE", "backup-scheduler"),
            tasks_service_account: from_env_required("TASKS_SERVICE_ACCOUNT")?,
            topics: TopicConfig::from_env()?,
            api_key: from_env_required("API_KEY")?,
            server_port: parse_env("WEBSERVER_PORT", "8080")?,
            server_workers: parse_env("WEBSERVER_WORKERS", "8")?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gcp.validate()?;
        self.topics.validate()?;
        for (key, value) in [
            ("GCP_LOCATION", &self.location),
            ("TASKS_QUEUE", &self.tasks_queue),
            ("TASKS_SERVICE_ACCOUNT", &self.tasks_service_account),
            ("API_KEY", &self.api_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key.to_string()));
            }
        }
        if self.server_workers == 0 {
            return Err(invalid("WEBSERVER_WORKERS", "must be at least 1"));
        }
        Ok(())
    }

    pub fn task_queue_path(&self) -> TaskQueuePath {
        TaskQueuePath {
            project: self.gcp.project_id.clone(),
            location: self.location.clone(),
            queue: self.tasks_queue.clone(),
        }
    }
}

/// Settings of one backup worker process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub database: DatabaseKind,
    pub subscription: String,
    pub max_messages: u32,
    pub ack_deadline: Duration,
    pub poll_interval: Duration,
    pub ssh: SshConfig,
    pub secrets: CredentialSecrets,
    pub recipes: RecipeConfig,
}

#[derive(Clone, Debug)]
pub struct SshConfig {
    pub port: u16,
    /// Connect and authentication bound.
    pub timeout: Duration,
    /// Bound on a single remote command.
    pub command_timeout: Duration,
}

/// Secret names holding the remote host credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSecrets {
    pub private_key: String,
    pub host: String,
    pub username: String,
}

impl Default for CredentialSecrets {
    fn default() -> Self {
        Self {
            private_key: "backup-ssh-private-key".to_string(),
            host: "backup-ssh-host".to_string(),
            username: "backup-ssh-username".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database: DatabaseKind = from_env_required("WORKER_DATABASE")?
            .parse()
            .map_err(|e: crate::types::UnknownDatabase| invalid("WORKER_DATABASE", &e.to_string()))?;
        let defaults = RecipeConfig::default();
        let recipes = RecipeConfig {
            remote_tmp_dir: from_env_default("REMOTE_TMP_DIR", &defaults.remote_tmp_dir),
            stale_after: Duration::from_secs(
                60 * parse_env::<u64>("REMOTE_STALE_AFTER_MIN", "1440")?,
            ),
            postgres_dump_command: from_env_default(
                "POSTGRES_DUMP_COMMAND",
                &defaults.postgres_dump_command,
            ),
            mongodump_command: from_env_default("MONGODUMP_COMMAND", &defaults.mongodump_command),
            questdb_http_url: from_env_default("QUESTDB_HTTP_URL", &defaults.questdb_http_url),
            questdb_backup_dir: from_env_default(
                "QUESTDB_BACKUP_DIR",
                &defaults.questdb_backup_dir,
            ),
            qdrant_http_url: from_env_default("QDRANT_HTTP_URL", &defaults.qdrant_http_url),
            qdrant_api_key_secret: env::var("QDRANT_API_KEY_SECRET").ok(),
            qdrant_snapshot_dirs: from_env_default(
                "QDRANT_SNAPSHOT_DIRS",
                &defaults.qdrant_snapshot_dirs.join(","),
            )
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
            qdrant_poll: RetryPolicy {
                max_attempts: parse_env("QDRANT_POLL_MAX_ATTEMPTS", "10")?,
                base_delay: Duration::from_millis(parse_env("QDRANT_POLL_BASE_DELAY_MS", "1000")?),
                multiplier: parse_env("QDRANT_POLL_MULTIPLIER", "2")?,
                max_delay: Duration::from_millis(parse_env("QDRANT_POLL_MAX_DELAY_MS", "30000")?),
            },
        };
        let cfg = Self {
            database,
            subscription: from_env_default(
                "PUBSUB_SUBSCRIPTION",
                &format!("{database}-backup-worker"),
            ),
            max_messages: parse_env("WORKER_MAX_MESSAGES", "2")?,
            ack_deadline: Duration::from_secs(parse_env("WORKER_ACK_DEADLINE_SEC", "600")?),
            poll_interval: Duration::from_secs(parse_env("WORKER_POLL_INTERVAL_SEC", "5")?),
            ssh: SshConfig {
                port: parse_env("SSH_PORT", "22")?,
                timeout: Duration::from_secs(parse_env("SSH_TIMEOUT_SEC", "30")?),
                command_timeout: Duration::from_secs(parse_env("SSH_COMMAND_TIMEOUT_SEC", "21600")?),
            },
            secrets: CredentialSecrets {
                private_key: from_env_default("SSH_PRIVATE_KEY_SECRET", "backup-ssh-private-key"),
                host: from_env_default("SSH_HOST_SECRET", "backup-ssh-host"),
                username: from_env_default("SSH_USERNAME_SECRET", "backup-ssh-username"),
            },
            recipes,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages == 0 {
            return Err(invalid("WORKER_MAX_MESSAGES", "must be at least 1"));
        }
        // Pub/Sub accepts ack deadlines of 10..=600 seconds
        if !(10..=600).contains(&self.ack_deadline.as_secs()) {
            return Err(invalid("WORKER_ACK_DEADLINE_SEC", "must be within 10..=600"));
        }
        if self.ssh.command_timeout.is_zero() {
            return Err(invalid("SSH_COMMAND_TIMEOUT_SEC", "must be at least 1"));
        }
        // a sweep must never reach a run that may still be in progress
        if self.recipes.stale_after <= self.ssh.command_timeout {
            return Err(invalid(
                "REMOTE_STALE_AFTER_MIN",
                "must be longer than SSH_COMMAND_TIMEOUT_SEC",
            ));
        }
        if self.recipes.qdrant_poll.max_attempts == 0 {
            return Err(invalid("QDRANT_POLL_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.recipes.qdrant_poll.multiplier == 0 {
            return Err(invalid("QDRANT_POLL_MULTIPLIER", "must be at least 1"));
        }
        if self.recipes.qdrant_snapshot_dirs.is_empty() {
            return Err(invalid("QDRANT_SNAPSHOT_DIRS", "needs at least one directory"));
        }
        Ok(())
    }
}

/// source a variable from environment - use default if not exists
fn from_env_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn from_env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    from_env_default(key, default)
        .parse::<T>()
        .map_err(|e| invalid(key, &e.to_string()))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            gcp: GcpConfig {
                project_id: "proj".to_string(),
                backup_bucket: "backups".to_string(),
                pubsub_endpoint: Url::parse("https://pubsub.googleapis.com/v1/").unwrap(),
                tasks_endpoint: Url::parse("https://cloudtasks.googleapis.com/v2/").unwrap(),
                secrets_endpoint: Url::parse("https://secretmanager.googleapis.com/v1/").unwrap(),
            },
            location: "europe-west1".to_string(),
            tasks_queue: "backup-scheduler".to_string(),
            tasks_service_account: "scheduler@proj.iam.gserviceaccount.com".to_string(),
            topics: TopicConfig::default(),
            api_key: "key".to_string(),
            server_port: 8080,
            server_workers: 8,
        }
    }

    #[test]
    fn test_validate_rejects_blank_required_values() {
        assert!(config().validate().is_ok());

        let mut cfg = config();
        cfg.api_key = "  ".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Missing(k)) if k == "API_KEY"));

        let mut cfg = config();
        cfg.gcp.backup_bucket = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_topics() {
        let topics = TopicConfig::default();
        assert_eq!(topics.topic(DatabaseKind::Postgres), "postgres-backup-trigger");
        assert_eq!(topics.topic(DatabaseKind::Qdrantdb), "qdrantdb-backup-trigger");
    }

    #[test]
    fn test_each_kind_keeps_its_own_topic() {
        let topics = TopicConfig {
            questdb: "qdb-nightly".to_string(),
            ..TopicConfig::default()
        };
        assert_eq!(topics.topic(DatabaseKind::Questdb), "qdb-nightly");
        assert_eq!(topics.topic(DatabaseKind::Mongodb), "mongodb-backup-trigger");
        let names: std::collections::HashSet<_> =
            DatabaseKind::ALL.into_iter().map(|k| topics.topic(k)).collect();
        assert_eq!(names.len(), DatabaseKind::ALL.len());
    }

    #[test]
    fn test_blank_topic_is_rejected() {
        let mut cfg = config();
        cfg.topics.mongodb = " ".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing(k)) if k == "PUBSUB_TOPIC_MONGODB"
        ));
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            database: DatabaseKind::Postgres,
            subscription: "postgres-backup-trigger".to_string(),
            max_messages: 1,
            ack_deadline: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            ssh: SshConfig {
                port: 22,
                timeout: Duration::from_secs(30),
                command_timeout: Duration::from_secs(6 * 60 * 60),
            },
            secrets: CredentialSecrets::default(),
            recipes: RecipeConfig::default(),
        }
    }

    #[test]
    fn test_worker_timeouts_are_validated() {
        assert!(worker_config().validate().is_ok());

        let mut cfg = worker_config();
        cfg.ssh.command_timeout = Duration::ZERO;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "SSH_COMMAND_TIMEOUT_SEC"
        ));

        let mut cfg = worker_config();
        cfg.recipes.stale_after = Duration::from_secs(60 * 60);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "REMOTE_STALE_AFTER_MIN"
        ));
    }

    #[test]
    fn test_task_queue_path() {
        assert_eq!(
            config().task_queue_path().parent(),
            "projects/proj/locations/europe-west1/queues/backup-scheduler"
        );
    }
}
