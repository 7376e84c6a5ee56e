//! Remote backup execution.
//!
//! One [`BackupWorker`] serves one database kind. For every trigger message it
//! reads the host credentials, runs the kind's [`recipes::BackupRecipe`] over
//! ssh, streams the artifact into the blob store and then removes the remote
//! files the run created. Each phase opens its own session so a failing phase
//! never keeps another one open.

pub mod consumer;
pub mod recipes;
pub mod remote;
pub mod retry;
#[cfg(any(test, feature = "testing"))]
pub mod simulated;
pub mod ssh;

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::adapters::{BlobStore, SecretStore};
use crate::clock::Clock;
use crate::config::{CredentialSecrets, WorkerConfig};
use crate::errors::WorkerError;
use crate::types::{BackupTriggerMessage, DatabaseKind};
use recipes::{recipe_for, sweep_stale_runs, BackupRecipe, RemoteBackupSession};
use remote::{RemoteConnector, RemoteCredentials, RemoteShell};

pub const ARTIFACT_CONTENT_TYPE: &str = "application/gzip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Cleaned,
    /// Cleanup failed after a successful upload; the backup still counts.
    Warning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub storage_path: String,
    pub storage_url: String,
    pub size: u64,
    pub cleanup: CleanupOutcome,
}

pub struct BackupWorker {
    database: DatabaseKind,
    recipe: Box<dyn BackupRecipe>,
    remote_tmp_dir: String,
    stale_after: Duration,
    credential_secrets: CredentialSecrets,
    secrets: Arc<dyn SecretStore>,
    blobs: Arc<dyn BlobStore>,
    connector: Arc<dyn RemoteConnector>,
    clock: Arc<dyn Clock>,
}

/// Per-run token: creation time plus a random suffix, unique across
/// concurrent and redelivered runs.
pub fn run_token(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

impl BackupWorker {
    pub fn new(
        config: &WorkerConfig,
        secrets: Arc<dyn SecretStore>,
        blobs: Arc<dyn BlobStore>,
        connector: Arc<dyn RemoteConnector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            database: config.database,
            recipe: recipe_for(config.database, &config.recipes),
            remote_tmp_dir: config.recipes.remote_tmp_dir.clone(),
            stale_after: config.recipes.stale_after,
            credential_secrets: config.secrets.clone(),
            secrets,
            blobs,
            connector,
            clock,
        }
    }

    pub fn database(&self) -> DatabaseKind {
        self.database
    }

    /// Runs one backup end to end and returns where the artifact was stored.
    ///
    /// Errors before the upload completed are fatal and leave the remote
    /// files in place; the run is retried through queue redelivery and the
    /// leftovers are swept by a later cleanup once they are older than
    /// `stale_after`. Cleanup failures after the upload only produce
    /// [`CleanupOutcome::Warning`].
    pub async fn handle(&self, message: &BackupTriggerMessage) -> Result<BackupOutcome, WorkerError> {
        if message.database != self.database {
            return Err(WorkerError::WrongDatabase {
                expected: self.database,
                received: message.database,
            });
        }
        let started = self.clock.now();
        let token = run_token(started);
        info!(
            "[{}] starting {} backup, triggered by {}",
            token, self.database, message.triggered_by
        );

        let credentials = self.credentials().await?;
        let mut session = RemoteBackupSession::new(self.database, &credentials.host, &token);
        if let Some(secret) = self.recipe.api_key_secret() {
            let key = self
                .secrets
                .secret(secret)
                .await
                .map_err(WorkerError::CredentialError)?;
            session.api_key = Some(key.trim().to_string());
        }

        let artifact = {
            let shell = self.connect(&credentials).await?;
            session.address = shell.address().to_string();
            self.recipe
                .produce_artifact(shell.as_ref(), &mut session)
                .await?
        };
        session.artifact_path = Some(artifact.path.clone());
        info!("[{}] artifact ready at {}", token, artifact.path);

        let key = format!("{}{}", self.database.storage_prefix(), artifact.file_name);
        let mut metadata: HashMap<String, String> = artifact.metadata.clone();
        metadata.insert("database".to_string(), self.database.to_string());
        metadata.insert("source".to_string(), session.address.clone());
        metadata.insert("timestamp".to_string(), started.to_rfc3339());
        metadata.insert("triggeredBy".to_string(), message.triggered_by.to_string());
        metadata.insert("runToken".to_string(), token.clone());
        if let Some(scheduled_for) = message.scheduled_for {
            metadata.insert("scheduledFor".to_string(), scheduled_for.to_rfc3339());
        }

        let object = {
            let shell = self.connect(&credentials).await?;
            let file = shell
                .download(&artifact.path)
                .await
                .map_err(WorkerError::RemoteCommandError)?;
            session.size = Some(file.size);
            self.blobs
                .upload(
                    &key,
                    ARTIFACT_CONTENT_TYPE,
                    Some(file.size),
                    metadata,
                    file.data,
                )
                .await
                .map_err(|error| WorkerError::UploadError {
                    key: key.clone(),
                    error,
                })?
        };
        info!("[{}] uploaded {} ({} bytes)", token, object.name, object.size);

        let cleanup = match self.cleanup(&credentials, &session).await {
            Ok(()) => {
                info!("[{}] remote cleanup finished", token);
                CleanupOutcome::Cleaned
            }
            Err(e) => {
                warn!("[{}] remote cleanup failed: {}", token, e);
                CleanupOutcome::Warning(e.to_string())
            }
        };

        Ok(BackupOutcome {
            storage_url: self.blobs.storage_url(&object.name),
            storage_path: object.name,
            size: object.size,
            cleanup,
        })
    }

    async fn credentials(&self) -> Result<RemoteCredentials, WorkerError> {
        let names = &self.credential_secrets;
        let (private_key, host, username) = futures::try_join!(
            self.secrets.secret(&names.private_key),
            self.secrets.secret(&names.host),
            self.secrets.secret(&names.username),
        )
        .map_err(WorkerError::CredentialError)?;
        Ok(RemoteCredentials {
            host: host.trim().to_string(),
            username: username.trim().to_string(),
            private_key,
        })
    }

    async fn connect(
        &self,
        credentials: &RemoteCredentials,
    ) -> Result<Box<dyn RemoteShell>, WorkerError> {
        self.connector
            .connect(credentials)
            .await
            .map_err(WorkerError::ConnectionError)
    }

    async fn cleanup(
        &self,
        credentials: &RemoteCredentials,
        session: &RemoteBackupSession,
    ) -> Result<(), WorkerError> {
        let shell = self.connect(credentials).await?;
        let own = self.recipe.cleanup_remote(shell.as_ref(), session).await;
        let stale = sweep_stale_runs(
            shell.as_ref(),
            &self.remote_tmp_dir,
            self.database,
            self.stale_after,
        )
        .await;
        if let Err(e) = &stale {
            warn!("[{}] sweeping stale runs failed: {}", session.token, e);
        }
        own.and(stale)
    }
}
