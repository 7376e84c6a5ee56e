//! Database specific steps of a backup run.
//!
//! A recipe turns a live database on the remote host into one compressed file
//! and knows how to remove whatever it created. Connecting, uploading and
//! bookkeeping are shared by all recipes in [`super::BackupWorker`].

use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::remote::{pipefail, shell_quote, RemoteShell};
use super::retry::{poll_until, RetryPolicy};
use crate::errors::WorkerError;
use crate::types::DatabaseKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipeConfig {
    /// Where per-run dumps and archives are written on the remote host
    pub remote_tmp_dir: String,
    /// Leftovers of earlier runs older than this are swept during cleanup.
    /// Must exceed the longest run so a concurrent run is never touched.
    pub stale_after: Duration,
    pub postgres_dump_command: String,
    pub mongodump_command: String,
    pub questdb_http_url: String,
    /// Shared directory QuestDB writes `BACKUP DATABASE` output to
    pub questdb_backup_dir: String,
    pub qdrant_http_url: String,
    /// Secret holding the Qdrant API key, if the instance requires one
    pub qdrant_api_key_secret: Option<String>,
    /// Candidate directories a finished snapshot may appear in
    pub qdrant_snapshot_dirs: Vec<String>,
    pub qdrant_poll: RetryPolicy,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            remote_tmp_dir: "/tmp".to_string(),
            stale_after: Duration::from_secs(24 * 60 * 60),
            postgres_dump_command: "sudo -u postgres pg_dumpall".to_string(),
            mongodump_command: "mongodump".to_string(),
            questdb_http_url: "http://localhost:9000".to_string(),
            questdb_backup_dir: "/var/lib/questdb/backup".to_string(),
            qdrant_http_url: "http://localhost:6333".to_string(),
            qdrant_api_key_secret: None,
            qdrant_snapshot_dirs: vec![
                "/qdrant/snapshots".to_string(),
                "/var/lib/qdrant/snapshots".to_string(),
            ],
            qdrant_poll: RetryPolicy::default(),
        }
    }
}

/// State of one backup run. Lives for the processing of a single message.
#[derive(Debug, Clone)]
pub struct RemoteBackupSession {
    pub database: DatabaseKind,
    pub address: String,
    /// Unique per run; namespaces every remote path the run creates.
    pub token: String,
    /// API key for the database's HTTP API, when one is configured.
    pub api_key: Option<String>,
    /// Remote paths created by this run, removed on cleanup.
    pub created_paths: Vec<String>,
    pub artifact_path: Option<String>,
    pub snapshot_name: Option<String>,
    pub size: Option<u64>,
}

impl RemoteBackupSession {
    pub fn new(database: DatabaseKind, address: &str, token: &str) -> Self {
        Self {
            database,
            address: address.to_string(),
            token: token.to_string(),
            api_key: None,
            created_paths: Vec::new(),
            artifact_path: None,
            snapshot_name: None,
            size: None,
        }
    }

    /// `{database}-backup-{token}`
    pub fn run_name(&self) -> String {
        format!("{}-backup-{}", self.database, self.token)
    }

    fn track(&mut self, path: &str) {
        if !self.created_paths.iter().any(|p| p == path) {
            self.created_paths.push(path.to_string());
        }
    }
}

/// The compressed file a recipe produced on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub path: String,
    /// Object name under the database's storage prefix
    pub file_name: String,
    pub metadata: HashMap<String, String>,
}

impl RemoteArtifact {
    fn new(path: String, file_name: String) -> Self {
        Self {
            path,
            file_name,
            metadata: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait BackupRecipe: Send + Sync {
    fn database(&self) -> DatabaseKind;

    /// Secret to read into [`RemoteBackupSession::api_key`] before the run.
    fn api_key_secret(&self) -> Option<&str> {
        None
    }

    /// Produces the compressed artifact. Must be safe to re-run after a
    /// failed attempt: every path it creates embeds the session token.
    async fn produce_artifact(
        &self,
        shell: &dyn RemoteShell,
        session: &mut RemoteBackupSession,
    ) -> Result<RemoteArtifact, WorkerError>;

    async fn cleanup_remote(
        &self,
        shell: &dyn RemoteShell,
        session: &RemoteBackupSession,
    ) -> Result<(), WorkerError> {
        remove_paths(shell, &session.created_paths).await
    }
}

pub fn recipe_for(database: DatabaseKind, config: &RecipeConfig) -> Box<dyn BackupRecipe> {
    match database {
        DatabaseKind::Postgres => Box::new(PostgresRecipe {
            tmp_dir: config.remote_tmp_dir.clone(),
            dump_command: config.postgres_dump_command.clone(),
        }),
        DatabaseKind::Mongodb => Box::new(MongoRecipe {
            tmp_dir: config.remote_tmp_dir.clone(),
            dump_command: config.mongodump_command.clone(),
        }),
        DatabaseKind::Questdb => Box::new(QuestDbRecipe {
            tmp_dir: config.remote_tmp_dir.clone(),
            http_url: config.questdb_http_url.clone(),
            backup_dir: config.questdb_backup_dir.clone(),
        }),
        DatabaseKind::Qdrantdb => Box::new(QdrantRecipe {
            tmp_dir: config.remote_tmp_dir.clone(),
            http_url: config.qdrant_http_url.clone(),
            api_key_secret: config.qdrant_api_key_secret.clone(),
            snapshot_dirs: config.qdrant_snapshot_dirs.clone(),
            poll: config.qdrant_poll.clone(),
        }),
    }
}

async fn run(shell: &dyn RemoteShell, command: &str) -> Result<String, WorkerError> {
    shell
        .run(command)
        .await
        .map_err(WorkerError::RemoteCommandError)
}

async fn remove_paths(shell: &dyn RemoteShell, paths: &[String]) -> Result<(), WorkerError> {
    if paths.is_empty() {
        return Ok(());
    }
    let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
    run(shell, &format!("rm -rf -- {}", quoted.join(" "))).await?;
    Ok(())
}

/// Removes `{database}-backup-*` entries in `dir` not modified for
/// `older_than`. Picks up what failed runs left behind.
pub async fn sweep_stale_runs(
    shell: &dyn RemoteShell,
    dir: &str,
    database: DatabaseKind,
    older_than: Duration,
) -> Result<(), WorkerError> {
    let minutes = (older_than.as_secs() / 60).max(1);
    run(
        shell,
        &format!(
            "find {} -mindepth 1 -maxdepth 1 -name {} -mmin +{} -exec rm -rf -- {{}} +",
            shell_quote(dir),
            shell_quote(&format!("{database}-backup-*")),
            minutes
        ),
    )
    .await?;
    Ok(())
}

fn remote_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn http_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// `pg_dumpall` piped straight into gzip; the dump is the artifact.
pub struct PostgresRecipe {
    tmp_dir: String,
    dump_command: String,
}

#[async_trait]
impl BackupRecipe for PostgresRecipe {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn produce_artifact(
        &self,
        shell: &dyn RemoteShell,
        session: &mut RemoteBackupSession,
    ) -> Result<RemoteArtifact, WorkerError> {
        let file_name = format!("{}.sql.gz", session.run_name());
        let path = remote_path(&self.tmp_dir, &file_name);
        session.track(&path);

        info!("[{}] dumping postgres to {}", session.token, path);
        let dump = format!("{} | gzip > {}", self.dump_command, shell_quote(&path));
        run(shell, &pipefail(&dump)).await?;

        Ok(RemoteArtifact::new(path, file_name))
    }
}

/// `mongodump` into a per-run directory, then tar+gzip of that directory.
pub struct MongoRecipe {
    tmp_dir: String,
    dump_command: String,
}

#[async_trait]
impl BackupRecipe for MongoRecipe {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Mongodb
    }

    async fn produce_artifact(
        &self,
        shell: &dyn RemoteShell,
        session: &mut RemoteBackupSession,
    ) -> Result<RemoteArtifact, WorkerError> {
        let run_name = session.run_name();
        let dump_dir = remote_path(&self.tmp_dir, &run_name);
        let file_name = format!("{run_name}.tar.gz");
        let archive = remote_path(&self.tmp_dir, &file_name);
        session.track(&dump_dir);

        info!("[{}] running mongodump into {}", session.token, dump_dir);
        run(
            shell,
            &format!("{} --out={}", self.dump_command, shell_quote(&dump_dir)),
        )
        .await?;

        session.track(&archive);
        run(
            shell,
            &format!(
                "tar -czf {} -C {} {}",
                shell_quote(&archive),
                shell_quote(&self.tmp_dir),
                shell_quote(&run_name)
            ),
        )
        .await?;

        // the archive is all we need; cleanup retries this if it fails
        if let Err(e) = remove_paths(shell, std::slice::from_ref(&dump_dir)).await {
            warn!("[{}] failed to remove dump directory {}: {}", session.token, dump_dir, e);
        }

        Ok(RemoteArtifact::new(archive, file_name))
    }
}

/// `BACKUP DATABASE` over the QuestDB HTTP API into its shared backup
/// directory, then tar+gzip of that directory.
pub struct QuestDbRecipe {
    tmp_dir: String,
    http_url: String,
    backup_dir: String,
}

#[async_trait]
impl BackupRecipe for QuestDbRecipe {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Questdb
    }

    async fn produce_artifact(
        &self,
        shell: &dyn RemoteShell,
        session: &mut RemoteBackupSession,
    ) -> Result<RemoteArtifact, WorkerError> {
        let file_name = format!("{}.tar.gz", session.run_name());
        let archive = remote_path(&self.tmp_dir, &file_name);

        // a failed earlier run may have left its backup behind
        let backup_dir = shell_quote(&self.backup_dir);
        run(shell, &format!("mkdir -p {backup_dir}")).await?;
        run(shell, &format!("find {backup_dir} -mindepth 1 -delete")).await?;

        info!("[{}] running questdb backup into {}", session.token, self.backup_dir);
        run(
            shell,
            &format!(
                "curl -fsS -G --data-urlencode {} {}",
                shell_quote("query=BACKUP DATABASE;"),
                shell_quote(&http_url(&self.http_url, "/exec"))
            ),
        )
        .await?;

        session.track(&archive);
        run(
            shell,
            &format!(
                "tar -czf {} -C {} .",
                shell_quote(&archive),
                shell_quote(&self.backup_dir)
            ),
        )
        .await?;

        Ok(RemoteArtifact::new(archive, file_name))
    }

    async fn cleanup_remote(
        &self,
        shell: &dyn RemoteShell,
        session: &RemoteBackupSession,
    ) -> Result<(), WorkerError> {
        remove_paths(shell, &session.created_paths).await?;
        // the backup directory is shared, so only its contents go
        run(
            shell,
            &format!("find {} -mindepth 1 -delete", shell_quote(&self.backup_dir)),
        )
        .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct SnapshotResponse {
    result: Option<SnapshotDescription>,
}

#[derive(Deserialize)]
struct SnapshotDescription {
    name: String,
}

/// Full storage snapshot through the Qdrant HTTP API. The snapshot file is
/// written asynchronously, so its appearance on disk is polled for.
pub struct QdrantRecipe {
    tmp_dir: String,
    http_url: String,
    api_key_secret: Option<String>,
    snapshot_dirs: Vec<String>,
    poll: RetryPolicy,
}

impl QdrantRecipe {
    fn curl(&self, session: &RemoteBackupSession, method: &str, path: &str) -> String {
        let mut command = format!("curl -fsS -X {method}");
        if let Some(key) = &session.api_key {
            command.push_str(" -H ");
            command.push_str(&shell_quote(&format!("api-key: {key}")));
        }
        command.push(' ');
        command.push_str(&shell_quote(&http_url(&self.http_url, path)));
        command
    }

    fn locate_command(&self, snapshot: &str) -> String {
        let dirs: Vec<String> = self.snapshot_dirs.iter().map(|d| shell_quote(d)).collect();
        format!(
            "for d in {}; do if [ -f \"$d/{}\" ]; then echo \"$d\"; break; fi; done",
            dirs.join(" "),
            snapshot
        )
    }
}

fn parse_snapshot_name(body: &str) -> Result<String, WorkerError> {
    let unexpected = || WorkerError::UnexpectedResponse(format!("qdrant snapshot api: {body}"));
    let response: SnapshotResponse = serde_json::from_str(body).map_err(|_| unexpected())?;
    let name = response.result.ok_or_else(unexpected)?.name;
    // the name is spliced into remote commands
    if name.is_empty()
        || name.starts_with('.')
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_.".contains(&b))
    {
        return Err(unexpected());
    }
    Ok(name)
}

#[async_trait]
impl BackupRecipe for QdrantRecipe {
    fn database(&self) -> DatabaseKind {
        DatabaseKind::Qdrantdb
    }

    fn api_key_secret(&self) -> Option<&str> {
        self.api_key_secret.as_deref()
    }

    async fn produce_artifact(
        &self,
        shell: &dyn RemoteShell,
        session: &mut RemoteBackupSession,
    ) -> Result<RemoteArtifact, WorkerError> {
        info!("[{}] creating qdrant snapshot", session.token);
        let body = run(shell, &self.curl(session, "POST", "/snapshots")).await?;
        let snapshot = parse_snapshot_name(&body)?;
        session.snapshot_name = Some(snapshot.clone());

        let locate = self.locate_command(&snapshot);
        let locate = locate.as_str();
        let located = poll_until(&format!("snapshot {snapshot}"), &self.poll, |_| async move {
            let output = shell
                .exec(locate)
                .await
                .map_err(WorkerError::RemoteCommandError)?;
            let dir = output.stdout.trim();
            Ok::<_, WorkerError>((output.success() && !dir.is_empty()).then(|| dir.to_string()))
        })
        .await?;
        let dir = located.map_err(|exhausted| WorkerError::SnapshotTimeoutError {
            snapshot: snapshot.clone(),
            attempts: exhausted.attempts,
        })?;
        info!("[{}] snapshot {} ready in {}", session.token, snapshot, dir);

        let mut entries = vec![snapshot.clone()];
        let checksum = format!("{snapshot}.checksum");
        let has_checksum = shell
            .exec(&format!("test -f {}", shell_quote(&remote_path(&dir, &checksum))))
            .await
            .map_err(WorkerError::RemoteCommandError)?
            .success();
        if has_checksum {
            entries.push(checksum);
        }

        let stem = snapshot.trim_end_matches(".snapshot");
        let file_name = format!("{}-{}.tar.gz", session.run_name(), stem);
        let archive = remote_path(&self.tmp_dir, &file_name);
        session.track(&archive);
        let entries: Vec<String> = entries.iter().map(|e| shell_quote(e)).collect();
        run(
            shell,
            &format!(
                "tar -czf {} -C {} {}",
                shell_quote(&archive),
                shell_quote(&dir),
                entries.join(" ")
            ),
        )
        .await?;

        let mut artifact = RemoteArtifact::new(archive, file_name);
        artifact
            .metadata
            .insert("snapshotName".to_string(), snapshot);
        Ok(artifact)
    }

    async fn cleanup_remote(
        &self,
        shell: &dyn RemoteShell,
        session: &RemoteBackupSession,
    ) -> Result<(), WorkerError> {
        let removed = remove_paths(shell, &session.created_paths).await;
        if let Some(snapshot) = &session.snapshot_name {
            let path = format!("/snapshots/{snapshot}");
            match run(shell, &self.curl(session, "DELETE", &path)).await {
                Ok(_) => info!("[{}] deleted qdrant snapshot {}", session.token, snapshot),
                Err(e) => warn!(
                    "[{}] failed to delete qdrant snapshot {}: {}",
                    session.token, snapshot, e
                ),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::remote::{RemoteConnector, RemoteCredentials};
    use crate::worker::simulated::SimulatedHost;
    use std::time::{Duration, Instant};

    fn credentials() -> RemoteCredentials {
        RemoteCredentials {
            host: "10.0.0.5".to_string(),
            username: "backup".to_string(),
            private_key: "key".to_string(),
        }
    }

    fn config() -> RecipeConfig {
        RecipeConfig {
            qdrant_poll: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
                multiplier: 2,
                max_delay: Duration::from_millis(5),
            },
            ..RecipeConfig::default()
        }
    }

    async fn produce_and_clean(
        host: &SimulatedHost,
        database: DatabaseKind,
    ) -> (RemoteArtifact, RemoteBackupSession) {
        let recipe = recipe_for(database, &config());
        assert_eq!(recipe.database(), database);
        let shell = host.connect(&credentials()).await.unwrap();
        let mut session = RemoteBackupSession::new(database, "10.0.0.5:22", "20240101T000000000Z-abcd1234");
        let artifact = recipe
            .produce_artifact(shell.as_ref(), &mut session)
            .await
            .unwrap();
        assert!(host.file(&artifact.path).is_some(), "artifact missing");
        recipe.cleanup_remote(shell.as_ref(), &session).await.unwrap();
        (artifact, session)
    }

    #[tokio::test]
    async fn test_postgres_dump_is_the_artifact() {
        let host = SimulatedHost::new("10.0.0.5:22");
        let (artifact, _) = produce_and_clean(&host, DatabaseKind::Postgres).await;
        assert_eq!(
            artifact.path,
            "/tmp/postgres-backup-20240101T000000000Z-abcd1234.sql.gz"
        );
        assert_eq!(
            artifact.file_name,
            "postgres-backup-20240101T000000000Z-abcd1234.sql.gz"
        );
        assert!(host.commands()[0].starts_with("bash -o pipefail -c"));
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn test_mongo_removes_dump_dir_after_archiving() {
        let host = SimulatedHost::new("10.0.0.5:22");
        let recipe = recipe_for(DatabaseKind::Mongodb, &config());
        let shell = host.connect(&credentials()).await.unwrap();
        let mut session = RemoteBackupSession::new(DatabaseKind::Mongodb, "10.0.0.5:22", "t1");
        let artifact = recipe
            .produce_artifact(shell.as_ref(), &mut session)
            .await
            .unwrap();
        assert_eq!(host.files(), vec![artifact.path.clone()]);
        assert_eq!(artifact.file_name, "mongodb-backup-t1.tar.gz");

        recipe.cleanup_remote(shell.as_ref(), &session).await.unwrap();
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn test_questdb_clears_shared_backup_dir() {
        let host = SimulatedHost::new("10.0.0.5:22");
        let (artifact, _) = produce_and_clean(&host, DatabaseKind::Questdb).await;
        assert_eq!(
            artifact.file_name,
            "questdb-backup-20240101T000000000Z-abcd1234.tar.gz"
        );
        assert!(host
            .commands()
            .iter()
            .any(|c| c.contains("BACKUP DATABASE")));
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn test_questdb_archive_excludes_earlier_backups() {
        let host = SimulatedHost::new("10.0.0.5:22")
            .with_questdb_backup_dir("/data/questdb/backup")
            .with_file("/data/questdb/backup/2023-12-31/db/_meta", "left by a failed run");
        let recipe = recipe_for(
            DatabaseKind::Questdb,
            &RecipeConfig {
                questdb_backup_dir: "/data/questdb/backup".to_string(),
                ..config()
            },
        );
        let shell = host.connect(&credentials()).await.unwrap();
        let mut session = RemoteBackupSession::new(DatabaseKind::Questdb, "10.0.0.5:22", "t5");
        let artifact = recipe
            .produce_artifact(shell.as_ref(), &mut session)
            .await
            .unwrap();

        let archived = String::from_utf8(host.file(&artifact.path).unwrap().to_vec()).unwrap();
        assert_eq!(archived, "/data/questdb/backup/2024-01-01/db/_meta\n");

        recipe.cleanup_remote(shell.as_ref(), &session).await.unwrap();
        assert!(host.files().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_only_touches_old_runs_of_its_own_kind() {
        let host = SimulatedHost::new("10.0.0.5:22")
            .with_file("/tmp/mongodb-backup-old/admin/system.version.bson", "bson")
            .with_file("/tmp/mongodb-backup-old.tar.gz", "archive")
            .with_file("/tmp/postgres-backup-old.sql.gz", "dump")
            .with_file("/tmp/unrelated.log", "log");
        host.advance_minutes(25 * 60);
        let host = host.with_file("/tmp/mongodb-backup-running.tar.gz", "in progress");
        let shell = host.connect(&credentials()).await.unwrap();

        sweep_stale_runs(
            shell.as_ref(),
            "/tmp",
            DatabaseKind::Mongodb,
            Duration::from_secs(24 * 60 * 60),
        )
        .await
        .unwrap();

        assert_eq!(
            host.files(),
            vec![
                "/tmp/mongodb-backup-running.tar.gz".to_string(),
                "/tmp/postgres-backup-old.sql.gz".to_string(),
                "/tmp/unrelated.log".to_string(),
            ]
        );
        assert!(host.commands()[0].contains("-mmin +1440"));
    }

    #[tokio::test]
    async fn test_qdrant_snapshot_located_in_second_dir() {
        let host = SimulatedHost::new("10.0.0.5:22")
            .with_snapshot_dir("/var/lib/qdrant/snapshots")
            .snapshot_ready_after(Some(2));
        let (artifact, session) = produce_and_clean(&host, DatabaseKind::Qdrantdb).await;
        let snapshot = session.snapshot_name.unwrap();
        assert_eq!(artifact.metadata.get("snapshotName"), Some(&snapshot));
        assert!(artifact.file_name.starts_with("qdrantdb-backup-"));
        assert!(artifact.file_name.ends_with("full-snapshot-2024-01-01-00-00-01.tar.gz"));
        // archive, snapshot file and checksum are all gone
        assert!(host.files().is_empty());
        assert!(host.commands().iter().any(|c| c.contains("-X DELETE")));
    }

    #[tokio::test]
    async fn test_qdrant_never_ready_times_out() {
        let host = SimulatedHost::new("10.0.0.5:22").snapshot_ready_after(None);
        let recipe = recipe_for(DatabaseKind::Qdrantdb, &config());
        let shell = host.connect(&credentials()).await.unwrap();
        let mut session = RemoteBackupSession::new(DatabaseKind::Qdrantdb, "10.0.0.5:22", "t2");

        let started = Instant::now();
        let err = recipe
            .produce_artifact(shell.as_ref(), &mut session)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            WorkerError::SnapshotTimeoutError { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other:?}"),
        }
        let polls = host
            .commands()
            .iter()
            .filter(|c| c.starts_with("for d in"))
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_qdrant_snapshot_delete_is_best_effort() {
        let host = SimulatedHost::new("10.0.0.5:22").fail_on("-X DELETE", 22, "boom");
        produce_and_clean(&host, DatabaseKind::Qdrantdb).await;
    }

    #[tokio::test]
    async fn test_qdrant_api_key_sent_as_header() {
        let host = SimulatedHost::new("10.0.0.5:22");
        let recipe = recipe_for(DatabaseKind::Qdrantdb, &config());
        let shell = host.connect(&credentials()).await.unwrap();
        let mut session = RemoteBackupSession::new(DatabaseKind::Qdrantdb, "10.0.0.5:22", "t3");
        session.api_key = Some("s3cret".to_string());
        recipe
            .produce_artifact(shell.as_ref(), &mut session)
            .await
            .unwrap();
        assert!(host.commands()[0].contains("'api-key: s3cret'"));
    }

    #[tokio::test]
    async fn test_failed_dump_is_remote_command_error() {
        let host = SimulatedHost::new("10.0.0.5:22").fail_on("pg_dumpall", 1, "role does not exist");
        let recipe = recipe_for(DatabaseKind::Postgres, &config());
        let shell = host.connect(&credentials()).await.unwrap();
        let mut session = RemoteBackupSession::new(DatabaseKind::Postgres, "10.0.0.5:22", "t4");
        let err = recipe
            .produce_artifact(shell.as_ref(), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::RemoteCommandError(_)));
        assert!(err.to_string().contains("role does not exist"));
    }

    #[test]
    fn test_snapshot_name_validation() {
        assert_eq!(
            parse_snapshot_name(r#"{"result":{"name":"full-snapshot-1.snapshot"},"status":"ok"}"#)
                .unwrap(),
            "full-snapshot-1.snapshot"
        );
        assert!(parse_snapshot_name(r#"{"result":null,"status":"accepted"}"#).is_err());
        assert!(parse_snapshot_name(r#"{"result":{"name":"x; rm -rf /"}}"#).is_err());
        assert!(parse_snapshot_name("not json").is_err());
    }
}
