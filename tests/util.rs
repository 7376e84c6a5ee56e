pub mod common {
    use actix_http::Request;
    use actix_service::Service;
    use actix_web::test;
    use actix_web::{dev::ServiceResponse, web, App, Error};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    use backup_orchestrator::adapters::memory::{
        FixedClock, MemoryBlobStore, MemoryQueue, MemoryScheduler, MemorySecretStore,
    };
    use backup_orchestrator::config::{CredentialSecrets, SshConfig, TopicConfig, WorkerConfig};
    use backup_orchestrator::errors::{make_json_config, make_query_config};
    use backup_orchestrator::orchestrator::BackupOrchestrator;
    use backup_orchestrator::routes::auth::ApiKey;
    use backup_orchestrator::types::{DatabaseKind, TaskQueuePath};
    use backup_orchestrator::worker::consumer::BackupConsumer;
    use backup_orchestrator::worker::recipes::RecipeConfig;
    use backup_orchestrator::worker::simulated::SimulatedHost;
    use backup_orchestrator::worker::BackupWorker;

    pub const API_KEY: &str = "test-api-key";

    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()
    }

    /// In-memory stand-ins for every external service, shared between the
    /// API under test and the workers.
    pub struct Fleet {
        pub clock: Arc<FixedClock>,
        pub queue: Arc<MemoryQueue>,
        pub scheduler: Arc<MemoryScheduler>,
        pub blobs: Arc<MemoryBlobStore>,
        pub topics: TopicConfig,
    }

    impl Fleet {
        pub fn new() -> Self {
            let clock = Arc::new(FixedClock::new(start()));
            Self {
                queue: Arc::new(MemoryQueue::new()),
                scheduler: Arc::new(MemoryScheduler::new(clock.clone())),
                blobs: Arc::new(MemoryBlobStore::new("backups", clock.clone())),
                topics: TopicConfig::default(),
                clock,
            }
        }

        /// A consumer for `database` reading the trigger topic directly,
        /// backed by `host`.
        pub fn consumer(&self, database: DatabaseKind, host: &SimulatedHost) -> BackupConsumer {
            let config = WorkerConfig {
                database,
                subscription: self.topics.topic(database).to_string(),
                max_messages: 4,
                ack_deadline: Duration::from_secs(60),
                poll_interval: Duration::from_millis(5),
                ssh: SshConfig {
                    port: 22,
                    timeout: Duration::from_secs(5),
                    command_timeout: Duration::from_secs(60),
                },
                secrets: CredentialSecrets::default(),
                recipes: RecipeConfig::default(),
            };
            let secrets = MemorySecretStore::new()
                .with_secret("backup-ssh-private-key", "key")
                .with_secret("backup-ssh-host", "10.0.0.5")
                .with_secret("backup-ssh-username", "backup");
            let worker = Arc::new(BackupWorker::new(
                &config,
                Arc::new(secrets),
                self.blobs.clone(),
                Arc::new(host.clone()),
                self.clock.clone(),
            ));
            BackupConsumer::new(&config, worker, self.queue.clone())
        }
    }

    #[cfg(test)]
    pub async fn get_test_app(
        fleet: &Fleet,
    ) -> impl Service<Request, Response = ServiceResponse, Error = Error> {
        let orchestrator = BackupOrchestrator::new(
            fleet.queue.clone(),
            fleet.scheduler.clone(),
            fleet.blobs.clone(),
            fleet.clock.clone(),
            fleet.topics.clone(),
            TaskQueuePath {
                project: "proj".to_string(),
                location: "europe-west1".to_string(),
                queue: "backup-scheduler".to_string(),
            },
        );

        test::init_service(
            App::new()
                .app_data(web::Data::new(orchestrator))
                .app_data(web::Data::new(ApiKey(API_KEY.to_string())))
                .app_data(make_json_config())
                .app_data(make_query_config())
                .configure(backup_orchestrator::server::webserver_routes),
        )
        .await
    }
}
