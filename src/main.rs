use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use log::info;
use std::sync::Arc;
use std::time::Duration;

use backup_orchestrator::clock::SystemClock;
use backup_orchestrator::config::Config;
use backup_orchestrator::errors::{make_json_config, make_query_config};
use backup_orchestrator::gcp::auth::AccessTokens;
use backup_orchestrator::gcp::pubsub::PubSubClient;
use backup_orchestrator::gcp::storage::GcsBlobStore;
use backup_orchestrator::gcp::tasks::CloudTasksScheduler;
use backup_orchestrator::orchestrator::BackupOrchestrator;
use backup_orchestrator::routes::auth::ApiKey;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cfg = Config::from_env()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let auth = Arc::new(AccessTokens::from_default_credentials().await?);
    let pubsub = Arc::new(PubSubClient::new(
        http.clone(),
        cfg.gcp.pubsub_endpoint.clone(),
        &cfg.gcp.project_id,
        auth.clone(),
    ));
    let scheduler = Arc::new(CloudTasksScheduler::new(
        http,
        cfg.gcp.tasks_endpoint.clone(),
        cfg.task_queue_path(),
        &cfg.tasks_service_account,
        pubsub.clone(),
        auth,
    ));
    let blobs = Arc::new(GcsBlobStore::new(&cfg.gcp.project_id, &cfg.gcp.backup_bucket).await?);

    let orchestrator = web::Data::new(BackupOrchestrator::new(
        pubsub,
        scheduler,
        blobs,
        Arc::new(SystemClock),
        cfg.topics.clone(),
        cfg.task_queue_path(),
    ));
    let api_key = web::Data::new(ApiKey(cfg.api_key.clone()));

    info!(
        "Starting backup API on http://0.0.0.0:{} (bucket {}, queue {})",
        cfg.server_port,
        cfg.gcp.backup_bucket,
        cfg.task_queue_path().parent()
    );
    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(orchestrator.clone())
            .app_data(api_key.clone())
            .app_data(make_json_config())
            .app_data(make_query_config())
            .configure(backup_orchestrator::server::webserver_routes)
    })
    .workers(cfg.server_workers as usize)
    .keep_alive(Duration::from_secs(75))
    .bind(("0.0.0.0", cfg.server_port))?
    .run()
    .await?;

    Ok(())
}
