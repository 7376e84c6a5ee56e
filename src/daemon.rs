//! Backup worker: consumes triggers for one database kind and runs the
//! remote backups they ask for.

use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use backup_orchestrator::clock::SystemClock;
use backup_orchestrator::config::{GcpConfig, WorkerConfig};
use backup_orchestrator::gcp::auth::AccessTokens;
use backup_orchestrator::gcp::pubsub::PubSubClient;
use backup_orchestrator::gcp::secrets::SecretManagerStore;
use backup_orchestrator::gcp::storage::GcsBlobStore;
use backup_orchestrator::worker::consumer::BackupConsumer;
use backup_orchestrator::worker::ssh::SshConnector;
use backup_orchestrator::worker::BackupWorker;

struct ConsumerState {
    running: AtomicBool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let gcp = GcpConfig::from_env()?;
    let cfg = WorkerConfig::from_env()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let auth = Arc::new(AccessTokens::from_default_credentials().await?);
    let secrets = Arc::new(SecretManagerStore::new(
        http.clone(),
        gcp.secrets_endpoint.clone(),
        &gcp.project_id,
        auth.clone(),
    ));
    let subscriber = Arc::new(PubSubClient::new(
        http,
        gcp.pubsub_endpoint.clone(),
        &gcp.project_id,
        auth,
    ));
    let blobs = Arc::new(GcsBlobStore::new(&gcp.project_id, &gcp.backup_bucket).await?);
    let connector = Arc::new(
        SshConnector::new(cfg.ssh.port)
            .with_timeout(cfg.ssh.timeout)
            .with_command_timeout(cfg.ssh.command_timeout),
    );

    let worker = Arc::new(BackupWorker::new(
        &cfg,
        secrets,
        blobs,
        connector,
        Arc::new(SystemClock),
    ));
    let consumer = BackupConsumer::new(&cfg, worker, subscriber);

    let state = web::Data::new(ConsumerState {
        running: AtomicBool::new(true),
    });
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let consumer_state = state.clone();
    info!("Spawning {} backup consumer", cfg.database);
    let consumer_task = tokio::spawn(async move {
        consumer
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        consumer_state.running.store(false, Ordering::SeqCst);
    });

    let server_port = std::env::var("PORT")
        .unwrap_or_else(|_| String::from("8080"))
        .parse::<u16>()
        .unwrap_or(8080);
    info!(
        "Starting {} worker health server on http://0.0.0.0:{}",
        cfg.database, server_port
    );

    // returns once the server has handled SIGINT/SIGTERM
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(web::scope("/health").service(consumer_running))
    })
    .workers(1)
    .bind(("0.0.0.0", server_port))?
    .run()
    .await?;

    info!("Shutting down, waiting for the current batch to finish");
    let _ = stop_tx.send(());
    consumer_task.await?;
    Ok(())
}

#[get("/lively")]
async fn consumer_running(state: web::Data<ConsumerState>) -> impl Responder {
    if state.running.load(Ordering::SeqCst) {
        HttpResponse::Ok().json("ok")
    } else {
        HttpResponse::InternalServerError().body("The backup consumer is not running.")
    }
}
