use futures::future::join_all;
use futures::FutureExt;
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::BackupWorker;
use crate::adapters::{AdapterResult, QueueSubscriber, ReceivedMessage};
use crate::config::WorkerConfig;
use crate::errors::WorkerError;
use crate::types::BackupTriggerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    /// Hand the message back for redelivery
    Nack,
}

/// Pulls trigger messages for one worker and settles them.
///
/// Successful backups are acked, failed ones nacked so the queue's own
/// redelivery and dead-letter policy decides what happens next. Messages no
/// worker could ever process are acked and logged.
pub struct BackupConsumer {
    worker: Arc<BackupWorker>,
    subscriber: Arc<dyn QueueSubscriber>,
    subscription: String,
    max_messages: u32,
    ack_deadline: Duration,
    poll_interval: Duration,
}

impl BackupConsumer {
    pub fn new(
        config: &WorkerConfig,
        worker: Arc<BackupWorker>,
        subscriber: Arc<dyn QueueSubscriber>,
    ) -> Self {
        Self {
            worker,
            subscriber,
            subscription: config.subscription.clone(),
            max_messages: config.max_messages,
            ack_deadline: config.ack_deadline,
            poll_interval: config.poll_interval,
        }
    }

    /// Pulls one batch and processes it concurrently. Returns the batch size.
    pub async fn poll_once(&self) -> AdapterResult<usize> {
        let messages = self
            .subscriber
            .pull(&self.subscription, self.max_messages)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }
        info!("received {} message(s) on {}", messages.len(), self.subscription);

        let ack_ids: Vec<String> = messages.iter().map(|m| m.ack_id.clone()).collect();
        let lease = self.keep_leases(ack_ids);
        let dispositions = join_all(messages.iter().map(|m| self.process(m))).await;
        lease.abort();

        let (acks, nacks): (Vec<_>, Vec<_>) = messages
            .iter()
            .zip(dispositions)
            .partition(|(_, disposition)| *disposition == Disposition::Ack);
        let acks: Vec<String> = acks.into_iter().map(|(m, _)| m.ack_id.clone()).collect();
        let nacks: Vec<String> = nacks.into_iter().map(|(m, _)| m.ack_id.clone()).collect();
        if !acks.is_empty() {
            self.subscriber.ack(&self.subscription, &acks).await?;
        }
        if !nacks.is_empty() {
            self.subscriber.nack(&self.subscription, &nacks).await?;
        }
        Ok(messages.len())
    }

    /// Polls until `shutdown` resolves. A batch in progress always finishes
    /// before the loop exits.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(
            "{} worker consuming {}",
            self.worker.database(),
            self.subscription
        );
        loop {
            let handled = match self.poll_once().await {
                Ok(handled) => handled,
                Err(e) => {
                    error!("failed to pull from {}: {}", self.subscription, e);
                    0
                }
            };
            if handled > 0 {
                if (&mut shutdown).now_or_never().is_some() {
                    break;
                }
                continue;
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("{} worker stopped", self.worker.database());
    }

    async fn process(&self, message: &ReceivedMessage) -> Disposition {
        let trigger: BackupTriggerMessage = match serde_json::from_slice(&message.data) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(
                    "dropping malformed message {}: {}",
                    message.message_id, e
                );
                return Disposition::Ack;
            }
        };
        match self.worker.handle(&trigger).await {
            Ok(outcome) => {
                info!(
                    "message {}: backup stored at {} ({} bytes)",
                    message.message_id, outcome.storage_url, outcome.size
                );
                Disposition::Ack
            }
            Err(e @ WorkerError::WrongDatabase { .. }) => {
                error!("dropping message {}: {}", message.message_id, e);
                Disposition::Ack
            }
            Err(e) => {
                error!(
                    "message {} (attempt {}): backup failed: {}",
                    message.message_id,
                    message.delivery_attempt.unwrap_or(1),
                    e
                );
                Disposition::Nack
            }
        }
    }

    /// Keeps the batch leased while it is being processed.
    fn keep_leases(&self, ack_ids: Vec<String>) -> JoinHandle<()> {
        let subscriber = self.subscriber.clone();
        let subscription = self.subscription.clone();
        let seconds = self.ack_deadline.as_secs().min(u64::from(u32::MAX)) as u32;
        let every = self.ack_deadline / 2;
        tokio::spawn(async move {
            loop {
                if let Err(e) = subscriber
                    .extend_lease(&subscription, &ack_ids, seconds)
                    .await
                {
                    warn!("failed to extend lease on {}: {}", subscription, e);
                }
                tokio::time::sleep(every).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{FixedClock, MemoryBlobStore, MemoryQueue, MemorySecretStore};
    use crate::adapters::QueuePublisher;
    use crate::config::{CredentialSecrets, SshConfig};
    use crate::types::DatabaseKind;
    use crate::worker::recipes::RecipeConfig;
    use crate::worker::simulated::SimulatedHost;
    use chrono::{TimeZone, Utc};

    const SUBSCRIPTION: &str = "postgres-backup-worker";

    struct Harness {
        consumer: BackupConsumer,
        queue: Arc<MemoryQueue>,
        blobs: Arc<MemoryBlobStore>,
        host: SimulatedHost,
    }

    fn harness() -> Harness {
        let config = WorkerConfig {
            database: DatabaseKind::Postgres,
            subscription: SUBSCRIPTION.to_string(),
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
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap(),
        ));
        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new("backups", clock.clone()));
        let host = SimulatedHost::new("10.0.0.5:22");
        let secrets = MemorySecretStore::new()
            .with_secret("backup-ssh-private-key", "key")
            .with_secret("backup-ssh-host", "10.0.0.5")
            .with_secret("backup-ssh-username", "backup");
        let worker = Arc::new(BackupWorker::new(
            &config,
            Arc::new(secrets),
            blobs.clone(),
            Arc::new(host.clone()),
            clock,
        ));
        Harness {
            consumer: BackupConsumer::new(&config, worker, queue.clone()),
            queue,
            blobs,
            host,
        }
    }

    fn trigger(database: DatabaseKind) -> BackupTriggerMessage {
        BackupTriggerMessage::manual(database, Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_successful_backups_are_acked() {
        let h = harness();
        h.queue.publish(SUBSCRIPTION, &trigger(DatabaseKind::Postgres)).await.unwrap();
        h.queue.publish(SUBSCRIPTION, &trigger(DatabaseKind::Postgres)).await.unwrap();

        assert_eq!(h.consumer.poll_once().await.unwrap(), 2);
        assert_eq!(h.blobs.object_count(), 2);
        assert_eq!(h.queue.pending(SUBSCRIPTION), 0);
        assert_eq!(h.queue.in_flight(), 0);
        assert_eq!(h.consumer.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_backup_is_nacked_for_redelivery() {
        let h = harness();
        h.host.refuse_connections(true);
        h.queue.publish(SUBSCRIPTION, &trigger(DatabaseKind::Postgres)).await.unwrap();

        assert_eq!(h.consumer.poll_once().await.unwrap(), 1);
        assert_eq!(h.queue.pending(SUBSCRIPTION), 1);

        h.host.refuse_connections(false);
        assert_eq!(h.consumer.poll_once().await.unwrap(), 1);
        assert_eq!(h.queue.pending(SUBSCRIPTION), 0);
        assert_eq!(h.blobs.object_count(), 1);
    }

    #[tokio::test]
    async fn test_unprocessable_messages_are_dropped() {
        let h = harness();
        h.queue.push_raw(SUBSCRIPTION, b"{not json");
        h.queue.publish(SUBSCRIPTION, &trigger(DatabaseKind::Questdb)).await.unwrap();

        assert_eq!(h.consumer.poll_once().await.unwrap(), 2);
        assert_eq!(h.queue.pending(SUBSCRIPTION), 0);
        assert_eq!(h.queue.in_flight(), 0);
        assert_eq!(h.blobs.object_count(), 0);
        assert_eq!(h.host.connections(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        h.queue.publish(SUBSCRIPTION, &trigger(DatabaseKind::Postgres)).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let blobs = h.blobs.clone();
        let stopper = tokio::spawn(async move {
            while blobs.object_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = tx.send(());
        });
        tokio::time::timeout(
            Duration::from_secs(5),
            h.consumer.run(async {
                let _ = rx.await;
            }),
        )
        .await
        .unwrap();
        stopper.await.unwrap();
        assert_eq!(h.blobs.object_count(), 1);
    }
}
