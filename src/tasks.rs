//! Task queue and scheduler (spec §4.6).
//!
//! The source system runs these as Celery tasks on named queues with a broker doing the
//! fan-out across worker processes. `Manager` already does its own in-process fan-out (see
//! its module doc), so this module's job is narrower: wrap each named task as a [`Job`],
//! route it to a queue, and give two ways to actually run one — immediately in this process
//! via [`InProcessTaskQueue`], or published to an AMQP broker via [`AmqpTaskQueue`] for a
//! real multi-worker deployment. [`Scheduler`] is the periodic entry point that keeps
//! enqueuing [`Job::SynchronizeAccount`] for every authorized account.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{hub_for_account, CredentialStore};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Settings;
use crate::connector::{Connector, HistoryEvent};
use crate::error::{Result, SyncError};
use crate::manager::Manager;
use crate::outbox_builder::OutboxBuilder;
use crate::rate_limiter::QuotaRateLimiterRegistry;
use crate::store::Repository;

pub const QUEUE_SCHEDULER: &str = "scheduler";
pub const QUEUE_SYNC_ACCOUNT: &str = "sync_account";
pub const QUEUE_SYNC_MESSAGE: &str = "sync_message";
pub const QUEUE_FIRST_SYNC_MESSAGES: &str = "first_sync_messages";
pub const QUEUE_HISTORY: &str = "history";
pub const QUEUE_EDIT_LABELS: &str = "edit_labels";
pub const QUEUE_TRASH_MESSAGE: &str = "trash_message";
pub const QUEUE_DELETE_MESSAGE: &str = "delete_message";
pub const QUEUE_SEND_MESSAGE: &str = "send_message";

/// A unit of work dispatchable through a [`TaskQueue`]. Mirrors the source's Celery task
/// signatures one-for-one (spec §4.6's table); each variant is idempotent the same way its
/// source counterpart is, since a broker may redeliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    SynchronizeAccount { account_id: Uuid },
    SyncAllMessagesForAccount { account_id: Uuid },
    SyncLabelsForAllMessages { account_id: Uuid },
    SyncMessage { account_id: Uuid, remote_id: String, first_sync: bool },
    SyncHistoryItem { account_id: Uuid, event: HistoryEvent },
    FinishSyncAllMessages { account_id: Uuid },
    ToggleReadEmailMessage { account_id: Uuid, message_id: String, read: bool },
    ArchiveEmailMessage { account_id: Uuid, message_id: String },
    TrashEmailMessage { account_id: Uuid, message_id: String },
    DeleteEmailMessage { account_id: Uuid, message_id: String },
    SendMessage { account_id: Uuid, outbox_id: Uuid },
}

impl Job {
    /// The named queue this job is routed to (spec §4.6's queue column).
    pub fn queue(&self) -> &'static str {
        match self {
            Job::SynchronizeAccount { .. } => QUEUE_SYNC_ACCOUNT,
            Job::SyncAllMessagesForAccount { .. } => QUEUE_FIRST_SYNC_MESSAGES,
            Job::SyncLabelsForAllMessages { .. } => QUEUE_FIRST_SYNC_MESSAGES,
            Job::SyncMessage { first_sync: true, .. } => QUEUE_FIRST_SYNC_MESSAGES,
            Job::SyncMessage { first_sync: false, .. } => QUEUE_SYNC_MESSAGE,
            Job::SyncHistoryItem { .. } => QUEUE_HISTORY,
            Job::FinishSyncAllMessages { .. } => QUEUE_FIRST_SYNC_MESSAGES,
            Job::ToggleReadEmailMessage { .. } => QUEUE_EDIT_LABELS,
            Job::ArchiveEmailMessage { .. } => QUEUE_EDIT_LABELS,
            Job::TrashEmailMessage { .. } => QUEUE_TRASH_MESSAGE,
            Job::DeleteEmailMessage { .. } => QUEUE_DELETE_MESSAGE,
            Job::SendMessage { .. } => QUEUE_SEND_MESSAGE,
        }
    }
}

/// Where a [`Job`] goes once built. The in-process implementation runs it inline; the AMQP
/// implementation hands it to a broker for a worker elsewhere to pick up.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;
}

/// Builds a [`Manager`] for a given account on demand, assembling the hub, per-account
/// quota limiter, per-account circuit breaker, and connector the way `main.rs` would for a
/// one-shot CLI invocation, but callable once per job instead of once per process.
#[async_trait]
pub trait ManagerFactory: Send + Sync {
    async fn build_manager(&self, account_id: Uuid) -> Result<Manager>;
}

pub struct GmailManagerFactory {
    settings: Settings,
    repository: Arc<dyn Repository>,
    storage: Arc<dyn crate::store::Storage>,
    credentials: Arc<dyn CredentialStore>,
    quota: QuotaRateLimiterRegistry,
    circuit_breakers: CircuitBreakerRegistry,
}

impl GmailManagerFactory {
    pub fn new(
        settings: Settings,
        repository: Arc<dyn Repository>,
        storage: Arc<dyn crate::store::Storage>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let quota = QuotaRateLimiterRegistry::new(settings.quota.clone());
        let circuit_breakers = CircuitBreakerRegistry::new(settings.circuit_breaker.clone());
        Self {
            settings,
            repository,
            storage,
            credentials,
            quota,
            circuit_breakers,
        }
    }
}

#[async_trait]
impl ManagerFactory for GmailManagerFactory {
    async fn build_manager(&self, account_id: Uuid) -> Result<Manager> {
        let hub = hub_for_account(
            self.credentials.as_ref(),
            &self.settings.oauth.client_id,
            &self.settings.oauth.client_secret,
            account_id,
        )
        .await?;

        let quota = self.quota.for_account(account_id).await;
        let circuit_breaker = self.circuit_breakers.for_account(account_id).await;
        let connector = Connector::new(hub, quota, circuit_breaker, self.settings.sync.gmail_chunk_size);

        Ok(Manager::new(
            account_id,
            self.repository.clone(),
            self.storage.clone(),
            connector,
            self.settings.sync.unread_label.clone(),
            self.settings.storage.email_attachment_upload_to.clone(),
            self.settings.sync.kv_store_url.clone(),
            self.settings.sync.sync_lock_lifetime_secs,
        ))
    }
}

/// Runs a [`Job`] to completion against a freshly built [`Manager`]. Holds no queue
/// reference itself — [`Scheduler`] supplies the queue explicitly when it needs to enqueue
/// further work, avoiding a reference cycle between the runner and the queue that runs it.
pub struct TaskRunner {
    manager_factory: Arc<dyn ManagerFactory>,
    repository: Arc<dyn Repository>,
    outbox_builder: Arc<OutboxBuilder>,
}

impl TaskRunner {
    pub fn new(
        manager_factory: Arc<dyn ManagerFactory>,
        repository: Arc<dyn Repository>,
        outbox_builder: Arc<OutboxBuilder>,
    ) -> Self {
        Self {
            manager_factory,
            repository,
            outbox_builder,
        }
    }

    pub async fn run_job(&self, job: Job) -> Result<()> {
        match job {
            Job::SynchronizeAccount { account_id } => {
                let mut manager = self.manager_factory.build_manager(account_id).await?;
                manager.synchronize().await
            }
            Job::SyncAllMessagesForAccount { account_id } => {
                // Manager::synchronize already dispatches to the bootstrap path when the
                // account has no complete download; there is no separate entry point for
                // re-running just the message fan-out outside that dispatch.
                let mut manager = self.manager_factory.build_manager(account_id).await?;
                manager.synchronize().await
            }
            Job::SyncLabelsForAllMessages { account_id } => {
                let mut manager = self.manager_factory.build_manager(account_id).await?;
                manager.resync_all_labels().await
            }
            Job::SyncMessage { account_id, remote_id, .. } => {
                let mut manager = self.manager_factory.build_manager(account_id).await?;
                manager.sync_message(&remote_id).await
            }
            Job::SyncHistoryItem { account_id, event } => {
                let manager = self.manager_factory.build_manager(account_id).await?;
                manager.sync_history_item(event).await
            }
            Job::FinishSyncAllMessages { account_id } => {
                // The callback Manager::sync_all_messages already runs inline once its loop
                // completes (marking complete_download and releasing the lock); this variant
                // exists for the broker-routed deployment where a worker elsewhere needs an
                // explicit signal that the fan-out finished. In-process it is a no-op.
                let _ = account_id;
                Ok(())
            }
            Job::ToggleReadEmailMessage { account_id, message_id, read } => {
                let manager = self.manager_factory.build_manager(account_id).await?;
                manager.toggle_read_email_message(&message_id, read).await
            }
            Job::ArchiveEmailMessage { account_id, message_id } => {
                let manager = self.manager_factory.build_manager(account_id).await?;
                manager.archive_email_message(&message_id).await
            }
            Job::TrashEmailMessage { account_id, message_id } => {
                let manager = self.manager_factory.build_manager(account_id).await?;
                manager.trash_email_message(&message_id).await
            }
            Job::DeleteEmailMessage { account_id, message_id } => {
                let manager = self.manager_factory.build_manager(account_id).await?;
                manager.delete_email_message(&message_id).await
            }
            Job::SendMessage { account_id, outbox_id } => {
                let outbox = self
                    .repository
                    .get_outbox_message(outbox_id)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("outbox message {outbox_id}")))?;
                let rfc822 = self.outbox_builder.build(&outbox).await?;
                let mut manager = self.manager_factory.build_manager(account_id).await?;
                manager.send_email_message(&rfc822, outbox.original_message_id).await?;
                self.repository.delete_outbox_message(outbox.id).await
            }
        }
    }

    /// The scheduler's periodic tick (spec §4.6: "every 20s"): enqueue one
    /// `SynchronizeAccount` job per authorized, non-deleted account.
    pub async fn run_scheduler_tick(&self, queue: &dyn TaskQueue) -> Result<()> {
        let accounts = self.repository.list_authorized_accounts().await?;
        for account in accounts {
            queue.enqueue(Job::SynchronizeAccount { account_id: account.id }).await?;
        }
        Ok(())
    }
}

/// Runs every job immediately in this process. The default for a single-process deployment
/// and for tests — no broker round-trip, no retry semantics beyond what `Manager`/`Connector`
/// already do internally.
pub struct InProcessTaskQueue {
    runner: Arc<TaskRunner>,
}

impl InProcessTaskQueue {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskQueue for InProcessTaskQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.runner.run_job(job).await
    }
}

/// Publishes jobs to an AMQP-compatible broker (spec §6), one queue per [`Job::queue`], for
/// a real multi-worker deployment. [`AmqpWorker`] is the consuming half.
pub struct AmqpTaskQueue {
    pool: deadpool_lapin::Pool,
}

impl AmqpTaskQueue {
    pub async fn connect(amqp_url: &str) -> Result<Self> {
        let manager = deadpool_lapin::Manager::new(amqp_url.to_string(), lapin::ConnectionProperties::default());
        let pool = deadpool_lapin::Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| SyncError::QueueError(format!("failed to build AMQP pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn channel(&self) -> Result<lapin::Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::QueueError(format!("failed to get AMQP connection: {e}")))?;
        conn.create_channel()
            .await
            .map_err(|e| SyncError::QueueError(format!("failed to open AMQP channel: {e}")))
    }
}

#[async_trait]
impl TaskQueue for AmqpTaskQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let queue_name = job.queue();
        let channel = self.channel().await?;
        channel
            .queue_declare(
                queue_name,
                lapin::options::QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| SyncError::QueueError(format!("queue_declare failed: {e}")))?;

        let payload = serde_json::to_vec(&job)?;
        channel
            .basic_publish(
                "",
                queue_name,
                lapin::options::BasicPublishOptions::default(),
                &payload,
                lapin::BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| SyncError::QueueError(format!("basic_publish failed: {e}")))?
            .await
            .map_err(|e| SyncError::QueueError(format!("publisher confirm failed: {e}")))?;

        Ok(())
    }
}

/// Consumes jobs off an AMQP queue and runs them through a [`TaskRunner`]. Pairs with
/// [`AmqpTaskQueue`] for the multi-worker deployment; the in-process deployment has no
/// equivalent since [`InProcessTaskQueue`] already runs jobs where they're enqueued.
pub struct AmqpWorker {
    runner: Arc<TaskRunner>,
}

impl AmqpWorker {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner }
    }

    /// Drain `queue_name` until the channel closes, running each delivered job and acking
    /// only after it completes successfully. Per spec §4.6, a failed task is left unacked so
    /// the broker redelivers it after the default retry delay.
    pub async fn run(&self, channel: &lapin::Channel, queue_name: &str) -> Result<()> {
        use futures::StreamExt;

        channel
            .queue_declare(
                queue_name,
                lapin::options::QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| SyncError::QueueError(format!("queue_declare failed: {e}")))?;

        let mut consumer = channel
            .basic_consume(
                queue_name,
                "gmail-sync-worker",
                lapin::options::BasicConsumeOptions::default(),
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| SyncError::QueueError(format!("basic_consume failed: {e}")))?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| SyncError::QueueError(format!("delivery error: {e}")))?;
            let job: Job = serde_json::from_slice(&delivery.data)?;

            match self.runner.run_job(job.clone()).await {
                Ok(()) => {
                    delivery
                        .ack(lapin::options::BasicAckOptions::default())
                        .await
                        .map_err(|e| SyncError::QueueError(format!("ack failed: {e}")))?;
                }
                Err(err) => {
                    tracing::warn!(queue = queue_name, error = %err, ?job, "task failed, leaving unacked for redelivery");
                    delivery
                        .nack(lapin::options::BasicNackOptions {
                            requeue: err.is_transient(),
                            ..Default::default()
                        })
                        .await
                        .map_err(|e| SyncError::QueueError(format!("nack failed: {e}")))?;
                }
            }
        }

        Ok(())
    }
}

/// Periodic driver for the scheduler task (spec §4.6: every `scheduler_interval_secs`,
/// default 20). Wraps `tokio-cron-scheduler` the way a long-running worker process would,
/// firing a cron job that calls [`TaskRunner::run_scheduler_tick`].
pub struct Scheduler {
    inner: tokio_cron_scheduler::JobScheduler,
}

impl Scheduler {
    pub async fn start(runner: Arc<TaskRunner>, queue: Arc<dyn TaskQueue>, interval_secs: u64) -> Result<Self> {
        let inner = tokio_cron_scheduler::JobScheduler::new()
            .await
            .map_err(|e| SyncError::QueueError(format!("failed to build scheduler: {e}")))?;

        let schedule = format!("1/{interval_secs} * * * * *");
        let job = tokio_cron_scheduler::Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            let queue = queue.clone();
            Box::pin(async move {
                if let Err(err) = runner.run_scheduler_tick(queue.as_ref()).await {
                    tracing::error!(error = %err, "scheduler tick failed");
                }
            })
        })
        .map_err(|e| SyncError::QueueError(format!("failed to build cron job: {e}")))?;

        inner
            .add(job)
            .await
            .map_err(|e| SyncError::QueueError(format!("failed to register cron job: {e}")))?;
        inner
            .start()
            .await
            .map_err(|e| SyncError::QueueError(format!("failed to start scheduler: {e}")))?;

        Ok(Self { inner })
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| SyncError::QueueError(format!("failed to shut down scheduler: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_routing_matches_spec_table() {
        let account_id = Uuid::new_v4();
        assert_eq!(Job::SynchronizeAccount { account_id }.queue(), QUEUE_SYNC_ACCOUNT);
        assert_eq!(
            Job::SyncMessage { account_id, remote_id: "m1".into(), first_sync: true }.queue(),
            QUEUE_FIRST_SYNC_MESSAGES
        );
        assert_eq!(
            Job::SyncMessage { account_id, remote_id: "m1".into(), first_sync: false }.queue(),
            QUEUE_SYNC_MESSAGE
        );
        assert_eq!(
            Job::SyncHistoryItem { account_id, event: HistoryEvent::MessageDeleted { message_id: "m1".into() } }
                .queue(),
            QUEUE_HISTORY
        );
        assert_eq!(
            Job::TrashEmailMessage { account_id, message_id: "m1".into() }.queue(),
            QUEUE_TRASH_MESSAGE
        );
        assert_eq!(
            Job::SendMessage { account_id, outbox_id: Uuid::new_v4() }.queue(),
            QUEUE_SEND_MESSAGE
        );
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::ToggleReadEmailMessage {
            account_id: Uuid::new_v4(),
            message_id: "msg-1".to_string(),
            read: true,
        };
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.queue(), QUEUE_EDIT_LABELS);
    }

    struct StubQueue {
        enqueued: tokio::sync::Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl TaskQueue for StubQueue {
        async fn enqueue(&self, job: Job) -> Result<()> {
            self.enqueued.lock().await.push(job);
            Ok(())
        }
    }

    struct StubManagerFactory;

    #[async_trait]
    impl ManagerFactory for StubManagerFactory {
        async fn build_manager(&self, _account_id: Uuid) -> Result<Manager> {
            Err(SyncError::Unknown("stub factory never builds a real manager".to_string()))
        }
    }

    #[tokio::test]
    async fn scheduler_tick_enqueues_one_job_per_authorized_account() {
        use crate::models::Account;
        use crate::store::{InMemoryRepository, InMemoryStorage};

        let repository = InMemoryRepository::shared();
        let mut authorized = Account::new("a@example.com", Uuid::new_v4());
        authorized.is_authorized = true;
        repository.save_account(authorized.clone()).await.unwrap();

        let mut unauthorized = Account::new("b@example.com", Uuid::new_v4());
        unauthorized.is_authorized = false;
        repository.save_account(unauthorized).await.unwrap();

        let mut deleted = Account::new("c@example.com", Uuid::new_v4());
        deleted.is_authorized = true;
        deleted.deleted = true;
        repository.save_account(deleted).await.unwrap();

        let outbox_builder = Arc::new(OutboxBuilder::new(repository.clone(), InMemoryStorage::shared()));
        let runner = Arc::new(TaskRunner::new(Arc::new(StubManagerFactory), repository.clone(), outbox_builder));
        let queue = StubQueue { enqueued: tokio::sync::Mutex::new(Vec::new()) };

        runner.run_scheduler_tick(&queue).await.unwrap();

        let jobs = queue.enqueued.lock().await;
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0], Job::SynchronizeAccount { account_id } if account_id == authorized.id));
    }

    #[tokio::test]
    async fn send_message_job_errors_when_outbox_missing() {
        use crate::store::{InMemoryRepository, InMemoryStorage};

        let repository = InMemoryRepository::shared();
        let outbox_builder = Arc::new(OutboxBuilder::new(repository.clone(), InMemoryStorage::shared()));
        let runner = TaskRunner::new(Arc::new(StubManagerFactory), repository, outbox_builder);

        let result = runner
            .run_job(Job::SendMessage { account_id: Uuid::new_v4(), outbox_id: Uuid::new_v4() })
            .await;
        assert!(result.is_err());
    }
}
