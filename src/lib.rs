//! Gmail synchronization and mailbox-management service.
//!
//! A per-account sync engine that mirrors a Gmail mailbox into local storage and exposes
//! mutation operations (read/archive/trash/delete/send) back onto Gmail, keeping both sides
//! eventually consistent via the History API watermark.
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 credential storage/refresh and Gmail hub construction
//! - [`circuit_breaker`] - Per-account failure-rate circuit breaker
//! - [`cli`] - Command-line interface (`sync-account`, `get-message`, `init-config`)
//! - [`config`] - Configuration management
//! - [`connector`] - Single-account Gmail API client with retry/backoff
//! - [`error`] - Error types and result alias
//! - [`external`] - OAuth2 setup/callback contract for the host application
//! - [`manager`] - Per-account sync orchestration
//! - [`message_builder`] - Gmail payload parsing into local entities
//! - [`models`] - Core data structures
//! - [`outbox_builder`] - RFC-822 assembly for outbound messages
//! - [`rate_limiter`] - Per-account Gmail quota token bucket
//! - [`store`] - Persistence seam (`Repository`/`Storage` traits)
//! - [`sync_lock`] - Advisory TTL lock for bootstrap serialization
//! - [`tasks`] - Task queue, scheduler, and per-task dispatch

pub mod auth;
pub mod circuit_breaker;
pub mod cli;
pub mod config;
pub mod connector;
pub mod error;
pub mod external;
pub mod manager;
pub mod message_builder;
pub mod models;
pub mod outbox_builder;
pub mod rate_limiter;
pub mod store;
pub mod sync_lock;
pub mod tasks;

pub use error::{Result, SyncError};

pub use models::{Account, Attachment, Credentials, Header, Label, LabelType, Message, OutboxMessage, Recipient};

pub use config::Settings;

pub use store::{InMemoryRepository, InMemoryStorage, Repository, Storage};

pub use auth::{CredentialStore, GmailHub, RepositoryCredentialStore};

pub use connector::{Connector, HistoryEvent, MessageRef};

pub use manager::Manager;

pub use outbox_builder::OutboxBuilder;

pub use external::{CallbackOutcome, ExternalInterfaces, StateTokenSigner};

pub use tasks::{
    AmqpTaskQueue, AmqpWorker, GmailManagerFactory, InProcessTaskQueue, Job, ManagerFactory, Scheduler, TaskQueue,
    TaskRunner,
};

pub use cli::{Cli, Commands};
