//! Persistence seam for the entities in [`crate::models`].
//!
//! The source system persists through a Django ORM; this crate has no equivalent, so the
//! `Repository` trait plays the same role `client.rs`'s `GmailClient` trait played for the
//! network boundary: an async-trait seam that lets Manager and the task handlers run against
//! an in-memory store in tests and a real backing store in production without branching.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::models::{Account, Attachment, Credentials, Header, Label, Message, OutboxMessage, Recipient};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>>;
    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>>;
    async fn save_account(&self, account: Account) -> Result<()>;
    /// Accounts the scheduler should fan a sync task out to: authorized and not soft-deleted.
    async fn list_authorized_accounts(&self) -> Result<Vec<Account>>;

    async fn get_credentials(&self, account_id: Uuid) -> Result<Option<Credentials>>;
    async fn save_credentials(&self, credentials: Credentials) -> Result<()>;

    async fn get_label(&self, account_id: Uuid, label_id: &str) -> Result<Option<Label>>;
    async fn save_label(&self, label: Label) -> Result<()>;
    async fn list_labels(&self, account_id: Uuid) -> Result<Vec<Label>>;

    async fn find_recipient(&self, name: &str, email: &str) -> Result<Option<Recipient>>;
    async fn save_recipient(&self, recipient: Recipient) -> Result<()>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>>;
    async fn get_message_by_message_id(&self, account_id: Uuid, message_id: &str) -> Result<Option<Message>>;
    async fn save_message(&self, message: Message) -> Result<()>;
    async fn delete_message(&self, id: Uuid) -> Result<()>;
    /// Every non-deleted message currently carrying `label_id`, for per-label unread counts.
    async fn list_messages_by_label(&self, account_id: Uuid, label_id: Uuid) -> Result<Vec<Message>>;

    async fn save_header(&self, header: Header) -> Result<()>;
    async fn list_headers(&self, message_id: Uuid) -> Result<Vec<Header>>;

    async fn save_attachment(&self, attachment: Attachment) -> Result<()>;
    async fn list_attachments(&self, message_id: Uuid) -> Result<Vec<Attachment>>;
    async fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>>;

    async fn get_outbox_message(&self, id: Uuid) -> Result<Option<OutboxMessage>>;
    async fn save_outbox_message(&self, outbox: OutboxMessage) -> Result<()>;
    async fn delete_outbox_message(&self, id: Uuid) -> Result<()>;
}

/// Opaque blob store for attachment bytes (spec §6: "Storage service"). Kept separate from
/// `Repository` the same way the source splits Django's ORM from `default_storage` — message
/// metadata and attachment bytes have different durability and size characteristics.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn open(&self, path: &str) -> Result<Vec<u8>>;
    async fn save(&self, path: &str, bytes: Vec<u8>) -> Result<()>;
}

/// In-memory `Storage` used by tests and the single-process default deployment.
#[derive(Default)]
pub struct InMemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn open(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("blob {path}")))
    }

    async fn save(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(path.to_string(), bytes);
        Ok(())
    }
}

/// In-memory `Repository` used by tests and the single-process default deployment.
#[derive(Default)]
pub struct InMemoryRepository {
    accounts: RwLock<HashMap<Uuid, Account>>,
    credentials: RwLock<HashMap<Uuid, Credentials>>,
    labels: RwLock<HashMap<Uuid, Label>>,
    recipients: RwLock<HashMap<Uuid, Recipient>>,
    messages: RwLock<HashMap<Uuid, Message>>,
    headers: RwLock<HashMap<Uuid, Header>>,
    attachments: RwLock<HashMap<Uuid, Attachment>>,
    outbox: RwLock<HashMap<Uuid, OutboxMessage>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.email_address == email)
            .cloned())
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        self.accounts.write().await.insert(account.id, account);
        Ok(())
    }

    async fn list_authorized_accounts(&self) -> Result<Vec<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| a.is_authorized && !a.deleted)
            .cloned()
            .collect())
    }

    async fn get_credentials(&self, account_id: Uuid) -> Result<Option<Credentials>> {
        Ok(self.credentials.read().await.get(&account_id).cloned())
    }

    async fn save_credentials(&self, credentials: Credentials) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(credentials.account_id, credentials);
        Ok(())
    }

    async fn get_label(&self, account_id: Uuid, label_id: &str) -> Result<Option<Label>> {
        Ok(self
            .labels
            .read()
            .await
            .values()
            .find(|l| l.account_id == account_id && l.label_id == label_id)
            .cloned())
    }

    async fn save_label(&self, label: Label) -> Result<()> {
        self.labels.write().await.insert(label.id, label);
        Ok(())
    }

    async fn list_labels(&self, account_id: Uuid) -> Result<Vec<Label>> {
        Ok(self
            .labels
            .read()
            .await
            .values()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn find_recipient(&self, name: &str, email: &str) -> Result<Option<Recipient>> {
        Ok(self
            .recipients
            .read()
            .await
            .values()
            .find(|r| r.name == name && r.email_address == email)
            .cloned())
    }

    async fn save_recipient(&self, recipient: Recipient) -> Result<()> {
        self.recipients.write().await.insert(recipient.id, recipient);
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn get_message_by_message_id(&self, account_id: Uuid, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .find(|m| m.account_id == account_id && m.message_id == message_id)
            .cloned())
    }

    async fn save_message(&self, message: Message) -> Result<()> {
        self.messages.write().await.insert(message.id, message);
        Ok(())
    }

    async fn delete_message(&self, id: Uuid) -> Result<()> {
        self.messages
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(format!("message {id}")))
    }

    async fn list_messages_by_label(&self, account_id: Uuid, label_id: Uuid) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.account_id == account_id && !m.deleted && m.labels.contains(&label_id))
            .cloned()
            .collect())
    }

    async fn save_header(&self, header: Header) -> Result<()> {
        self.headers.write().await.insert(header.id, header);
        Ok(())
    }

    async fn list_headers(&self, message_id: Uuid) -> Result<Vec<Header>> {
        Ok(self
            .headers
            .read()
            .await
            .values()
            .filter(|h| h.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn save_attachment(&self, attachment: Attachment) -> Result<()> {
        self.attachments.write().await.insert(attachment.id, attachment);
        Ok(())
    }

    async fn list_attachments(&self, message_id: Uuid) -> Result<Vec<Attachment>> {
        Ok(self
            .attachments
            .read()
            .await
            .values()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>> {
        Ok(self.attachments.read().await.get(&id).cloned())
    }

    async fn get_outbox_message(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        Ok(self.outbox.read().await.get(&id).cloned())
    }

    async fn save_outbox_message(&self, outbox: OutboxMessage) -> Result<()> {
        self.outbox.write().await.insert(outbox.id, outbox);
        Ok(())
    }

    async fn delete_outbox_message(&self, id: Uuid) -> Result<()> {
        self.outbox
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(format!("outbox message {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_get_account_round_trips() {
        let repo = InMemoryRepository::new();
        let account = Account::new("user@example.com", Uuid::new_v4());
        repo.save_account(account.clone()).await.unwrap();

        let fetched = repo.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(fetched.email_address, "user@example.com");

        let by_email = repo.get_account_by_email("user@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, account.id);
    }

    #[tokio::test]
    async fn delete_missing_message_errors() {
        let repo = InMemoryRepository::new();
        let result = repo.delete_message(Uuid::new_v4()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_labels_filters_by_account() {
        let repo = InMemoryRepository::new();
        let account_a = Uuid::new_v4();
        let account_b = Uuid::new_v4();
        repo.save_label(Label::new(account_a, "Label_1", "Work", crate::models::LabelType::User))
            .await
            .unwrap();
        repo.save_label(Label::new(account_b, "Label_2", "Personal", crate::models::LabelType::User))
            .await
            .unwrap();

        let labels = repo.list_labels(account_a).await.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].name, "Work");
    }

    #[tokio::test]
    async fn list_messages_by_label_filters_deleted_and_other_accounts() {
        let repo = InMemoryRepository::new();
        let account_id = Uuid::new_v4();
        let other_account = Uuid::new_v4();
        let label_id = Uuid::new_v4();

        let mut carries_label = Message::new(account_id, "msg-1", "thread-1");
        carries_label.labels.push(label_id);
        repo.save_message(carries_label.clone()).await.unwrap();

        let mut deleted_carrier = Message::new(account_id, "msg-2", "thread-2");
        deleted_carrier.labels.push(label_id);
        deleted_carrier.deleted = true;
        repo.save_message(deleted_carrier).await.unwrap();

        let mut other_account_carrier = Message::new(other_account, "msg-3", "thread-3");
        other_account_carrier.labels.push(label_id);
        repo.save_message(other_account_carrier).await.unwrap();

        let mut no_label = Message::new(account_id, "msg-4", "thread-4");
        no_label.labels.clear();
        repo.save_message(no_label).await.unwrap();

        let matches = repo.list_messages_by_label(account_id, label_id).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, carries_label.id);
    }

    #[tokio::test]
    async fn storage_save_then_open_round_trips() {
        let storage = InMemoryStorage::new();
        storage.save("downloads/attachments/1/report.pdf", b"pdf-bytes".to_vec()).await.unwrap();

        let bytes = storage.open("downloads/attachments/1/report.pdf").await.unwrap();
        assert_eq!(bytes, b"pdf-bytes");
    }

    #[tokio::test]
    async fn storage_open_missing_path_errors() {
        let storage = InMemoryStorage::new();
        assert!(storage.open("nope").await.is_err());
    }
}
