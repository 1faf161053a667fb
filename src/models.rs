//! Persistent entity types (spec §3 DATA MODEL).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A Gmail mailbox under management. One row per Google account authorized by an owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: Uuid,
    pub email_address: String,
    pub from_name: Option<String>,
    pub label: Option<String>,
    pub is_authorized: bool,
    /// Gmail History API watermark. `None` is treated as negative infinity: no history has
    /// ever been recorded, so the next sync must bootstrap rather than page through history.
    pub history_id: Option<i64>,
    pub complete_download: bool,
    pub owner_id: Uuid,
    /// Soft-delete flag. A deleted account is excluded from the scheduler's account fan-out
    /// but its row (and history) is retained rather than hard-removed.
    pub deleted: bool,
}

impl Account {
    pub fn new(email_address: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_address: email_address.into(),
            from_name: None,
            label: None,
            is_authorized: false,
            history_id: None,
            complete_download: false,
            owner_id,
            deleted: false,
        }
    }

    /// True when no bootstrap sync has ever completed for this account.
    pub fn needs_bootstrap(&self) -> bool {
        self.history_id.is_none() || !self.complete_download
    }
}

/// OAuth2 token material for an [`Account`]. Stored separately so refresh churn never
/// touches the account row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub account_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl Credentials {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.token_expiry
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LabelType {
    System,
    User,
}

/// A Gmail label mirrored locally. The synthetic UNREAD_LABEL read-flag is never stored
/// here; it is projected onto [`Message::read`] instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    pub id: Uuid,
    pub account_id: Uuid,
    pub label_type: LabelType,
    pub label_id: String,
    pub name: String,
    pub unread: i64,
}

impl Label {
    pub fn new(account_id: Uuid, label_id: impl Into<String>, name: impl Into<String>, label_type: LabelType) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            label_type,
            label_id: label_id.into(),
            name: name.into(),
            unread: 0,
        }
    }
}

/// A parsed `name <email>` pair, deduplicated by the (name, email) pair across messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub id: Uuid,
    pub name: String,
    pub email_address: String,
}

impl Recipient {
    pub fn new(name: impl Into<String>, email_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email_address: email_address.into(),
        }
    }

    /// Key used for de-duplication: identical name+email pairs are the same Recipient row.
    pub fn dedupe_key(&self) -> (String, String) {
        (self.name.clone(), self.email_address.clone())
    }
}

/// A downloaded Gmail message and its locally derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub account_id: Uuid,
    pub message_id: String,
    pub thread_id: String,
    pub draft_id: Option<String>,
    pub sender_id: Option<Uuid>,
    pub received_by: Vec<Uuid>,
    pub received_by_cc: Vec<Uuid>,
    pub subject: String,
    pub snippet: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub has_attachment: bool,
    pub is_downloaded: bool,
    pub read: bool,
    pub sent_date: Option<DateTime<Utc>>,
    pub labels: Vec<Uuid>,
    pub deleted: bool,
}

impl Message {
    pub fn new(account_id: Uuid, message_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            message_id: message_id.into(),
            thread_id: thread_id.into(),
            draft_id: None,
            sender_id: None,
            received_by: Vec::new(),
            received_by_cc: Vec::new(),
            subject: String::new(),
            snippet: String::new(),
            body_html: None,
            body_text: None,
            has_attachment: false,
            is_downloaded: false,
            read: true,
            sent_date: None,
            labels: Vec::new(),
            deleted: false,
        }
    }
}

/// A raw header captured off a message, deduplicated per (message, name, value) by a
/// stable hash of the value so repeated identical headers collapse to one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub id: Uuid,
    pub message_id: Uuid,
    pub name: String,
    pub value: String,
    pub value_hash: String,
}

impl Header {
    pub fn new(message_id: Uuid, name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        let value_hash = Self::hash_value(&value);
        Self {
            id: Uuid::new_v4(),
            message_id,
            name: name.into(),
            value,
            value_hash,
        }
    }

    /// Stable 40-character hex digest (SHA-1-shaped) used as the dedup key component.
    pub fn hash_value(value: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(value.as_bytes());
        hex::encode(digest)[..40].to_string()
    }
}

/// A downloaded or to-be-sent attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub message_id: Uuid,
    pub path: String,
    pub cid: Option<String>,
    pub inline: bool,
    pub size: i64,
}

impl Attachment {
    /// Basename derived from the stored path, mirroring the source system's `.name` property.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// A composed, not-yet-sent message awaiting assembly and dispatch by OutboxBuilder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub send_from: Uuid,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub headers: std::collections::HashMap<String, String>,
    pub mapped_attachments: Vec<Uuid>,
    pub original_attachment_ids: Vec<Uuid>,
    pub original_message_id: Option<Uuid>,
}

impl OutboxMessage {
    pub fn new(send_from: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            send_from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body: String::new(),
            headers: std::collections::HashMap::new(),
            mapped_attachments: Vec::new(),
            original_attachment_ids: Vec::new(),
            original_message_id: None,
        }
    }
}

/// Custom deserializers for raw Gmail API wire types.
pub mod deserializers {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use chrono::{DateTime, Utc};
    use serde::{
        de::{self, Deserializer},
        Deserialize,
    };

    /// Deserialize a Gmail timestamp (milliseconds since epoch, carried as a JSON string).
    pub fn deserialize_gmail_timestamp<'de, D>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let millis = s.parse::<i64>().map_err(de::Error::custom)?;
                let dt = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| de::Error::custom("invalid timestamp"))?;
                Ok(Some(dt))
            }
            None => Ok(None),
        }
    }

    /// Decode a base64url (no padding) encoded message or attachment body.
    pub fn deserialize_base64url<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let decoded = URL_SAFE_NO_PAD.decode(s).map_err(de::Error::custom)?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_needs_bootstrap_when_history_id_absent() {
        let account = Account::new("user@example.com", Uuid::new_v4());
        assert!(account.needs_bootstrap());
    }

    #[test]
    fn account_does_not_need_bootstrap_once_complete() {
        let mut account = Account::new("user@example.com", Uuid::new_v4());
        account.history_id = Some(100);
        account.complete_download = true;
        assert!(!account.needs_bootstrap());
    }

    #[test]
    fn credentials_expired_detection() {
        let mut creds = Credentials {
            account_id: Uuid::new_v4(),
            access_token: "tok".into(),
            refresh_token: "refresh".into(),
            token_expiry: Utc::now() - chrono::Duration::seconds(10),
            scopes: vec![],
        };
        assert!(creds.is_expired());
        creds.token_expiry = Utc::now() + chrono::Duration::seconds(3600);
        assert!(!creds.is_expired());
    }

    #[test]
    fn header_hash_is_stable_and_40_chars() {
        let id = Uuid::new_v4();
        let a = Header::new(id, "Subject", "hello world");
        let b = Header::new(id, "Subject", "hello world");
        assert_eq!(a.value_hash, b.value_hash);
        assert_eq!(a.value_hash.len(), 40);
    }

    #[test]
    fn header_hash_differs_for_different_values() {
        let id = Uuid::new_v4();
        let a = Header::new(id, "Subject", "hello");
        let b = Header::new(id, "Subject", "world");
        assert_ne!(a.value_hash, b.value_hash);
    }

    #[test]
    fn attachment_name_is_path_basename() {
        let attachment = Attachment {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            path: "downloads/attachments/123/invoice.pdf".to_string(),
            cid: None,
            inline: false,
            size: 1024,
        };
        assert_eq!(attachment.name(), "invoice.pdf");
    }

    #[test]
    fn recipient_dedupe_key_matches_for_identical_pairs() {
        let a = Recipient::new("Alice", "alice@example.com");
        let b = Recipient::new("Alice", "alice@example.com");
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }
}
