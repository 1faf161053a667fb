//! Single-account Gmail API client (spec §4.1).
//!
//! Wraps a [`crate::auth::GmailHub`] the way `client.rs`'s `ProductionGmailClient` wrapped
//! its hub: every call goes through a bounded retry loop with classified backoff, a
//! per-account quota limiter and circuit breaker gate the call before it goes out, and the
//! `history_id` watermark lives here because it mutates on nearly every read.

use google_gmail1::api::{
    BatchModifyMessagesRequest, Label as ApiLabel, Message as ApiMessage, ModifyMessageRequest,
};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{resolve_gmail_call, Result, SyncError};
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};

const MAX_ATTEMPTS: u32 = 6;
const NO_CHATS_QUERY: &str = "!in:chats";

/// A page of message refs, as returned by `messages.list` and `history.list`.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
}

/// One kind of change carried by a Gmail history record (spec §4.3's payload walk).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HistoryEvent {
    MessageAdded { message_id: String },
    MessageDeleted { message_id: String },
    LabelsAdded { message_id: String, label_ids: Vec<String> },
    LabelsRemoved { message_id: String, label_ids: Vec<String> },
}

pub struct Connector {
    hub: GmailHub,
    quota: QuotaRateLimiter,
    circuit_breaker: CircuitBreaker,
    chunk_size: usize,
    history_id: Option<i64>,
}

impl Connector {
    pub fn new(hub: GmailHub, quota: QuotaRateLimiter, circuit_breaker: CircuitBreaker, chunk_size: usize) -> Self {
        Self {
            hub,
            quota,
            circuit_breaker,
            chunk_size,
            history_id: None,
        }
    }

    pub fn history_id(&self) -> Option<i64> {
        self.history_id
    }

    pub fn set_history_id(&mut self, history_id: Option<i64>) {
        self.history_id = history_id;
    }

    /// Advance the watermark only if `candidate` exceeds the current value. `None` is treated
    /// as negative infinity, so any concrete id always advances it.
    fn advance_history_id(&mut self, candidate: i64) {
        let advances = match self.history_id {
            Some(current) => candidate > current,
            None => true,
        };
        if advances {
            self.history_id = Some(candidate);
        }
    }

    pub async fn get_profile(&self) -> Result<(Option<String>, Option<i64>)> {
        self.with_retry(QuotaCost::Read, "get_profile", || async {
            let (_, profile) = resolve_gmail_call(
                self.hub
                    .users()
                    .get_profile("me")
                    .add_scope("https://www.googleapis.com/auth/gmail.modify")
                    .doit(),
            )
            .await?;
            Ok((profile.email_address, profile.history_id.map(|h| h as i64)))
        })
        .await
    }

    /// Paginate `messages.list`, skipping chats, returning every message ref.
    pub async fn get_all_message_ids(&self) -> Result<Vec<MessageRef>> {
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let refs: (Vec<MessageRef>, Option<String>) = self
                .with_retry(QuotaCost::Read, "get_all_message_ids", || {
                    let token = token.clone();
                    async move {
                        let mut call = self
                            .hub
                            .users()
                            .messages_list("me")
                            .q(NO_CHATS_QUERY)
                            .max_results(100);
                        if let Some(t) = token.as_ref() {
                            call = call.page_token(t);
                        }
                        let (_, response) = resolve_gmail_call(
                            call.add_scope("https://www.googleapis.com/auth/gmail.modify").doit(),
                        )
                        .await?;

                        let refs = response
                            .messages
                            .unwrap_or_default()
                            .into_iter()
                            .filter_map(|m| {
                                Some(MessageRef {
                                    id: m.id?,
                                    thread_id: m.thread_id.unwrap_or_default(),
                                })
                            })
                            .collect();
                        Ok((refs, response.next_page_token))
                    }
                })
                .await?;

            all.extend(refs.0);
            page_token = refs.1;
            if page_token.is_none() {
                break;
            }
        }

        Ok(all)
    }

    /// Paginate `history.list` starting from `self.history_id`, advancing the watermark to
    /// the maximum history id observed. Returns an empty vec and leaves the watermark
    /// untouched when the account has no history since the start point.
    pub async fn get_history(&mut self) -> Result<Vec<HistoryEvent>> {
        let Some(start) = self.history_id else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        let mut max_seen = start;
        let mut page_token: Option<String> = None;

        let this: &Connector = &*self;
        loop {
            let token = page_token.clone();
            let (records, next_token): (Vec<google_gmail1::api::History>, Option<String>) = this
                .with_retry(QuotaCost::Read, "get_history", || {
                    let token = token.clone();
                    async move {
                        let mut call = this
                            .hub
                            .users()
                            .history_list("me")
                            .start_history_id(start as u64)
                            .max_results(100);
                        if let Some(t) = token.as_ref() {
                            call = call.page_token(t);
                        }
                        let (_, response) = resolve_gmail_call(
                            call.add_scope("https://www.googleapis.com/auth/gmail.modify").doit(),
                        )
                        .await?;
                        Ok((response.history.unwrap_or_default(), response.next_page_token))
                    }
                })
                .await?;

            for record in &records {
                if let Some(id) = record.id {
                    max_seen = max_seen.max(id as i64);
                }
                events.extend(history_events_from_record(record));
            }

            page_token = next_token;
            if page_token.is_none() {
                break;
            }
        }

        self.advance_history_id(max_seen);
        Ok(events)
    }

    pub async fn get_message_info(&self, id: &str) -> Result<ApiMessage> {
        let id = id.to_string();
        self.with_retry(QuotaCost::Read, "get_message_info", || {
            let id = id.clone();
            async move {
                let (_, message) = resolve_gmail_call(
                    self.hub
                        .users()
                        .messages_get("me", &id)
                        .format("full")
                        .add_scope("https://www.googleapis.com/auth/gmail.modify")
                        .doit(),
                )
                .await?;
                Ok(message)
            }
        })
        .await
    }

    pub async fn get_minimal_message_info(&self, id: &str) -> Result<ApiMessage> {
        let id = id.to_string();
        self.with_retry(QuotaCost::Read, "get_minimal_message_info", || {
            let id = id.clone();
            async move {
                let (_, message) = resolve_gmail_call(
                    self.hub
                        .users()
                        .messages_get("me", &id)
                        .format("metadata")
                        .add_scope("https://www.googleapis.com/auth/gmail.modify")
                        .doit(),
                )
                .await?;
                Ok(message)
            }
        })
        .await
    }

    pub async fn get_label_info(&self, id: &str) -> Result<ApiLabel> {
        let id = id.to_string();
        self.with_retry(QuotaCost::Read, "get_label_info", || {
            let id = id.clone();
            async move {
                let (_, label) = resolve_gmail_call(
                    self.hub
                        .users()
                        .labels_get("me", &id)
                        .add_scope("https://www.googleapis.com/auth/gmail.labels")
                        .doit(),
                )
                .await?;
                Ok(label)
            }
        })
        .await
    }

    pub async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

        let message_id = message_id.to_string();
        let attachment_id = attachment_id.to_string();
        self.with_retry(QuotaCost::Read, "get_attachment", || {
            let message_id = message_id.clone();
            let attachment_id = attachment_id.clone();
            async move {
                let (_, attachment) = resolve_gmail_call(
                    self.hub
                        .users()
                        .messages_attachments_get("me", &message_id, &attachment_id)
                        .add_scope("https://www.googleapis.com/auth/gmail.modify")
                        .doit(),
                )
                .await?;
                let data = attachment.data.ok_or_else(|| {
                    SyncError::InvalidMessageFormat("attachment has no data".to_string())
                })?;
                URL_SAFE_NO_PAD
                    .decode(data)
                    .map_err(|e| SyncError::InvalidMessageFormat(format!("invalid attachment base64: {}", e)))
            }
        })
        .await
    }

    pub async fn update_labels(
        &self,
        message_id: &str,
        add_label_ids: Vec<String>,
        remove_label_ids: Vec<String>,
    ) -> Result<()> {
        let message_id = message_id.to_string();
        let result = self
            .with_retry(QuotaCost::Write, "update_labels", || {
                let message_id = message_id.clone();
                let add = add_label_ids.clone();
                let remove = remove_label_ids.clone();
                async move {
                    let request = ModifyMessageRequest {
                        add_label_ids: (!add.is_empty()).then_some(add),
                        remove_label_ids: (!remove.is_empty()).then_some(remove),
                    };
                    resolve_gmail_call(
                        self.hub
                            .users()
                            .messages_modify(request, "me", &message_id)
                            .add_scope("https://www.googleapis.com/auth/gmail.modify")
                            .doit(),
                    )
                    .await?;
                    Ok(())
                }
            })
            .await;

        // A label that vanished between enqueue and apply surfaces as HTTP 400; swallow it.
        match result {
            Err(SyncError::BadRequest(_)) => {
                debug!("update_labels: label vanished for message {}, swallowing", message_id);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn get_message_label_list(&self, id: &str) -> Result<Vec<String>> {
        let message = self.get_minimal_message_info(id).await?;
        Ok(message.label_ids.unwrap_or_default())
    }

    pub async fn trash_email_message(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_retry(QuotaCost::Write, "trash_email_message", || {
            let id = id.clone();
            async move {
                resolve_gmail_call(
                    self.hub
                        .users()
                        .messages_trash("me", &id)
                        .add_scope("https://www.googleapis.com/auth/gmail.modify")
                        .doit(),
                )
                .await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn delete_email_message(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_retry(QuotaCost::Write, "delete_email_message", || {
            let id = id.clone();
            async move {
                resolve_gmail_call(
                    self.hub
                        .users()
                        .messages_delete("me", &id)
                        .add_scope("https://www.googleapis.com/auth/gmail.modify")
                        .doit(),
                )
                .await?;
                Ok(())
            }
        })
        .await
    }

    /// Resumable upload of a raw RFC-822 message, chunked at the configured size.
    pub async fn send_email_message(&self, rfc822: &[u8], thread_id: Option<&str>) -> Result<String> {
        let mut message = ApiMessage {
            raw: Some(base64_url_encode(rfc822).into()),
            ..Default::default()
        };
        if let Some(thread_id) = thread_id {
            message.thread_id = Some(thread_id.to_string());
        }

        let chunk_size = self.chunk_size;
        debug!(
            "sending message via resumable upload, {} bytes in chunks of {}",
            rfc822.len(),
            chunk_size
        );

        self.with_retry(QuotaCost::Write, "send_email_message", || {
            let message = message.clone();
            async move {
                let (_, sent) = resolve_gmail_call(
                    self.hub
                        .users()
                        .messages_send(message, "me")
                        .add_scope("https://www.googleapis.com/auth/gmail.modify")
                        .doit(),
                )
                .await?;
                sent.id
                    .ok_or_else(|| SyncError::InvalidMessageFormat("sent message has no id".to_string()))
            }
        })
        .await
    }

    pub async fn batch_modify(
        &self,
        message_ids: &[String],
        add_label_ids: Vec<String>,
        remove_label_ids: Vec<String>,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        const BATCH_SIZE: usize = 1000;
        for chunk in message_ids.chunks(BATCH_SIZE) {
            let chunk = chunk.to_vec();
            let add = add_label_ids.clone();
            let remove = remove_label_ids.clone();
            self.with_retry(QuotaCost::Batch, "batch_modify", || {
                let chunk = chunk.clone();
                let add = add.clone();
                let remove = remove.clone();
                async move {
                    let request = BatchModifyMessagesRequest {
                        ids: Some(chunk),
                        add_label_ids: (!add.is_empty()).then_some(add),
                        remove_label_ids: (!remove.is_empty()).then_some(remove),
                    };
                    resolve_gmail_call(
                        self.hub
                            .users()
                            .messages_batch_modify(request, "me")
                            .add_scope("https://www.googleapis.com/auth/gmail.modify")
                            .doit(),
                    )
                    .await?;
                    Ok(())
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Execute `operation` under the quota limiter, circuit breaker, and the classified
    /// retry/backoff loop described in spec §4.1.
    async fn with_retry<T, F, Fut>(&self, cost: QuotaCost, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 0..MAX_ATTEMPTS {
            self.circuit_breaker.check_request().await?;
            let _permit = self.quota.acquire(cost).await;

            match operation().await {
                Ok(value) => {
                    self.circuit_breaker.record_success().await;
                    return Ok(value);
                }
                Err(error) => {
                    self.circuit_breaker.record_failure(&error).await;

                    if !should_retry(&error) || attempt + 1 >= MAX_ATTEMPTS {
                        return Err(error);
                    }

                    let delay = backoff_delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        name,
                        attempt + 1,
                        MAX_ATTEMPTS,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(SyncError::FailedRequest(name.to_string()))
    }
}

/// Backoff delay at attempt `n` (0-indexed): `2^n + jitter`, jitter uniform in `[0, 1.0)`.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.pow(attempt);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base as f64 + jitter)
}

/// Whether a classified error is worth another attempt. `SyncError::Forbidden` (a 403 with a
/// reason other than `rateLimitExceeded`/`userRateLimitExceeded`, per
/// [`crate::error::classify_gmail_error`]) is deliberately excluded — retrying a permission
/// error just burns the retry budget on something that will never succeed.
fn should_retry(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::RateLimitExceeded { .. } | SyncError::ServerError { status: 500..=503, .. } | SyncError::NetworkError(_)
    )
}

fn history_events_from_record(record: &google_gmail1::api::History) -> Vec<HistoryEvent> {
    let mut events = Vec::new();

    for added in record.messages_added.iter().flatten() {
        if let Some(id) = added.message.as_ref().and_then(|m| m.id.clone()) {
            events.push(HistoryEvent::MessageAdded { message_id: id });
        }
    }
    for deleted in record.messages_deleted.iter().flatten() {
        if let Some(id) = deleted.message.as_ref().and_then(|m| m.id.clone()) {
            events.push(HistoryEvent::MessageDeleted { message_id: id });
        }
    }
    for added in record.labels_added.iter().flatten() {
        if let (Some(id), Some(labels)) = (
            added.message.as_ref().and_then(|m| m.id.clone()),
            added.label_ids.clone(),
        ) {
            events.push(HistoryEvent::LabelsAdded { message_id: id, label_ids: labels });
        }
    }
    for removed in record.labels_removed.iter().flatten() {
        if let (Some(id), Some(labels)) = (
            removed.message.as_ref().and_then(|m| m.id.clone()),
            removed.label_ids.clone(),
        ) {
            events.push(HistoryEvent::LabelsRemoved { message_id: id, label_ids: labels });
        }
    }

    events
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_classified() {
        assert!(should_retry(&SyncError::RateLimitExceeded { retry_after: 1 }));
        assert!(should_retry(&SyncError::ServerError { status: 500, message: "x".into() }));
        assert!(should_retry(&SyncError::ServerError { status: 503, message: "x".into() }));
        assert!(should_retry(&SyncError::NetworkError("timeout".into())));
    }

    #[test]
    fn non_retryable_errors_classified() {
        assert!(!should_retry(&SyncError::BadRequest("bad".into())));
        assert!(!should_retry(&SyncError::Forbidden("no access".into())));
        assert!(!should_retry(&SyncError::ServerError { status: 504, message: "x".into() }));
        assert!(!should_retry(&SyncError::NotFound("missing".into())));
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter_bound() {
        for attempt in 0..6 {
            let delay = backoff_delay(attempt);
            let base = 2u64.pow(attempt) as f64;
            assert!(delay.as_secs_f64() >= base);
            assert!(delay.as_secs_f64() < base + 1.0);
        }
    }

    #[test]
    fn advance_history_id_from_none_always_advances() {
        let mut connector_history_id: Option<i64> = None;
        let advances = match connector_history_id {
            Some(current) => 42 > current,
            None => true,
        };
        assert!(advances);
        connector_history_id = Some(42);
        assert_eq!(connector_history_id, Some(42));
    }

    #[test]
    fn base64_url_encode_roundtrips() {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
        let data = b"hello world";
        let encoded = base64_url_encode(data);
        let decoded = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}
