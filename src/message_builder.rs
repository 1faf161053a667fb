//! Transforms a Gmail payload into local rows inside a single logical unit of work (spec §4.3).
//!
//! Grounded on `message_builder.py`'s `MessageBuilder`: the payload walk, header
//! classification, recipient regex, and attachment filename sanitization are all carried
//! over in shape, re-expressed with `encoding_rs`/`mime_guess` standing in for the source's
//! `chardet`/`mimetypes` modules; address parsing is hand-rolled rather than RFC-2822-exact.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use google_gmail1::api::{Message as ApiMessage, MessagePart, MessagePartHeader};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::connector::Connector;
use crate::error::Result;
use crate::models::{Attachment, Header, Label, Message, Recipient};
use crate::store::{Repository, Storage};

/// Resolves or creates a [`Label`] by remote id, the job Manager's `get_label` performs.
/// MessageBuilder depends on this rather than on Manager directly to avoid a cycle.
#[async_trait]
pub trait LabelResolver: Send + Sync {
    async fn get_label(&self, account_id: Uuid, label_id: &str) -> Result<Label>;
}

pub struct MessageBuilder {
    repository: Arc<dyn Repository>,
    storage: Arc<dyn Storage>,
    unread_label: String,
    /// `StorageConfig.email_attachment_upload_to`, e.g. `downloads/attachments/{message_id}/{filename}`.
    attachment_path_template: String,
}

static RECIPIENT_SPLIT_GUARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\.[A-Z]{2,16}|>)(,)").unwrap());

impl MessageBuilder {
    pub fn new(
        repository: Arc<dyn Repository>,
        storage: Arc<dyn Storage>,
        unread_label: impl Into<String>,
        attachment_path_template: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            storage,
            unread_label: unread_label.into(),
            attachment_path_template: attachment_path_template.into(),
        }
    }

    /// Upsert a Message keyed by (account, remote id). Populates snippet and body on first
    /// download only; always refreshes labels and the read flag.
    pub async fn store_message_info(
        &self,
        account_id: Uuid,
        payload: &ApiMessage,
        labels: &dyn LabelResolver,
        connector: &Connector,
    ) -> Result<Uuid> {
        let remote_id = payload
            .id
            .clone()
            .ok_or_else(|| crate::error::SyncError::InvalidMessageFormat("message has no id".to_string()))?;
        let thread_id = payload.thread_id.clone().unwrap_or_default();

        let mut message = match self.repository.get_message_by_message_id(account_id, &remote_id).await? {
            Some(existing) => existing,
            None => Message::new(account_id, remote_id.clone(), thread_id.clone()),
        };
        message.thread_id = thread_id;

        if let Some(internal_date) = payload.internal_date {
            message.sent_date = millis_to_datetime(internal_date);
        }

        if !message.is_downloaded {
            message.snippet = payload.snippet.clone().unwrap_or_default();
            if let Some(root) = &payload.payload {
                // Only the top-level payload's headers become Header rows / subject/sender
                // fields; a nested `message/rfc822` forwarded part carries its own Subject/
                // From/To/Cc that must not overwrite the outer message's.
                self.extract_headers(&mut message, account_id, root).await?;
                self.walk_payload(&mut message, account_id, root, connector).await?;
            }
            message.is_downloaded = true;
        }

        self.refresh_labels_and_read(&mut message, account_id, payload, labels).await?;

        self.repository.save_message(message.clone()).await?;
        Ok(message.id)
    }

    /// Minimal/label-only refresh: thread id and labels, body untouched.
    pub async fn update_message(
        &self,
        account_id: Uuid,
        payload: &ApiMessage,
        labels: &dyn LabelResolver,
    ) -> Result<()> {
        let remote_id = payload
            .id
            .clone()
            .ok_or_else(|| crate::error::SyncError::InvalidMessageFormat("message has no id".to_string()))?;

        let mut message = self
            .repository
            .get_message_by_message_id(account_id, &remote_id)
            .await?
            .ok_or_else(|| crate::error::SyncError::NotFound(format!("message {remote_id}")))?;

        message.thread_id = payload.thread_id.clone().unwrap_or(message.thread_id);
        self.refresh_labels_and_read(&mut message, account_id, payload, labels).await?;
        self.repository.save_message(message).await?;
        Ok(())
    }

    async fn refresh_labels_and_read(
        &self,
        message: &mut Message,
        account_id: Uuid,
        payload: &ApiMessage,
        labels: &dyn LabelResolver,
    ) -> Result<()> {
        let label_ids = payload.label_ids.clone().unwrap_or_default();
        message.read = !label_ids.iter().any(|l| l == &self.unread_label);

        let mut resolved = Vec::new();
        for label_id in &label_ids {
            if label_id == &self.unread_label {
                continue;
            }
            let label = labels.get_label(account_id, label_id).await?;
            resolved.push(label.id);
        }
        message.labels = resolved;
        Ok(())
    }

    /// Recurse through a payload tree, routing leaves by MIME type per spec §4.3.
    async fn walk_payload(
        &self,
        message: &mut Message,
        account_id: Uuid,
        part: &MessagePart,
        connector: &Connector,
    ) -> Result<()> {
        if let Some(children) = &part.parts {
            if !children.is_empty() {
                for child in children {
                    Box::pin(self.walk_payload(message, account_id, child, connector)).await?;
                }
                return Ok(());
            }
        }

        self.classify_leaf(message, account_id, part, connector).await?;
        Ok(())
    }

    async fn classify_leaf(
        &self,
        message: &mut Message,
        account_id: Uuid,
        part: &MessagePart,
        connector: &Connector,
    ) -> Result<()> {
        let mime_type = part.mime_type.clone().unwrap_or_default();
        let has_filename = part.filename.as_deref().is_some_and(|f| !f.is_empty());
        let has_inline_data = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_ref())
            .is_some_and(|d| !d.is_empty());

        let is_attachment = has_filename
            || !has_inline_data
            || mime_type == "text/css"
            || mime_type.starts_with("image/")
            || mime_type == "application/octet-stream"
            || (!mime_type.starts_with("text/") && !matches!(mime_type.as_str(), "text/html" | "text/plain"));

        match mime_type.as_str() {
            "text/html" if !is_attachment => {
                if let Some(text) = self.decode_body(part).await? {
                    let existing = message.body_html.take().unwrap_or_default();
                    message.body_html = Some(existing + &text);
                }
            }
            "text/plain" if !is_attachment => {
                if let Some(text) = self.decode_body(part).await? {
                    let existing = message.body_text.take().unwrap_or_default();
                    message.body_text = Some(existing + &text);
                }
            }
            "text/xml" | "text/rfc822-headers" => {}
            _ => {
                self.extract_attachment(message, account_id, part, connector).await?;
            }
        }

        Ok(())
    }

    /// Body decoding chain: declared charset, then sniffed, then forced UTF-8 with
    /// replacement, guaranteeing the final string is valid UTF-8.
    async fn decode_body(&self, part: &MessagePart) -> Result<Option<String>> {
        let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|e| crate::error::SyncError::InvalidMessageFormat(format!("invalid body base64: {}", e)))?;

        let declared = declared_charset(part);
        let (decoded, _, _) = if let Some(label) = declared.as_deref() {
            if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
                encoding.decode(&bytes)
            } else {
                let (sniffed, _) = encoding_rs::Encoding::for_bom(&bytes).unwrap_or((encoding_rs::UTF_8, 0));
                sniffed.decode(&bytes)
            }
        } else {
            let (sniffed, _) = encoding_rs::Encoding::for_bom(&bytes).unwrap_or((encoding_rs::UTF_8, 0));
            sniffed.decode(&bytes)
        };

        Ok(Some(decoded.into_owned()))
    }

    async fn extract_headers(&self, message: &mut Message, _account_id: Uuid, part: &MessagePart) -> Result<()> {
        const KNOWN: &[&str] = &["subject", "to", "delivered-to", "cc", "from"];

        let Some(headers) = &part.headers else { return Ok(()) };
        let dict = headers_to_dict(headers);

        if let Some(subject) = dict.get("subject") {
            message.subject = subject.clone();
        }
        for key in ["to", "delivered-to"] {
            if let Some(value) = dict.get(key) {
                let recipients = self.resolve_recipients(value).await?;
                for id in recipients {
                    if !message.received_by.contains(&id) {
                        message.received_by.push(id);
                    }
                }
            }
        }
        if let Some(cc) = dict.get("cc") {
            let recipients = self.resolve_recipients(cc).await?;
            for id in recipients {
                if !message.received_by_cc.contains(&id) {
                    message.received_by_cc.push(id);
                }
            }
        }
        if let Some(from) = dict.get("from") {
            let recipients = self.resolve_recipients(from).await?;
            message.sender_id = recipients.into_iter().next();
        }

        for header in headers {
            let (Some(name), Some(value)) = (&header.name, &header.value) else { continue };
            if KNOWN.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            let header_row = Header::new(message.id, name.clone(), value.clone());
            self.repository.save_header(header_row).await?;
        }

        Ok(())
    }

    /// Split on commas not inside angle brackets or a TLD suffix, then resolve-or-create a
    /// Recipient for each `(name, email)` fragment.
    async fn resolve_recipients(&self, header_value: &str) -> Result<Vec<Uuid>> {
        let guarded = RECIPIENT_SPLIT_GUARD.replace_all(header_value, "$1;");
        let mut ids = Vec::new();

        for fragment in guarded.split("; ") {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            let (name, email) = parse_address(fragment);
            if email.is_empty() {
                continue;
            }

            let recipient = match self.repository.find_recipient(&name, &email).await? {
                Some(existing) => existing,
                None => {
                    let new_recipient = Recipient::new(name, email);
                    self.repository.save_recipient(new_recipient.clone()).await?;
                    new_recipient
                }
            };
            ids.push(recipient.id);
        }

        Ok(ids)
    }

    async fn extract_attachment(
        &self,
        message: &mut Message,
        _account_id: Uuid,
        part: &MessagePart,
        connector: &Connector,
    ) -> Result<()> {
        let content_id = part
            .headers
            .as_ref()
            .map(|hs| headers_to_dict(hs))
            .and_then(|dict| dict.get("content-id").cloned());

        let data = match part.body.as_ref().and_then(|b| b.data.clone()) {
            Some(data) if !data.is_empty() => URL_SAFE_NO_PAD
                .decode(data)
                .map_err(|e| crate::error::SyncError::InvalidMessageFormat(format!("invalid attachment base64: {}", e)))?,
            _ => {
                let attachment_id = part.body.as_ref().and_then(|b| b.attachment_id.clone());
                match attachment_id {
                    Some(att_id) => match connector.get_attachment(&message.message_id, &att_id).await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            // The row is still saved without this attachment; a single bad
                            // part must not sink the whole message.
                            tracing::warn!(
                                message_id = %message.message_id,
                                attachment_id = %att_id,
                                error = %err,
                                "failed to fetch attachment, skipping it"
                            );
                            return Ok(());
                        }
                    },
                    None => Vec::new(),
                }
            }
        };

        let mime_type = part.mime_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = sanitize_filename(part.filename.as_deref())
            .unwrap_or_else(|| synthesize_filename(part.part_id.as_deref(), &message.message_id, &mime_type));

        let path = self
            .attachment_path_template
            .replace("{message_id}", &message.message_id)
            .replace("{filename}", &filename);

        if let Err(err) = self.storage.save(&path, data.clone()).await {
            tracing::warn!(path = %path, error = %err, "failed to store attachment, skipping it");
            return Ok(());
        }

        let attachment = Attachment {
            id: Uuid::new_v4(),
            message_id: message.id,
            path,
            cid: content_id.clone(),
            inline: content_id.is_some(),
            size: data.len() as i64,
        };

        self.repository.save_attachment(attachment).await?;
        message.has_attachment = true;
        Ok(())
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn declared_charset(part: &MessagePart) -> Option<String> {
    let dict = headers_to_dict(part.headers.as_ref()?);
    let content_type = dict.get("content-type")?;

    content_type
        .split(';')
        .map(str::trim)
        .find_map(|segment| segment.strip_prefix("charset=").map(|v| v.trim_matches('"').to_string()))
}

/// Case-insensitive header lookup: lowercases each `name` as the key. A duplicated header
/// (e.g. multiple `Received` lines) keeps only its last occurrence — fine for the single-value
/// lookups this backs (content-type, content-id), not used where multiplicity matters.
fn headers_to_dict(headers: &[MessagePartHeader]) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|h| Some((h.name.as_ref()?.to_lowercase(), h.value.clone().unwrap_or_default())))
        .collect()
}

/// Parse an RFC-2822 `"Name" <email>` or bare `email` fragment.
fn parse_address(fragment: &str) -> (String, String) {
    if let (Some(start), Some(end)) = (fragment.find('<'), fragment.find('>')) {
        if start < end {
            let name = fragment[..start].trim().trim_matches('"').to_string();
            let email = fragment[start + 1..end].trim().to_string();
            return (name, email);
        }
    }
    (String::new(), fragment.trim().to_string())
}

/// Strip path separators and colons, truncate names over 200 characters to `None`.
fn sanitize_filename(filename: Option<&str>) -> Option<String> {
    let filename = filename?;
    if filename.is_empty() {
        return None;
    }

    let cleaned = filename.rsplit(['/', '\\']).next().unwrap_or(filename).replace(':', "");

    if cleaned.len() > 200 {
        None
    } else {
        Some(cleaned)
    }
}

fn synthesize_filename(part_id: Option<&str>, message_id: &str, mime_type: &str) -> String {
    let ext = extension_for_mime_type(mime_type);
    match part_id {
        Some(part_id) if !part_id.is_empty() => format!("attachment-{}{}", part_id, ext),
        _ => format!("attachment-{}-0{}", message_id, ext),
    }
}

/// Preferred-extension table (spec §4.3 / §2.2 supplement): a couple of fixed overrides,
/// then `mime_guess`, then a `.bak` fallback.
fn extension_for_mime_type(mime_type: &str) -> String {
    match mime_type {
        "text/plain" => ".txt".to_string(),
        "text/html" => ".html".to_string(),
        _ => mime_guess::get_mime_extensions_str(mime_type)
            .and_then(|exts| exts.first())
            .map(|ext| format!(".{}", ext))
            .unwrap_or_else(|| ".bak".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_handles_name_and_email() {
        let (name, email) = parse_address("John Doe <john@example.com>");
        assert_eq!(name, "John Doe");
        assert_eq!(email, "john@example.com");
    }

    #[test]
    fn parse_address_handles_bare_email() {
        let (name, email) = parse_address("plain@example.com");
        assert_eq!(name, "");
        assert_eq!(email, "plain@example.com");
    }

    #[test]
    fn parse_address_strips_quotes_around_name() {
        let (name, _) = parse_address("\"Jane Smith\" <jane@example.com>");
        assert_eq!(name, "Jane Smith");
    }

    #[test]
    fn sanitize_filename_strips_path_and_colons() {
        assert_eq!(sanitize_filename(Some("C:/evil/path/report:final.pdf")), Some("report final.pdf".to_string()));
    }

    #[test]
    fn sanitize_filename_drops_overlong_names() {
        let long_name = "a".repeat(201);
        assert_eq!(sanitize_filename(Some(&long_name)), None);
    }

    #[test]
    fn sanitize_filename_none_for_empty() {
        assert_eq!(sanitize_filename(Some("")), None);
        assert_eq!(sanitize_filename(None), None);
    }

    #[test]
    fn synthesize_filename_uses_part_id_when_present() {
        let name = synthesize_filename(Some("1.2"), "msg123", "text/plain");
        assert_eq!(name, "attachment-1.2.txt");
    }

    #[test]
    fn synthesize_filename_falls_back_to_message_id() {
        let name = synthesize_filename(None, "msg123", "text/html");
        assert_eq!(name, "attachment-msg123-0.html");
    }

    #[test]
    fn extension_for_mime_type_uses_fixed_table() {
        assert_eq!(extension_for_mime_type("text/plain"), ".txt");
        assert_eq!(extension_for_mime_type("text/html"), ".html");
    }

    #[test]
    fn extension_for_mime_type_falls_back_to_bak() {
        assert_eq!(extension_for_mime_type("application/x-totally-unknown"), ".bak");
    }

    #[test]
    fn headers_to_dict_lowercases_keys() {
        let headers = vec![
            MessagePartHeader { name: Some("Content-Type".to_string()), value: Some("text/html; charset=\"UTF-8\"".to_string()) },
            MessagePartHeader { name: Some("Content-ID".to_string()), value: Some("<img1>".to_string()) },
        ];
        let dict = headers_to_dict(&headers);
        assert_eq!(dict.get("content-type").map(String::as_str), Some("text/html; charset=\"UTF-8\""));
        assert_eq!(dict.get("content-id").map(String::as_str), Some("<img1>"));
    }

    #[test]
    fn headers_to_dict_skips_headers_with_no_name() {
        let headers = vec![MessagePartHeader { name: None, value: Some("x".to_string()) }];
        assert!(headers_to_dict(&headers).is_empty());
    }

    #[test]
    fn declared_charset_reads_from_content_type_header() {
        let part = MessagePart {
            headers: Some(vec![MessagePartHeader {
                name: Some("Content-Type".to_string()),
                value: Some("text/plain; charset=\"ISO-8859-1\"".to_string()),
            }]),
            ..Default::default()
        };
        assert_eq!(declared_charset(&part), Some("ISO-8859-1".to_string()));
    }

    #[test]
    fn recipient_split_guard_preserves_angle_bracket_pairs() {
        let input = "John Doe <john@example.com>, Jane Smith <jane@example.co.uk>";
        let guarded = RECIPIENT_SPLIT_GUARD.replace_all(input, "$1;");
        let parts: Vec<_> = guarded.split("; ").collect();
        assert_eq!(parts.len(), 2);
    }
}
