//! Assembles an outbound RFC-822 message from an [`OutboxMessage`] row (spec §4.5).
//!
//! Grounded on `body_parser.py`'s `replace_cid_and_change_headers` and
//! `create_email_from_emailmessage`: locate `<img>` tags carrying a `cid` attribute that
//! matches a mapped attachment's Content-ID (with or without surrounding angle brackets),
//! rewrite them to `src="cid:<id>"`, and wire the matched attachment in as an inline MIME
//! part. `scraper` parses read-only documents and cannot serialize a mutated tree back out,
//! so detection of plain `<img>`/`<a>` tags can lean on it but the actual rewrite here is a
//! narrow regex substitution over the original markup, the same division of labor
//! `body_composer.rs` in the wider Gmail tooling ecosystem uses for body templating.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::models::{Attachment, OutboxMessage};
use crate::store::{Repository, Storage};

/// Stand-in for html2text's `body_width = 0` ("no wrapping"); html2text's width parameter
/// divides by zero at 0, so a generously large column count is used instead.
const TEXT_WRAP_WIDTH: usize = 100_000;

static IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static CID_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bcid\s*=\s*"([^"]*)""#).unwrap());
static SRC_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bsrc\s*=\s*"[^"]*""#).unwrap());
static ANCHOR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<a\b[^>]*>").unwrap());
static TARGET_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\btarget\s*="#).unwrap());

pub struct OutboxBuilder {
    repository: Arc<dyn Repository>,
    storage: Arc<dyn Storage>,
}

struct InlineImage {
    attachment: Attachment,
    content_id: String,
}

impl OutboxBuilder {
    pub fn new(repository: Arc<dyn Repository>, storage: Arc<dyn Storage>) -> Self {
        Self { repository, storage }
    }

    /// Produce the raw bytes of a `multipart/related` RFC-822 message ready to hand to
    /// [`crate::connector::Connector::send_email_message`].
    pub async fn build(&self, outbox: &OutboxMessage) -> Result<Vec<u8>> {
        let sender = self
            .repository
            .get_account(outbox.send_from)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("account {}", outbox.send_from)))?;

        let mapped_attachments = self.load_attachments(&outbox.mapped_attachments).await?;
        let original_attachments = self.load_attachments(&outbox.original_attachment_ids).await?;

        let (rewritten_html, inline_images) = Self::rewrite_inline_images(&outbox.body, &mapped_attachments);
        let body_html = Self::apply_target_blank(&rewritten_html);
        let body_text = html2text::from_read(outbox.body.as_bytes(), TEXT_WRAP_WIDTH);

        let from_address = match sender.from_name.as_deref() {
            Some(name) if !name.is_empty() => mail_builder::headers::address::Address::new_address(
                Some(Cow::Owned(name.to_string())),
                Cow::Owned(sender.email_address.clone()),
            ),
            _ => mail_builder::headers::address::Address::new_address(
                None::<Cow<str>>,
                Cow::Owned(sender.email_address.clone()),
            ),
        };

        let mut builder = mail_builder::MessageBuilder::new()
            .from(from_address)
            .subject(outbox.subject.clone())
            .text_body(body_text)
            .html_body(body_html);

        if !outbox.to.is_empty() {
            builder = builder.to(Self::address_list(&outbox.to));
        }
        if !outbox.cc.is_empty() {
            builder = builder.cc(Self::address_list(&outbox.cc));
        }
        if !outbox.bcc.is_empty() {
            builder = builder.bcc(Self::address_list(&outbox.bcc));
        }

        for (name, value) in &outbox.headers {
            builder = builder.header(
                name.clone(),
                mail_builder::headers::raw::Raw::new(Cow::Owned(value.clone())),
            );
        }

        for inline in &inline_images {
            let bytes = self.storage.open(&inline.attachment.path).await?;
            let mime = Self::guess_mime(&inline.attachment.path);
            builder = builder.inline(mime, inline.content_id.clone(), bytes);
        }

        for attachment in &original_attachments {
            if attachment.inline {
                continue;
            }
            let bytes = self.storage.open(&attachment.path).await.map_err(|err| {
                tracing::error!(
                    attachment = %attachment.path,
                    error = %err,
                    "couldn't get attachment, not sending outbox message"
                );
                err
            })?;
            let mime = Self::guess_mime(&attachment.path);
            builder = builder.attachment(mime, attachment.name().to_string(), bytes);
        }

        builder
            .write_to_vec()
            .map_err(|e| SyncError::Unknown(format!("failed to assemble rfc822 message: {e}")))
    }

    async fn load_attachments(&self, ids: &[Uuid]) -> Result<Vec<Attachment>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(attachment) = self.repository.get_attachment(*id).await? {
                out.push(attachment);
            }
        }
        Ok(out)
    }

    fn address_list(addrs: &[String]) -> mail_builder::headers::address::Address<'static> {
        let list = addrs
            .iter()
            .cloned()
            .map(|addr| mail_builder::headers::address::Address::new_address(None::<Cow<str>>, Cow::Owned(addr)))
            .collect();
        mail_builder::headers::address::Address::new_list(list)
    }

    fn guess_mime(path: &str) -> String {
        mime_guess::from_path(path).first_or_octet_stream().to_string()
    }

    /// Finds `<img cid="...">` tags matching a mapped attachment's Content-ID and rewrites
    /// them to `src="cid:<id>"`, returning the attachments actually referenced so they can be
    /// attached as inline MIME parts.
    fn rewrite_inline_images(html: &str, attachments: &[Attachment]) -> (String, Vec<InlineImage>) {
        let mut matched = Vec::new();
        let mut used: HashSet<Uuid> = HashSet::new();

        let rewritten = IMG_TAG.replace_all(html, |caps: &Captures| -> String {
            let tag = &caps[0];
            let Some(cid_caps) = CID_ATTR.captures(tag) else {
                return tag.to_string();
            };
            let image_cid = cid_caps[1].to_string();

            let found = attachments.iter().find(|a| {
                !used.contains(&a.id)
                    && a.cid.as_deref().is_some_and(|c| {
                        c == image_cid || c.trim_start_matches('<').trim_end_matches('>') == image_cid
                    })
            });

            let Some(attachment) = found else {
                return tag.to_string();
            };
            used.insert(attachment.id);
            matched.push(InlineImage {
                attachment: attachment.clone(),
                content_id: image_cid.clone(),
            });

            let without_cid = CID_ATTR.replace(tag, "");
            let new_src = format!(r#"src="cid:{}""#, image_cid);
            if SRC_ATTR.is_match(&without_cid) {
                SRC_ATTR.replace(&without_cid, new_src.as_str()).into_owned()
            } else {
                without_cid.replacen('>', &format!(" {}>", new_src), 1)
            }
        });

        (rewritten.into_owned(), matched)
    }

    /// Every anchor tag gets `target="_blank"` so links open outside the reading pane.
    fn apply_target_blank(html: &str) -> String {
        ANCHOR_TAG
            .replace_all(html, |caps: &Captures| -> String {
                let tag = &caps[0];
                if TARGET_ATTR.is_match(tag) {
                    tag.to_string()
                } else {
                    tag.replacen('>', " target=\"_blank\">", 1)
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(cid: &str) -> Attachment {
        Attachment {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            path: "downloads/attachments/1/logo.png".to_string(),
            cid: Some(cid.to_string()),
            inline: true,
            size: 128,
        }
    }

    #[test]
    fn rewrite_inline_images_matches_bare_cid() {
        let html = r#"<p><img cid="logo123" width="50"></p>"#;
        let attachments = vec![attachment("logo123")];

        let (rewritten, matched) = OutboxBuilder::rewrite_inline_images(html, &attachments);
        assert_eq!(matched.len(), 1);
        assert!(rewritten.contains(r#"src="cid:logo123""#));
        assert!(!rewritten.contains("cid=\"logo123\""));
    }

    #[test]
    fn rewrite_inline_images_matches_angle_bracket_cid() {
        let html = r#"<img cid="logo123">"#;
        let attachments = vec![attachment("<logo123>")];

        let (_, matched) = OutboxBuilder::rewrite_inline_images(html, &attachments);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn rewrite_inline_images_leaves_unmatched_tags_untouched() {
        let html = r#"<img cid="unknown" src="https://example.com/a.png">"#;
        let attachments = vec![attachment("other")];

        let (rewritten, matched) = OutboxBuilder::rewrite_inline_images(html, &attachments);
        assert!(matched.is_empty());
        assert_eq!(rewritten, html);
    }

    #[test]
    fn apply_target_blank_adds_attribute_once() {
        let html = r#"<a href="https://example.com">link</a>"#;
        let result = OutboxBuilder::apply_target_blank(html);
        assert!(result.contains(r#"target="_blank""#));
    }

    #[test]
    fn apply_target_blank_does_not_duplicate_existing_attribute() {
        let html = r#"<a href="https://example.com" target="_self">link</a>"#;
        let result = OutboxBuilder::apply_target_blank(html);
        assert_eq!(result.matches("target=").count(), 1);
    }
}
