//! OAuth2 setup/callback contract the host application mounts into its own HTTP router
//! (spec §6: "two endpoints are provided to the host application, both requiring an
//! authenticated user"). This crate owns the XSRF state-token scheme, the consent-URL
//! construction, and the code-exchange/account-provisioning logic; the host supplies the
//! authenticated user id and the actual HTTP framework.
//!
//! Grounded on the `hmac`+`sha2` state-signing idiom used for OAuth CSRF protection
//! elsewhere in the Rust ecosystem: a state token is `base64(payload || hmac-sha256(payload))`
//! where `payload` is `user_id:issued_at_unix`, so tampering or user-substitution both fail
//! the signature check and an expired token fails the timestamp check.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use google_gmail1::{hyper_rustls, hyper_util};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{build_hub_with_access_token, CredentialStore};
use crate::config::Settings;
use crate::error::{Result, SyncError};
use crate::models::{Account, Credentials};
use crate::store::Repository;

type HmacSha256 = Hmac<Sha256>;

const STATE_VALIDITY_MINUTES: i64 = 10;
const HMAC_LEN: usize = 32;
const GMAIL_SCOPE: &str = "https://mail.google.com/";

/// Issue and validate the XSRF-bound OAuth2 state token (spec §6's *Setup*/*Callback* pair).
pub struct StateTokenSigner {
    secret: String,
}

impl StateTokenSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// `base64url(payload || hmac-sha256(payload))`, `payload = "<user_id>:<unix timestamp>"`.
    pub fn issue(&self, user_id: Uuid) -> Result<String> {
        let payload = format!("{}:{}", user_id, Utc::now().timestamp());
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| SyncError::ConfigError(format!("invalid state-signing secret: {e}")))?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        let mut combined = payload.into_bytes();
        combined.extend_from_slice(&signature);
        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    /// Validates the token's signature, freshness, and that it was issued for `user_id`.
    /// Per spec §6: "`state` must validate against the user; otherwise HTTP 400" — callers
    /// should map any `Err` here straight to a 400 response.
    pub fn validate(&self, token: &str, user_id: Uuid) -> Result<()> {
        let decoded = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| SyncError::BadRequest("malformed state token".to_string()))?;
        if decoded.len() <= HMAC_LEN {
            return Err(SyncError::BadRequest("state token too short".to_string()));
        }

        let (payload_bytes, signature) = decoded.split_at(decoded.len() - HMAC_LEN);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| SyncError::ConfigError(format!("invalid state-signing secret: {e}")))?;
        mac.update(payload_bytes);
        mac.verify_slice(signature)
            .map_err(|_| SyncError::BadRequest("state token signature invalid".to_string()))?;

        let payload = std::str::from_utf8(payload_bytes)
            .map_err(|_| SyncError::BadRequest("state token payload not utf-8".to_string()))?;
        let mut parts = payload.splitn(2, ':');
        let token_user_id = parts
            .next()
            .ok_or_else(|| SyncError::BadRequest("state token missing user id".to_string()))?;
        let issued_at = parts
            .next()
            .ok_or_else(|| SyncError::BadRequest("state token missing timestamp".to_string()))?
            .parse::<i64>()
            .map_err(|_| SyncError::BadRequest("state token timestamp not a number".to_string()))?;

        if token_user_id != user_id.to_string() {
            return Err(SyncError::BadRequest("state token was not issued for this user".to_string()));
        }

        let issued_at: DateTime<Utc> = DateTime::from_timestamp(issued_at, 0)
            .ok_or_else(|| SyncError::BadRequest("state token timestamp out of range".to_string()))?;
        if Utc::now() > issued_at + Duration::minutes(STATE_VALIDITY_MINUTES) {
            return Err(SyncError::BadRequest("state token expired".to_string()));
        }

        Ok(())
    }
}

/// Where *Setup* sends the browser: Google's consent screen, with `approval_prompt=force` so
/// a re-auth always re-issues a refresh token, and the offline-access Gmail scope.
pub fn build_consent_url(settings: &Settings, state: &str) -> String {
    format!(
        "https://accounts.google.com/o/oauth2/auth?client_id={client_id}&redirect_uri={redirect_uri}&response_type=code&access_type=offline&approval_prompt=force&scope={scope}&state={state}",
        client_id = urlencode(&settings.oauth.client_id),
        redirect_uri = urlencode(&settings.oauth.callback_url),
        scope = urlencode(GMAIL_SCOPE),
        state = urlencode(state),
    )
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Result of a successful *Callback* exchange: where to redirect the browser next.
pub struct CallbackOutcome {
    pub account_id: Uuid,
    pub redirect_to: String,
}

/// Exchanges an authorization `code` for credentials, resolves the Account by the address
/// `get_profile` reports, and marks it authorized. Spec §6: "create (or reuse) the Account
/// row, persist credentials, mark authorized, and redirect to either the configured
/// post-auth URL or the mailbox listing."
pub struct ExternalInterfaces {
    settings: Settings,
    repository: Arc<dyn Repository>,
    credentials: Arc<dyn CredentialStore>,
    signer: StateTokenSigner,
}

impl ExternalInterfaces {
    pub fn new(
        settings: Settings,
        repository: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialStore>,
        state_secret: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            repository,
            credentials,
            signer: StateTokenSigner::new(state_secret),
        }
    }

    /// *Setup*: mint the state token and the consent URL to redirect to.
    pub fn setup(&self, user_id: Uuid) -> Result<String> {
        let state = self.signer.issue(user_id)?;
        Ok(build_consent_url(&self.settings, &state))
    }

    /// *Callback*: validate `state` against `user_id`, exchange `code`, and provision the
    /// Account row. On an invalid state the caller should answer the host's HTTP request
    /// with 400 without attempting the exchange.
    pub async fn callback(&self, user_id: Uuid, state: &str, code: &str) -> Result<CallbackOutcome> {
        self.signer.validate(state, user_id)?;

        let (access_token, refresh_token, expires_in) = self.exchange_code(code).await?;
        let hub = build_hub_with_access_token(access_token.clone()).await?;
        let (_, profile) = crate::error::resolve_gmail_call(
            hub.users()
                .get_profile("me")
                .add_scope("https://www.googleapis.com/auth/gmail.modify")
                .doit(),
        )
        .await?;
        let email_address = profile
            .email_address
            .ok_or_else(|| SyncError::ConnectorError("profile response had no email address".to_string()))?;

        let mut account = match self.repository.get_account_by_email(&email_address).await? {
            Some(existing) => existing,
            None => Account::new(&email_address, user_id),
        };
        account.is_authorized = true;
        account.deleted = false;
        self.repository.save_account(account.clone()).await?;

        self.credentials
            .store(Credentials {
                account_id: account.id,
                access_token,
                refresh_token,
                token_expiry: Utc::now() + Duration::seconds(expires_in),
                scopes: vec![GMAIL_SCOPE.to_string()],
            })
            .await?;

        Ok(CallbackOutcome {
            account_id: account.id,
            redirect_to: self.settings.oauth.redirect_url.clone(),
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<(String, String, i64)> {
        use http_body_util::BodyExt;

        let body = format!(
            "client_id={}&client_secret={}&code={}&redirect_uri={}&grant_type=authorization_code",
            urlencode(&self.settings.oauth.client_id),
            urlencode(&self.settings.oauth.client_secret),
            urlencode(code),
            urlencode(&self.settings.oauth.callback_url),
        );

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| SyncError::ConnectorError(format!("failed to load TLS roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .build();
        let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

        let request = hyper::Request::builder()
            .method("POST")
            .uri("https://oauth2.googleapis.com/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(http_body_util::Full::new(bytes::Bytes::from(body)))
            .map_err(|e| SyncError::ConnectorError(format!("failed to build token exchange request: {e}")))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| SyncError::NetworkError(format!("token exchange request failed: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::NetworkError(format!("failed to read token exchange response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(SyncError::BadRequest(format!("token exchange failed with status {status}")));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: i64,
        }
        let parsed: TokenResponse = serde_json::from_slice(&bytes)?;
        Ok((parsed.access_token, parsed.refresh_token, parsed.expires_in))
    }
}
