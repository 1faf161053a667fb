//! OAuth2 authentication management for Gmail API.
//!
//! Two authentication paths exist side by side, the way the source system splits desktop
//! setup from server-managed accounts: `initialize_gmail_hub` drives the interactive
//! installed-app flow used by the `init-config` CLI command to mint a first credential, and
//! `hub_for_account` builds a Gmail client straight from a stored [`crate::models::Credentials`]
//! row, refreshing it through [`CredentialStore`] when it has expired. Manager and the task
//! handlers only ever go through the latter.

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use hyper_util::client::legacy::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use yup_oauth2::ApplicationSecret;

use crate::error::{Result, SyncError};
use crate::models::Credentials as StoredCredentials;
use crate::store::Repository;

/// Gmail API scopes required for full automation functionality.
///
/// - gmail.modify: read/write access (no permanent deletion)
/// - gmail.labels: label management
/// - gmail.settings.basic: filter creation
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
    "https://www.googleapis.com/auth/gmail.settings.basic",
];

/// Read-only scope for safe operations.
pub const READONLY_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

/// Type alias for the Gmail Hub, to simplify type signatures.
pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

fn https_client(
) -> Result<Client<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>, http_body_util::Full<bytes::Bytes>>>
{
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| SyncError::ConnectorError(format!("failed to load TLS roots: {}", e)))?
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector))
}

/// Initialize a Gmail API hub via the interactive installed-app OAuth2 flow. Used only by the
/// `init-config` CLI command to mint the very first credential for an owner; every later sync
/// goes through [`hub_for_account`] instead.
pub async fn initialize_gmail_hub(credentials_path: &Path, token_cache_path: &Path) -> Result<GmailHub> {
    let secret = yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| SyncError::ConfigError(format!("failed to read credentials: {}", e)))?;

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| SyncError::ConnectorError(format!("failed to build authenticator: {}", e)))?;

    let _token = auth
        .token(REQUIRED_SCOPES)
        .await
        .map_err(|e| SyncError::ConnectorError(format!("failed to obtain token: {}", e)))?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| SyncError::ConnectorError(format!("failed to load TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build(),
    );

    Ok(Gmail::new(client, auth))
}

/// Build a Gmail hub directly from a bare access token, skipping the installed-app dance.
/// Used once [`hub_for_account`] has a fresh, unexpired access token in hand.
pub async fn build_hub_with_access_token(access_token: String) -> Result<GmailHub> {
    let auth = yup_oauth2::AccessTokenAuthenticator::builder(access_token)
        .build()
        .await
        .map_err(|e| SyncError::ConnectorError(format!("failed to build access-token authenticator: {}", e)))?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| SyncError::ConnectorError(format!("failed to load TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build(),
    );

    Ok(Gmail::new(client, auth))
}

/// Exchange a refresh token for a fresh access token via Google's token endpoint.
async fn refresh_access_token(
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<(String, i64)> {
    let body = format!(
        "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
        urlencode(client_id),
        urlencode(client_secret),
        urlencode(refresh_token),
    );

    let client = https_client()?;
    let request = hyper::Request::builder()
        .method("POST")
        .uri("https://oauth2.googleapis.com/token")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(http_body_util::Full::new(bytes::Bytes::from(body)))
        .map_err(|e| SyncError::ConnectorError(format!("failed to build refresh request: {}", e)))?;

    let response = client
        .request(request)
        .await
        .map_err(|e| SyncError::NetworkError(format!("token refresh request failed: {}", e)))?;

    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .map_err(|e| SyncError::NetworkError(format!("failed to read refresh response: {}", e)))?
        .to_bytes();

    if !status.is_success() {
        return Err(SyncError::InvalidCredentials {
            account: String::new(),
            reason: format!("token refresh failed with status {}", status),
        });
    }

    #[derive(Deserialize)]
    struct RefreshResponse {
        access_token: String,
        expires_in: i64,
    }

    let parsed: RefreshResponse = serde_json::from_slice(&bytes)?;
    Ok((parsed.access_token, parsed.expires_in))
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

/// Abstraction over where OAuth2 credentials live, so Manager doesn't reach into the
/// repository directly for a concern that is really auth's.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, account_id: Uuid) -> Result<StoredCredentials>;
    async fn store(&self, credentials: StoredCredentials) -> Result<()>;
}

/// `CredentialStore` backed by a [`Repository`].
pub struct RepositoryCredentialStore {
    repository: Arc<dyn Repository>,
}

impl RepositoryCredentialStore {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl CredentialStore for RepositoryCredentialStore {
    async fn load(&self, account_id: Uuid) -> Result<StoredCredentials> {
        self.repository
            .get_credentials(account_id)
            .await?
            .ok_or_else(|| SyncError::InvalidCredentials {
                account: account_id.to_string(),
                reason: "no credentials on file".to_string(),
            })
    }

    async fn store(&self, credentials: StoredCredentials) -> Result<()> {
        self.repository.save_credentials(credentials).await
    }
}

/// Build a Gmail hub for `account_id`, refreshing the stored access token first if it has
/// expired. This is the path every account sync goes through.
pub async fn hub_for_account(
    store: &dyn CredentialStore,
    client_id: &str,
    client_secret: &str,
    account_id: Uuid,
) -> Result<GmailHub> {
    let mut credentials = store.load(account_id).await?;

    if credentials.is_expired() {
        let (access_token, expires_in) =
            refresh_access_token(client_id, client_secret, &credentials.refresh_token).await?;
        credentials.access_token = access_token;
        credentials.token_expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in);
        store.store(credentials.clone()).await?;
    }

    build_hub_with_access_token(credentials.access_token).await
}

/// Credential structure matching Google's OAuth2 client-secret JSON format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientSecretFile {
    pub installed: InstalledApp,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    pub project_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub client_secret: String,
    pub redirect_uris: Vec<String>,
}

pub async fn load_client_secret_file(path: &Path) -> Result<ClientSecretFile> {
    let content = tokio::fs::read_to_string(path).await?;
    let creds = serde_json::from_str(&content)?;
    Ok(creds)
}

pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("CLIENT_ID").map_err(|_| SyncError::ConfigError("CLIENT_ID not set".to_string()))?;
    let client_secret =
        env::var("CLIENT_SECRET").map_err(|_| SyncError::ConfigError("CLIENT_SECRET not set".to_string()))?;
    let redirect_uri = env::var("CALLBACK_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Set file permissions to 0600 on Unix so OAuth2 token caches aren't world-readable.
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRepository;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_load_client_secret_file() {
        let credentials_json = r#"{
            "installed": {
                "client_id": "test-client-id",
                "project_id": "test-project",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "client_secret": "test-secret",
                "redirect_uris": ["http://localhost:8080"]
            }
        }"#;

        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), credentials_json).await.unwrap();

        let creds = load_client_secret_file(temp_file.path()).await.unwrap();
        assert_eq!(creds.installed.client_id, "test-client-id");
        assert_eq!(creds.installed.client_secret, "test-secret");
    }

    #[test]
    fn test_load_credentials_from_env() {
        env::set_var("CLIENT_ID", "test-id");
        env::set_var("CLIENT_SECRET", "test-secret");
        env::set_var("CALLBACK_URL", "http://localhost:9999");

        let secret = load_credentials_from_env().unwrap();
        assert_eq!(secret.client_id, "test-id");
        assert_eq!(secret.redirect_uris[0], "http://localhost:9999");

        env::remove_var("CLIENT_ID");
        env::remove_var("CLIENT_SECRET");
        env::remove_var("CALLBACK_URL");
    }

    #[test]
    fn test_scopes_constants() {
        assert_eq!(REQUIRED_SCOPES.len(), 3);
        assert!(REQUIRED_SCOPES.contains(&"https://www.googleapis.com/auth/gmail.modify"));
        assert_eq!(READONLY_SCOPES.len(), 1);
    }

    #[tokio::test]
    async fn credential_store_round_trips_through_repository() {
        let repo = Arc::new(InMemoryRepository::new());
        let account_id = Uuid::new_v4();
        let store = RepositoryCredentialStore::new(repo.clone());

        let creds = StoredCredentials {
            account_id,
            access_token: "tok".to_string(),
            refresh_token: "refresh".to_string(),
            token_expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            scopes: REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect(),
        };
        store.store(creds.clone()).await.unwrap();

        let loaded = store.load(account_id).await.unwrap();
        assert_eq!(loaded.access_token, "tok");
    }

    #[tokio::test]
    async fn credential_store_errors_when_missing() {
        let repo = Arc::new(InMemoryRepository::new());
        let store = RepositoryCredentialStore::new(repo);
        let result = store.load(Uuid::new_v4()).await;
        assert!(result.is_err());
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(urlencode("abc123-_.~"), "abc123-_.~");
    }
}
