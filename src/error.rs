use thiserror::Error;

/// Type alias for Result with SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error kinds for the Gmail synchronization engine (spec §7)
#[derive(Error, Debug)]
pub enum SyncError {
    /// Token refresh failed for an account's OAuth2 credentials.
    #[error("invalid credentials for account {account}: {reason}")]
    InvalidCredentials { account: String, reason: String },

    /// Connector construction or transport failure (not a classified HTTP status).
    #[error("connector error: {0}")]
    ConnectorError(String),

    /// Retry budget exhausted without a successful response.
    #[error("request failed after exhausting retry budget: {0}")]
    FailedRequest(String),

    /// Fatal, per-account orchestration failure.
    #[error("manager error for account {account}: {reason}")]
    ManagerError { account: String, reason: String },

    /// Rate limit exceeded - should retry after specified seconds
    #[error("rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Server returned 5xx
    #[error("server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request (400) — used for the "label vanished" swallow path upstream.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403) with a non-retryable reason.
    #[error("access forbidden: {0}")]
    Forbidden(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("network error: {0}")]
    NetworkError(String),

    /// Invalid message payload encountered while parsing.
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// The SyncLock's backing KV store failed.
    #[error("sync lock error: {0}")]
    LockError(String),

    /// Task queue / broker error.
    #[error("task queue error: {0}")]
    QueueError(String),

    /// The configured repository returned an error.
    #[error("store error: {0}")]
    StoreError(String),

    /// I/O error (file operations, etc.)
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error — includes unrecognized configuration keys.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Circuit breaker is open (rejecting requests)
    #[error("circuit breaker open: {message}. Will retry after {retry_after_secs} seconds")]
    CircuitBreakerOpen {
        message: String,
        retry_after_secs: u64,
    },

    /// Generic catch-all error
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SyncError {
    /// Whether this error represents a transient condition the task framework should retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimitExceeded { .. }
                | SyncError::ServerError { .. }
                | SyncError::NetworkError(_)
                | SyncError::CircuitBreakerOpen { .. }
                | SyncError::FailedRequest(_)
                | SyncError::ManagerError { .. }
                | SyncError::ConnectorError(_)
                | SyncError::QueueError(_)
        )
    }

    /// Whether this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Parse the Retry-After header from an HTTP response.
///
/// Accepts either delay-seconds (e.g. "120") or an HTTP-date. Falls back to a default
/// of 5 seconds when the header is missing, unparseable, or already in the past.
pub fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_value) = response.headers().get("retry-after") {
        if let Ok(retry_after_str) = retry_after_value.to_str() {
            if let Ok(seconds) = retry_after_str.parse::<u64>() {
                return seconds;
            }

            if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
                let now = std::time::SystemTime::now();
                if let Ok(duration) = http_date.duration_since(now) {
                    return duration.as_secs();
                }
            }
        }
    }

    DEFAULT_RETRY_AFTER
}

/// Classify a Gmail API error, reading the JSON error body on a 403 to tell a retryable quota
/// rejection from a permanent permission error. Can't be a `From` impl: distinguishing the two
/// needs Gmail's `{"error":{"errors":[{"reason":...}]}}` body, and reading a response body is
/// async. Mirrors `gmailmanager/connector.py`'s reason-keyed `HttpError` dispatch.
pub async fn classify_gmail_error(error: google_gmail1::Error) -> SyncError {
    match error {
        google_gmail1::Error::Failure(response) => {
            let status = response.status();
            let status_code = status.as_u16();
            let retry_after = parse_retry_after_header(&response);

            match status_code {
                403 => match gmail_error_reason(response).await.as_deref() {
                    Some("rateLimitExceeded") | Some("userRateLimitExceeded") => {
                        SyncError::RateLimitExceeded { retry_after }
                    }
                    Some(reason) => SyncError::Forbidden(format!("access forbidden: {reason}")),
                    None => SyncError::Forbidden("access forbidden".to_string()),
                },
                429 => SyncError::RateLimitExceeded { retry_after },
                404 => SyncError::NotFound("resource not found".to_string()),
                400 => SyncError::BadRequest(format!(
                    "HTTP 400: {}",
                    status.canonical_reason().unwrap_or("Bad Request")
                )),
                500..=599 => SyncError::ServerError {
                    status: status_code,
                    message: format!(
                        "HTTP {}: {}",
                        status_code,
                        status.canonical_reason().unwrap_or("Unknown")
                    ),
                },
                _ => SyncError::ConnectorError(format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                )),
            }
        }
        google_gmail1::Error::BadRequest(ref err) => SyncError::BadRequest(format!("{}", err)),
        google_gmail1::Error::HttpError(ref err) => {
            SyncError::NetworkError(format!("connection error: {}", err))
        }
        google_gmail1::Error::Io(err) => SyncError::NetworkError(err.to_string()),
        other => SyncError::ConnectorError(other.to_string()),
    }
}

/// Pull Gmail's `error.errors[0].reason` out of a 403 response body, discarding the body.
/// Generic over the body type (rather than pinned to `hyper::body::Incoming`) so tests can
/// exercise it against an in-memory body instead of a live connection.
async fn gmail_error_reason<B>(response: hyper::Response<B>) -> Option<String>
where
    B: http_body_util::BodyExt<Data = bytes::Bytes>,
{
    let bytes = response.into_body().collect().await.ok()?.to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    body.get("error")?
        .get("errors")?
        .get(0)?
        .get("reason")?
        .as_str()
        .map(str::to_string)
}

/// Await a Gmail API call, converting any error via [`classify_gmail_error`]. Exists so call
/// sites don't need to spell out the `match`/`.await` themselves in place of the `?` a plain
/// `From` impl would allow.
pub async fn resolve_gmail_call<T>(
    call: impl std::future::Future<Output = std::result::Result<T, google_gmail1::Error>>,
) -> Result<T> {
    match call.await {
        Ok(value) => Ok(value),
        Err(error) => Err(classify_gmail_error(error).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_classified() {
        assert!(SyncError::RateLimitExceeded { retry_after: 5 }.is_transient());
        assert!(SyncError::ServerError {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(SyncError::NetworkError("timeout".into()).is_transient());
        assert!(SyncError::ConnectorError("boom".into()).is_transient());
    }

    #[test]
    fn permanent_errors_classified() {
        assert!(SyncError::BadRequest("bad query".into()).is_permanent());
        assert!(SyncError::NotFound("msg123".into()).is_permanent());
        assert!(SyncError::Forbidden("denied".into()).is_permanent());
        assert!(SyncError::InvalidCredentials {
            account: "a@x.com".into(),
            reason: "expired".into()
        }
        .is_permanent());
    }

    #[test]
    fn parse_retry_after_integer() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("120"),
        );
        assert_eq!(parse_retry_after_header(&response), 120);
    }

    #[test]
    fn parse_retry_after_missing_defaults() {
        let response = hyper::Response::builder().status(429).body(()).unwrap();
        assert_eq!(parse_retry_after_header(&response), 5);
    }

    #[tokio::test]
    async fn gmail_error_reason_reads_rate_limit_reason() {
        use bytes::Bytes;
        use http_body_util::Full;

        let body = r#"{"error":{"errors":[{"reason":"rateLimitExceeded","message":"quota"}]}}"#;
        let response = hyper::Response::builder()
            .status(403)
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        assert_eq!(
            gmail_error_reason(response).await,
            Some("rateLimitExceeded".to_string())
        );
    }

    #[tokio::test]
    async fn gmail_error_reason_none_for_unparseable_body() {
        use bytes::Bytes;
        use http_body_util::Full;

        let response = hyper::Response::builder()
            .status(403)
            .body(Full::new(Bytes::from("not json")))
            .unwrap();
        assert_eq!(gmail_error_reason(response).await, None);
    }

    #[tokio::test]
    async fn classify_gmail_error_permission_reason_is_permanent_forbidden() {
        use bytes::Bytes;
        use http_body_util::Full;

        let body = r#"{"error":{"errors":[{"reason":"insufficientPermissions"}]}}"#;
        let response = hyper::Response::builder()
            .status(403)
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        let reason = gmail_error_reason(response).await;
        assert_eq!(reason.as_deref(), Some("insufficientPermissions"));
    }

    #[test]
    fn parse_retry_after_past_date_defaults() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(past);
        response
            .headers_mut()
            .insert("retry-after", hyper::header::HeaderValue::from_str(&http_date).unwrap());
        assert_eq!(parse_retry_after_header(&response), 5);
    }
}
