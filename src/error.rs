use std::time::SystemTime;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GmailError>;

/// Everything a call through the resilience layer can fail with
///
/// Only the four rate-limit, server and network variants are worth another
/// attempt; see [`GmailError::is_transient`].
#[derive(Error, Debug)]
pub enum GmailError {
    /// Non-success answer that none of the narrower variants describe
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// 401, or no usable token for the account
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// 429 carrying a wait hint in seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// 429 with no usable hint
    #[error("Rate limit error: {0}")]
    RateLimitError(String),

    /// Connection reset, DNS, TLS or per-call timeout
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// 404 for a message, thread or label id
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// A message payload that could not be decoded or encoded
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// The remote answered an operation with the wrong kind of payload
    #[error("Unexpected response for {operation}: got {got}")]
    UnexpectedResponse { operation: String, got: String },

    #[error("Label error: {0}")]
    LabelError(String),

    /// Request cost is larger than the whole window budget
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid quota units: {0}")]
    InvalidQuotaUnits(i64),

    /// Backing store failure; the cache logs these and reports a miss
    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl GmailError {
    /// Whether another attempt of the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GmailError::RateLimitExceeded { .. }
                | GmailError::RateLimitError(_)
                | GmailError::ServerError { .. }
                | GmailError::NetworkError(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

#[cfg(feature = "cache")]
impl From<rusqlite::Error> for GmailError {
    fn from(error: rusqlite::Error) -> Self {
        GmailError::CacheError(error.to_string())
    }
}

/// Wait used when a 429 has no readable Retry-After
const FALLBACK_RETRY_AFTER_SECS: u64 = 5;

/// Seconds to wait according to a Retry-After value, either delay-seconds
/// or an HTTP-date. Dates already in the past yield `None`.
fn retry_after_secs(value: &str, now: SystemTime) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(now).ok().map(|wait| wait.as_secs())
}

fn rate_limit_hint<B>(response: &hyper::Response<B>) -> u64 {
    response
        .headers()
        .get(hyper::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| retry_after_secs(value, SystemTime::now()))
        .unwrap_or(FALLBACK_RETRY_AFTER_SECS)
}

fn error_for_status(status_code: u16, message: String) -> GmailError {
    match status_code {
        400 => GmailError::BadRequest(message),
        401 => GmailError::AuthError(message),
        403 => GmailError::Forbidden(message),
        404 => GmailError::MessageNotFound("Resource not found".to_string()),
        429 => GmailError::RateLimitError(message),
        500..=599 => GmailError::ServerError {
            status: status_code,
            message,
        },
        _ => GmailError::ApiError(message),
    }
}

/// Reasons Gmail attaches to a 403 that is really a throttle
const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

/// Classify a JSON error body of the form
/// `{"error": {"code": 503, "message": "...", "errors": [{"reason": "..."}]}}`
///
/// The client hands back every non-success answer whose body parses as JSON
/// this way, so the status lives in the body rather than the response.
fn error_from_body(detail: &serde_json::Value) -> GmailError {
    let error = &detail["error"];
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| detail.to_string());
    let reason = error["errors"][0]["reason"].as_str().unwrap_or_default();

    let Some(code) = error["code"].as_u64().and_then(|code| u16::try_from(code).ok()) else {
        return GmailError::BadRequest(message);
    };
    if code == 403 && RATE_LIMIT_REASONS.contains(&reason) {
        return GmailError::RateLimitError(format!("HTTP 403 {}: {}", reason, message));
    }
    error_for_status(code, format!("HTTP {}: {}", code, message))
}

impl From<google_gmail1::Error> for GmailError {
    fn from(error: google_gmail1::Error) -> Self {
        use google_gmail1::Error as Upstream;

        match error {
            Upstream::Failure(ref response) => {
                let status = response.status();
                if status.as_u16() == 429 {
                    return GmailError::RateLimitExceeded {
                        retry_after: rate_limit_hint(response),
                    };
                }
                let reason = status.canonical_reason().unwrap_or("Unknown");
                error_for_status(status.as_u16(), format!("HTTP {}: {}", status.as_u16(), reason))
            }
            Upstream::BadRequest(ref detail) => error_from_body(detail),
            Upstream::MissingToken(ref err) => GmailError::AuthError(format!("Missing token: {}", err)),
            Upstream::HttpError(ref err) => GmailError::NetworkError(format!("Connection error: {}", err)),
            Upstream::Io(err) => GmailError::NetworkError(err.to_string()),
            other => GmailError::ApiError(other.to_string()),
        }
    }
}
