//! Error types for Flowhub

use thiserror::Error;

/// Result type alias using Flowhub's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Flowhub error types with helpful messages and suggestions
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors (E100-E199)
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Authentication errors (E200-E299)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    // Entity errors (E300-E399)
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Network errors (E400-E499)
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Rate limited by platform{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Circuit breaker '{0}' is open; call rejected")]
    CircuitOpen(String),

    // Payload errors (E500-E599)
    #[error("Failed to parse platform response: {0}")]
    Serialization(String),

    // Generic errors
    #[error("Unknown error: {0}")]
    Unknown(String),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(". Retry after {} seconds.", secs),
        None => String::new(),
    }
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "E100",
            Self::Authentication(_) => "E200",
            Self::NotFound { .. } => "E300",
            Self::InvalidRequest(_) => "E301",
            Self::TransientNetwork(_) => "E400",
            Self::RateLimited { .. } => "E401",
            Self::CircuitOpen(_) => "E402",
            Self::Serialization(_) => "E500",
            Self::Unknown(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Configuration(_) => Some("flowhub config show".to_string()),
            Self::Authentication(_) => {
                Some("Check the credential environment variables for this platform".to_string())
            }
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(format!("Wait {} seconds before retrying", secs)),
            Self::CircuitOpen(name) => Some(format!("flowhub health {}", name)),
            _ => None,
        }
    }

    /// Whether a retry policy may re-issue the call.
    ///
    /// Unknown errors are treated as transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Unknown(_))
    }

    /// Whether this error counts as a failure toward a circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::Unknown(_) | Self::RateLimited { .. }
        )
    }

    /// Classify a non-success HTTP status returned by a platform
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Authentication(format!("HTTP {}: {}", status, truncate(body))),
            404 => Self::not_found("Resource", truncate(body)),
            429 => Self::RateLimited {
                retry_after_secs: extract_retry_after(body),
            },
            400..=499 => Self::InvalidRequest(format!("HTTP {}: {}", status, truncate(body))),
            500..=599 => Self::TransientNetwork(format!("HTTP {}: {}", status, truncate(body))),
            _ => Self::Unknown(format!("HTTP {}: {}", status, truncate(body))),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TransientNetwork(format!("request timed out: {}", err))
        } else if err.is_connect() || err.is_request() {
            Self::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), &err.to_string())
        } else {
            Self::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Extract a retry-after hint from a rate-limit body
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("retryAfter"))
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}
