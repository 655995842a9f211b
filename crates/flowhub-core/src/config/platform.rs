//! Per-platform adapter configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_RESET_MS: u64 = 60_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_POLL_PAGE_SIZE: u32 = 20;

/// Supported automation platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformType {
    N8n,
    Make,
    Zapier,
}

impl PlatformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::N8n => "n8n",
            PlatformType::Make => "make",
            PlatformType::Zapier => "zapier",
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "n8n" => Ok(PlatformType::N8n),
            "make" | "make.com" => Ok(PlatformType::Make),
            "zapier" => Ok(PlatformType::Zapier),
            other => Err(Error::Configuration(format!(
                "Unknown platform type '{}'. Valid options: n8n, make, zapier",
                other
            ))),
        }
    }
}

/// Credentials an adapter presents to its platform.
///
/// Exactly one variant is active; build from loose fields with
/// [`Credentials::from_fields`].
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Static API token
    ApiToken { api_token: String },
    /// API token scoped to a team (Make.com)
    TeamToken { api_token: String, team_id: String },
    /// OAuth client with optional pre-issued tokens
    OAuth {
        client_id: String,
        client_secret: String,
        access_token: Option<String>,
        refresh_token: Option<String>,
    },
    /// Email/password exchanged for a bearer token via `/login` (n8n)
    Login { email: String, password: String },
}

/// Loose credential fields as they arrive from configuration
#[derive(Debug, Clone, Default)]
pub struct CredentialFields {
    pub api_token: Option<String>,
    pub team_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl Credentials {
    /// Build credentials from loose fields, requiring exactly one variant.
    pub fn from_fields(fields: CredentialFields) -> Result<Self> {
        let has_token = present(&fields.api_token);
        let has_oauth = present(&fields.client_id) || present(&fields.client_secret);
        let has_login = present(&fields.email) || present(&fields.password);

        let variants = [has_token, has_oauth, has_login]
            .iter()
            .filter(|v| **v)
            .count();

        if variants == 0 {
            return Err(Error::Configuration(
                "No credentials provided; expected an API token, OAuth client, or login"
                    .to_string(),
            ));
        }
        if variants > 1 {
            return Err(Error::Configuration(
                "Ambiguous credentials; provide exactly one of API token, OAuth client, or login"
                    .to_string(),
            ));
        }

        let credentials = if has_token {
            let api_token = fields.api_token.unwrap_or_default();
            match fields.team_id.filter(|t| !t.trim().is_empty()) {
                Some(team_id) => Credentials::TeamToken { api_token, team_id },
                None => Credentials::ApiToken { api_token },
            }
        } else if has_oauth {
            Credentials::OAuth {
                client_id: fields.client_id.unwrap_or_default(),
                client_secret: fields.client_secret.unwrap_or_default(),
                access_token: fields.access_token.filter(|t| !t.is_empty()),
                refresh_token: fields.refresh_token.filter(|t| !t.is_empty()),
            }
        } else {
            Credentials::Login {
                email: fields.email.unwrap_or_default(),
                password: fields.password.unwrap_or_default(),
            }
        };

        credentials.validate()?;
        Ok(credentials)
    }

    /// Check that every required field of the active variant is non-empty
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(Error::Configuration(format!(
                "{} credentials require a non-empty '{}'",
                self.kind(),
                field
            )))
        };

        match self {
            Credentials::ApiToken { api_token } => {
                if api_token.trim().is_empty() {
                    return missing("api_token");
                }
            }
            Credentials::TeamToken { api_token, team_id } => {
                if api_token.trim().is_empty() {
                    return missing("api_token");
                }
                if team_id.trim().is_empty() {
                    return missing("team_id");
                }
            }
            Credentials::OAuth {
                client_id,
                client_secret,
                ..
            } => {
                if client_id.trim().is_empty() {
                    return missing("client_id");
                }
                if client_secret.trim().is_empty() {
                    return missing("client_secret");
                }
            }
            Credentials::Login { email, password } => {
                if email.trim().is_empty() {
                    return missing("email");
                }
                if password.is_empty() {
                    return missing("password");
                }
            }
        }
        Ok(())
    }

    /// Short name of the active variant
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::ApiToken { .. } => "api_token",
            Credentials::TeamToken { .. } => "team_token",
            Credentials::OAuth { .. } => "oauth",
            Credentials::Login { .. } => "login",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiToken { .. } => f
                .debug_struct("ApiToken")
                .field("api_token", &"***")
                .finish(),
            Credentials::TeamToken { team_id, .. } => f
                .debug_struct("TeamToken")
                .field("api_token", &"***")
                .field("team_id", team_id)
                .finish(),
            Credentials::OAuth {
                client_id,
                access_token,
                refresh_token,
                ..
            } => f
                .debug_struct("OAuth")
                .field("client_id", client_id)
                .field("client_secret", &"***")
                .field("access_token", &access_token.as_ref().map(|_| "***"))
                .field("refresh_token", &refresh_token.as_ref().map(|_| "***"))
                .finish(),
            Credentials::Login { email, .. } => f
                .debug_struct("Login")
                .field("email", email)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// Immutable configuration for one platform adapter
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub id: String,
    pub name: String,
    pub platform_type: PlatformType,
    pub base_url: String,
    pub credentials: Credentials,
    /// Per-call timeout
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub retry_attempts: u32,
    /// Consecutive failures before the breaker opens
    pub circuit_breaker_threshold: u32,
    /// Time an open breaker waits before allowing a probe
    pub circuit_breaker_reset: Duration,
    /// Event poller tick interval
    pub poll_interval: Duration,
    /// Executions fetched per poll
    pub poll_page_size: u32,
    /// OAuth token endpoint override
    pub oauth_token_url: Option<String>,
}

impl PlatformConfig {
    /// Create a config with default resilience and polling settings
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        platform_type: PlatformType,
        base_url: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            platform_type,
            base_url: base_url.into(),
            credentials,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            circuit_breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            circuit_breaker_reset: Duration::from_millis(DEFAULT_BREAKER_RESET_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_page_size: DEFAULT_POLL_PAGE_SIZE,
            oauth_token_url: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_circuit_breaker_reset(mut self, reset: Duration) -> Self {
        self.circuit_breaker_reset = reset;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_page_size(mut self, size: u32) -> Self {
        self.poll_page_size = size;
        self
    }

    pub fn with_oauth_token_url(mut self, url: impl Into<String>) -> Self {
        self.oauth_token_url = Some(url.into());
        self
    }

    /// Base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Validate every field; runs before any network access
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Configuration("Platform id must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "Platform '{}' must have a name",
                self.id
            )));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Configuration(format!(
                "Platform '{}' base URL must start with http:// or https://, got '{}'",
                self.id, self.base_url
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration(format!(
                "Platform '{}' timeout must be greater than zero",
                self.id
            )));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(Error::Configuration(format!(
                "Platform '{}' circuit breaker threshold must be at least 1",
                self.id
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Configuration(format!(
                "Platform '{}' poll interval must be greater than zero",
                self.id
            )));
        }
        if self.poll_page_size == 0 {
            return Err(Error::Configuration(format!(
                "Platform '{}' poll page size must be at least 1",
                self.id
            )));
        }
        self.credentials.validate()
    }
}
