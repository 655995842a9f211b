//! Configuration management with file persistence
//!
//! The config file lists every platform the adapters connect to. Secrets are
//! never stored in the file: credential entries name environment variables
//! that hold them.

mod platform;

pub use platform::{
    CredentialFields, Credentials, DEFAULT_BREAKER_RESET_MS, DEFAULT_BREAKER_THRESHOLD,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_PAGE_SIZE, DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT_MS,
    PlatformConfig, PlatformType,
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flowhub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub platforms: Vec<PlatformEntry>,
}

/// One `[[platforms]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub platform_type: PlatformType,
    pub base_url: String,
    pub credentials: CredentialEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_reset_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_url: Option<String>,
}

/// Credential references. Non-secret identifiers are stored inline, secrets by
/// environment variable name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    // Inline secrets are parsed only so validation can reject them.
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing)]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl CredentialEntry {
    /// Secrets must be provided via environment variables, not stored in configuration
    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        let inline = [
            ("api_token", &self.api_token),
            ("client_secret", &self.client_secret),
            ("access_token", &self.access_token),
            ("refresh_token", &self.refresh_token),
            ("password", &self.password),
        ];
        if let Some((field, _)) = inline.iter().find(|(_, v)| v.is_some()) {
            return Err(anyhow!(
                "'{}' must not be stored in configuration; set '{}_env' to the name of an environment variable instead",
                field,
                field
            ));
        }
        Ok(())
    }

    /// Resolve environment references into loose credential fields
    pub fn resolve_with<F>(&self, lookup: F) -> anyhow::Result<CredentialFields>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &Option<String>| -> anyhow::Result<Option<String>> {
            match var {
                Some(name) => lookup(name)
                    .map(Some)
                    .ok_or_else(|| anyhow!("Environment variable '{}' is not set", name)),
                None => Ok(None),
            }
        };

        Ok(CredentialFields {
            api_token: read(&self.api_token_env)?,
            team_id: self.team_id.clone(),
            client_id: self.client_id.clone(),
            client_secret: read(&self.client_secret_env)?,
            access_token: read(&self.access_token_env)?,
            refresh_token: read(&self.refresh_token_env)?,
            email: self.email.clone(),
            password: read(&self.password_env)?,
        })
    }
}

impl PlatformEntry {
    /// Build a validated `PlatformConfig`, reading secrets through `lookup`
    pub fn to_platform_config_with<F>(&self, lookup: F) -> anyhow::Result<PlatformConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.credentials.enforce_env_only()?;
        let fields = self
            .credentials
            .resolve_with(lookup)
            .with_context(|| format!("Failed to resolve credentials for platform '{}'", self.id))?;
        let credentials = Credentials::from_fields(fields)?;

        let mut config = PlatformConfig::new(
            &self.id,
            &self.name,
            self.platform_type,
            &self.base_url,
            credentials,
        );
        if let Some(ms) = self.timeout_ms {
            config = config.with_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.retry_attempts {
            config = config.with_retry_attempts(attempts);
        }
        if let Some(threshold) = self.circuit_breaker_threshold {
            config = config.with_circuit_breaker_threshold(threshold);
        }
        if let Some(ms) = self.circuit_breaker_reset_ms {
            config = config.with_circuit_breaker_reset(Duration::from_millis(ms));
        }
        if let Some(ms) = self.poll_interval_ms {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(size) = self.poll_page_size {
            config = config.with_poll_page_size(size);
        }
        if let Some(url) = &self.oauth_token_url {
            config = config.with_oauth_token_url(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Build a validated `PlatformConfig` from the process environment
    pub fn to_platform_config(&self) -> anyhow::Result<PlatformConfig> {
        self.to_platform_config_with(|name| env::var(name).ok())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("FLOWHUB_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("flowhub")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or an empty config if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.platforms {
            if !seen.insert(entry.id.as_str()) {
                return Err(anyhow!("Duplicate platform id '{}'", entry.id));
            }
            entry
                .credentials
                .enforce_env_only()
                .with_context(|| format!("Invalid credentials for platform '{}'", entry.id))?;
        }
        Ok(())
    }

    /// Find a platform entry by id
    pub fn entry(&self, id: &str) -> Option<&PlatformEntry> {
        self.platforms.iter().find(|p| p.id == id)
    }

    /// Resolve a platform entry into a validated `PlatformConfig`
    pub fn platform(&self, id: &str) -> anyhow::Result<PlatformConfig> {
        let entry = self.entry(id).ok_or_else(|| {
            anyhow!(
                "Unknown platform: {}. Use `flowhub platforms` to see configured platforms.",
                id
            )
        })?;
        entry.to_platform_config()
    }
}
