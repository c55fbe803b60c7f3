// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates session timing, reply buffering, and statically configured channels
use crate::channel::ChannelConfig;
use crate::paths;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ussd: UssdConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required on the outbound send route when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// Custom Debug impl to redact api_key
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

/// What to do when the backend rejects an inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestFailurePolicy {
    /// Log the failure and keep waiting for a reply.
    #[default]
    Wait,
    /// Answer the provider with an error immediately.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UssdConfig {
    /// How long an abandoned session may linger before it is swept
    #[serde(default = "default_session_idle_ttl_secs")]
    pub session_idle_ttl_secs: u64,
    /// Per-request wait when the channel sets no `time_out`
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
    /// Replies buffered per session before further ones are dropped
    #[serde(default = "default_reply_buffer")]
    pub reply_buffer: usize,
    /// Background sweep interval; 0 leaves only the per-request sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub ingest_failure: IngestFailurePolicy,
}

impl Default for UssdConfig {
    fn default() -> Self {
        Self {
            session_idle_ttl_secs: default_session_idle_ttl_secs(),
            default_wait_timeout_secs: default_wait_timeout_secs(),
            reply_buffer: default_reply_buffer(),
            sweep_interval_secs: default_sweep_interval_secs(),
            ingest_failure: IngestFailurePolicy::default(),
        }
    }
}

impl UssdConfig {
    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_session_idle_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_wait_timeout_secs() -> u64 {
    30
}

fn default_reply_buffer() -> usize {
    100
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_database_path() -> String {
    paths::database_file().to_string_lossy().to_string()
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. USSDGATE_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/ussdgate/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("USSDGATE_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the first config file found, with environment
    /// variable overrides applied on top
    pub fn load() -> Result<Self> {
        let config = match Self::find_config_file() {
            Some(path) => Self::read_file(&path)?,
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };
        config.finish()
    }

    /// Load configuration from an explicit path, with environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::read_file(path)?.finish()
    }

    /// Parse and validate TOML content without consulting the environment
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides()?;
        self.validate()?;
        Ok(self)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("USSDGATE_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("USSDGATE_PORT") {
            self.server.port = val.parse().with_context(|| {
                format!("USSDGATE_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("USSDGATE_API_KEY") {
            self.server.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("USSDGATE_DB_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = std::env::var("USSDGATE_WAIT_TIMEOUT_SECS") {
            self.ussd.default_wait_timeout_secs = val.parse().with_context(|| {
                format!("USSDGATE_WAIT_TIMEOUT_SECS must be a valid number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("USSDGATE_SESSION_TTL_SECS") {
            self.ussd.session_idle_ttl_secs = val.parse().with_context(|| {
                format!("USSDGATE_SESSION_TTL_SECS must be a valid number, got: {}", val)
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.database.path = expand_tilde(&self.database.path);

        if self.ussd.session_idle_ttl_secs == 0 {
            bail!("ussd.session_idle_ttl_secs must be greater than zero");
        }
        if self.ussd.default_wait_timeout_secs == 0 {
            bail!("ussd.default_wait_timeout_secs must be greater than zero");
        }
        if self.ussd.reply_buffer == 0 {
            bail!("ussd.reply_buffer must be at least 1");
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.uuid) {
                bail!("Duplicate channel uuid in config: {}", channel.uuid);
            }
        }
        Ok(())
    }
}
