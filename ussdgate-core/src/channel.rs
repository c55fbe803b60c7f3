// ABOUTME: Channel configuration for USSD channels and typed accessors for per-channel keys.
// ABOUTME: Covers start message injection, wait timeout, prefix stripping, and push URL.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Channel type code for USSD channels, used in route paths (`/c/us/...`).
pub const CHANNEL_TYPE: &str = "US";

pub const CONFIG_START_MSG: &str = "start_msg";
pub const CONFIG_TIME_OUT: &str = "time_out";
pub const CONFIG_STRIP_PREFIX: &str = "strip_prefix";
pub const CONFIG_PUSH_URL: &str = "push_url";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub uuid: Uuid,
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    #[serde(default)]
    pub name: String,
    /// ISO 3166 alpha-2 country used to normalise sender numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_channel_type() -> String {
    CHANNEL_TYPE.to_string()
}

impl ChannelConfig {
    pub fn new(uuid: Uuid, country: Option<&str>) -> Self {
        Self {
            uuid,
            channel_type: default_channel_type(),
            name: String::new(),
            country: country.map(str::to_string),
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn string_config(&self, key: &str, default: &str) -> String {
        match self.config.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// Integer config value; numeric strings are accepted since channel
    /// config is frequently edited by hand.
    pub fn int_config(&self, key: &str, default: i64) -> i64 {
        match self.config.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn bool_config(&self, key: &str, default: bool) -> bool {
        match self.config.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(default),
            _ => default,
        }
    }

    /// Opening prompt injected as the text of a new session, if configured.
    pub fn start_msg(&self) -> Option<String> {
        let msg = self.string_config(CONFIG_START_MSG, "");
        (!msg.is_empty()).then_some(msg)
    }

    /// Per-request wait timeout; non-positive values fall back to `default`.
    pub fn wait_timeout(&self, default: Duration) -> Duration {
        match self.int_config(CONFIG_TIME_OUT, 0) {
            secs if secs > 0 => Duration::from_secs(secs as u64),
            _ => default,
        }
    }

    pub fn strip_prefix(&self) -> bool {
        self.bool_config(CONFIG_STRIP_PREFIX, false)
    }

    pub fn push_url(&self) -> Option<String> {
        let url = self.string_config(CONFIG_PUSH_URL, "");
        (!url.is_empty()).then_some(url)
    }
}
