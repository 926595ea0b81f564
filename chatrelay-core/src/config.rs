use std::collections::BTreeMap;
use std::{fs, path::Path};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};

/// Which upstream protocol a logical model speaks.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// OpenAI-compatible chat-completion API.
    Direct,
    /// Bot platform with its own chat event protocol.
    Bot,
}

fn default_disable_thinking() -> bool {
    true
}

/// Per logical model upstream settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ModelCfg {
    pub kind: ModelKind,
    /// Upstream model identifier (direct models only).
    #[serde(default)]
    pub name: Option<String>,
    pub base_url: String,
    /// Inline API key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of the environment variable that contains the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Platform bot identifier (bot models only).
    #[serde(default)]
    pub bot_id: Option<String>,
    /// Ask the upstream not to run its own thinking mode.
    #[serde(default = "default_disable_thinking")]
    pub disable_thinking: bool,
}

impl ModelCfg {
    /// Resolve the API key, inline first, then from the environment.
    pub fn resolve_api_key(&self, model: &str) -> CoreResult<SecretString> {
        if let Some(key) = &self.api_key {
            return Ok(SecretString::from(key.clone()));
        }
        if let Some(var) = &self.api_key_env
            && let Ok(key) = std::env::var(var)
        {
            return Ok(SecretString::from(key));
        }
        Err(RelayError::Validation(format!("no api key available for model '{model}'")))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds for single-shot calls (default 60000ms).
    /// Streaming calls are not bounded by it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Longest silence tolerated between reads on a streaming call
    /// (default 120000ms). `None` waits indefinitely.
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_stream_idle_timeout_ms() -> Option<u64> {
    Some(120_000)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Bounded pipe size between a bridge and its consumer.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            pipe_capacity: default_pipe_capacity(),
        }
    }
}

fn default_pipe_capacity() -> usize {
    crate::bridge::DEFAULT_PIPE_CAPACITY
}

fn default_brief_model() -> String {
    "deyu-default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// Logical model name -> upstream settings.
    #[serde(default)]
    pub models: BTreeMap<String, ModelCfg>,
    /// Model used for conversation title generation.
    #[serde(default = "default_brief_model")]
    pub brief_model: String,
    #[serde(default)]
    pub stream: StreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            brief_model: default_brief_model(),
            stream: StreamCfg::default(),
            http: HttpCfg::default(),
        }
    }
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    /// Reject settings no model could be built from.
    pub fn validate(&self) -> CoreResult<()> {
        if self.stream.pipe_capacity == 0 {
            return Err(RelayError::Validation("stream.pipe_capacity must be at least 1".into()));
        }
        for (name, m) in &self.models {
            if m.base_url.trim().is_empty() {
                return Err(RelayError::Validation(format!("model '{name}' has an empty base_url")));
            }
            match m.kind {
                ModelKind::Direct if m.name.as_deref().is_none_or(str::is_empty) => {
                    return Err(RelayError::Validation(format!(
                        "direct model '{name}' needs an upstream model name"
                    )));
                }
                ModelKind::Bot if m.bot_id.as_deref().is_none_or(str::is_empty) => {
                    return Err(RelayError::Validation(format!("bot model '{name}' needs a bot_id")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
