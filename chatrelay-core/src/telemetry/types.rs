use serde::{Deserialize, Serialize};

/// Canonical, provider-agnostic payload for one single-shot model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderTrace {
    /// Provider identifier, e.g. "openai", "coze".
    pub provider: Option<String>,

    /// Logical model name, e.g. "deyu-default".
    pub model: Option<String>,

    /// User identity the call was made on behalf of.
    pub user_id: Option<String>,

    /// Provider's returned request id/correlation id.
    pub provider_request_id: Option<String>,

    pub latency_ms: Option<u128>,

    /// Finish reason as reported by the upstream (e.g. "stop", "length").
    pub finish_reason: Option<String>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl ProviderTrace {
    pub fn with_provider_model(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            model: Some(model.into()),
            ..Default::default()
        }
    }

    pub fn user_id(mut self, uid: &str) -> Self {
        self.user_id = Some(uid.to_string());
        self
    }

    pub fn provider_request_id_opt<S: AsRef<str>>(mut self, prid: Option<S>) -> Self {
        self.provider_request_id = prid.map(|s| s.as_ref().to_string());
        self
    }

    pub fn latency_ms(mut self, ms: u128) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn finish_reason_opt(mut self, reason: Option<&str>) -> Self {
        self.finish_reason = reason.map(|s| s.to_string());
        self
    }

    pub fn error(mut self, err: &crate::error::RelayError) -> Self {
        self.error_kind = Some(err.kind().to_string());
        self.error_message = Some(err.to_string());
        self
    }
}

/// How a stream bridge exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Upstream ended; `Stop` delivered.
    Completed,
    /// Upstream failed; `Error` delivered.
    Failed,
    /// Caller cancelled.
    Cancelled,
    /// Consumer dropped the event source.
    ConsumerGone,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::ConsumerGone => "consumer_gone",
        }
    }
}

/// Structured summary emitted once per stream when its bridge exits.
#[derive(Debug, Clone, Serialize)]
pub struct StreamLog {
    pub provider: String,
    pub model: String,
    pub user_id: Option<String>,
    /// Content events delivered to the consumer.
    pub events: u64,
    /// Tokens dropped because their envelope failed to encode.
    pub dropped: u64,
    pub outcome: StreamOutcome,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: u64,
}
