use thiserror::Error;

/// Core error type for chatrelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("model not registered: {model}")]
    ModelNotRegistered { model: String },

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("not implemented: {0}")]
    Unimplemented(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("envelope encoding failed: {0}")]
    Encode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable short label for telemetry (`error.kind`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ModelNotRegistered { .. } => "model_not_registered",
            Self::Unauthenticated => "unauthenticated",
            Self::Unimplemented(_) => "unimplemented",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::Encode(_) => "encode",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_model_name() {
        let err = RelayError::ModelNotRegistered {
            model: "deyu-unknown".into(),
        };
        assert_eq!(err.to_string(), "model not registered: deyu-unknown");
        assert_eq!(err.kind(), "model_not_registered");
    }

    #[test]
    fn anyhow_converts_to_other() {
        let err: RelayError = anyhow::anyhow!("history backend down").into();
        assert_eq!(err.kind(), "other");
        assert_eq!(err.to_string(), "history backend down");
    }
}
