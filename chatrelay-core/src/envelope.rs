use crate::error::{CoreResult, RelayError};
use crate::model::RefineContent;

/// Serializes a `RefineContent` into the payload string the client receives.
pub trait EnvelopeEncoder: Send + Sync + 'static {
    fn encode(&self, content: &RefineContent) -> CoreResult<String>;
}

/// Default encoder: compact JSON with all three fields present.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelope;

impl EnvelopeEncoder for JsonEnvelope {
    fn encode(&self, content: &RefineContent) -> CoreResult<String> {
        serde_json::to_string(content).map_err(|e| RelayError::Encode(e.to_string()))
    }
}
