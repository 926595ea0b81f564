/// Span/Log attribute keys for model calls and streams.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_USER_ID: &str = "user.id";

pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_FINISH_REASON: &str = "finish.reason";

/// Stream bridge counters, recorded when the bridge exits.
pub const KEY_STREAM_EVENTS: &str = "stream.events";
pub const KEY_STREAM_DROPPED: &str = "stream.dropped";
pub const KEY_STREAM_OUTCOME: &str = "stream.outcome";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
