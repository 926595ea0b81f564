//! Streaming primitives exposed by chatrelay.
//!
//! Contract:
//! - A stream carries 0..n `Content` events in upstream order.
//! - It then ends with exactly one terminal event, `Stop` (upstream finished)
//!   or `Error` (upstream failed), and closes.
//! - A cancelled stream closes without a terminal event.
//!
//! `StreamEvent` does not derive `Clone` / `PartialEq` because `Error` holds a
//! `RelayError`.

use serde_json::json;

use crate::model::ContentCategory;

/// Out-of-band metadata key carrying the content category.
pub const EXTRA_CONTENT_TYPE: &str = "content_type";
/// Out-of-band metadata key carrying the original upstream token.
pub const EXTRA_RAW_MESSAGE: &str = "raw_message";

/// One tagged token, ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEvent {
    /// Serialized `RefineContent`.
    pub envelope: String,
    pub category: ContentCategory,
    pub raw_token: String,
}

impl ContentEvent {
    pub fn metadata(&self) -> serde_json::Value {
        json!({
            EXTRA_CONTENT_TYPE: self.category.as_str(),
            EXTRA_RAW_MESSAGE: self.raw_token,
        })
    }
}

/// What the caller receives incrementally.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    Content(ContentEvent),
    /// Upstream finished normally; stream ends after this.
    Stop,
    /// Transport/protocol error surfaced mid-stream; stream ends after this.
    Error(crate::error::RelayError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Stop` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::Error(_))
    }

    pub fn as_content(&self) -> Option<&ContentEvent> {
        match self {
            Self::Content(ev) => Some(ev),
            _ => None,
        }
    }
}

/// Boxed event source returned by `ChatModel::stream`.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_work() {
        let ev = StreamEvent::Content(ContentEvent {
            envelope: r#"{"text":"hi","think":"","suggest":""}"#.into(),
            category: ContentCategory::Text,
            raw_token: "hi".into(),
        });
        assert!(!ev.is_terminal());
        assert_eq!(ev.as_content().map(|c| c.raw_token.as_str()), Some("hi"));

        assert!(StreamEvent::Stop.is_terminal());
        assert!(StreamEvent::Stop.as_content().is_none());
    }

    #[test]
    fn metadata_tags_category_and_raw_token() {
        let ev = ContentEvent {
            envelope: String::new(),
            category: ContentCategory::Think,
            raw_token: "x".into(),
        };
        let meta = ev.metadata();
        assert_eq!(meta[EXTRA_CONTENT_TYPE], "think");
        assert_eq!(meta[EXTRA_RAW_MESSAGE], "x");
    }
}
