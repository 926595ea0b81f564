//! Token-level re-tagging of upstream content and history ordering.
//!
//! Upstreams emit category markers in-band as single opaque tokens, each
//! followed by a blank-line separator. `DelimiterState` tracks the current
//! category one token at a time so content is never held back.

use crate::model::{ChatMessage, ContentCategory, RefineContent};

pub const THINK_START: &str = "<think>";
pub const THINK_END: &str = "</think>";
pub const SUGGEST_START: &str = "<suggest>";
pub const SUGGEST_END: &str = "</suggest>";
/// Separator the upstream inserts right after a marker.
pub const BLANK_LINE: &str = "\n\n";

/// Empty think block some models prepend to non-streamed answers.
pub const EMPTY_THINK_BLOCK: &str = "<think>\n\n</think>\n\n";

/// One content token after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: ContentCategory,
    pub content: RefineContent,
    pub raw: String,
}

/// Per-stream marker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelimiterState {
    category: ContentCategory,
    skip_next_blank: bool,
}

impl DelimiterState {
    pub fn category(&self) -> ContentCategory {
        self.category
    }

    pub fn skip_next_blank(&self) -> bool {
        self.skip_next_blank
    }

    /// Advance by one token. Markers and the blank line following them are
    /// consumed; anything else comes back tagged with the current category.
    ///
    /// The blank-line skip stays armed until a blank token actually arrives.
    pub fn feed(&mut self, token: String) -> Option<Classified> {
        let next = match token.as_str() {
            THINK_START => Some(ContentCategory::Think),
            SUGGEST_START => Some(ContentCategory::Suggest),
            THINK_END | SUGGEST_END => Some(ContentCategory::Text),
            _ => None,
        };
        if let Some(category) = next {
            self.category = category;
            self.skip_next_blank = true;
            return None;
        }
        if self.skip_next_blank && token == BLANK_LINE {
            self.skip_next_blank = false;
            return None;
        }
        Some(Classified {
            category: self.category,
            content: RefineContent::tagged(self.category, &token),
            raw: token,
        })
    }
}

/// Storage hands history newest-first; upstreams want it oldest-first.
pub fn chronological(mut history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    history.reverse();
    history
}

/// Drop the per-message `name`, which the bot platform rejects.
pub fn strip_names(history: &mut [ChatMessage]) {
    for msg in history {
        msg.name = None;
    }
}

/// Remove empty think blocks from a single-shot answer.
pub fn strip_empty_think(text: &str) -> String {
    text.replace(EMPTY_THINK_BLOCK, "")
}
