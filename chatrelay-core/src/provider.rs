use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;
use crate::model::{ChatMessage, ToolInfo};
use crate::providers::coze::CozeBot;
use crate::providers::openai::OpenAiChat;
use crate::stream::BoxStreamEv;

/// Capability set every upstream model exposes.
///
/// `history` is always supplied newest-first, as storage returns it;
/// implementations put it in chronological order before dispatch.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Logical model name this instance was built for.
    fn name(&self) -> &str;

    /// Single-shot completion. No delimiter processing is applied.
    async fn generate(&self, history: Vec<ChatMessage>) -> CoreResult<ChatMessage>;

    /// Open the upstream stream and return the normalized event source.
    /// Errors here are setup failures only; once a source is returned,
    /// upstream failures arrive as a terminal `StreamEvent::Error`.
    async fn stream(&self, history: Vec<ChatMessage>, cancel: CancellationToken) -> CoreResult<BoxStreamEv>;

    /// A tool-augmented variant of this model.
    fn with_tools(&self, tools: Vec<ToolInfo>) -> CoreResult<Arc<dyn ChatModel>>;
}

/// The two upstream protocols behind one capability interface.
#[derive(Debug, Clone)]
pub enum ModelClient {
    Direct(OpenAiChat),
    Bot(CozeBot),
}

impl ModelClient {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::Direct(_) => crate::providers::openai::PROVIDER,
            Self::Bot(_) => crate::providers::coze::PROVIDER,
        }
    }
}

#[async_trait]
impl ChatModel for ModelClient {
    fn name(&self) -> &str {
        match self {
            Self::Direct(m) => m.name(),
            Self::Bot(m) => m.name(),
        }
    }

    async fn generate(&self, history: Vec<ChatMessage>) -> CoreResult<ChatMessage> {
        match self {
            Self::Direct(m) => m.generate(history).await,
            Self::Bot(m) => m.generate(history).await,
        }
    }

    async fn stream(&self, history: Vec<ChatMessage>, cancel: CancellationToken) -> CoreResult<BoxStreamEv> {
        match self {
            Self::Direct(m) => m.stream(history, cancel).await,
            Self::Bot(m) => m.stream(history, cancel).await,
        }
    }

    fn with_tools(&self, tools: Vec<ToolInfo>) -> CoreResult<Arc<dyn ChatModel>> {
        match self {
            Self::Direct(m) => m.with_tools(tools),
            Self::Bot(m) => m.with_tools(tools),
        }
    }
}
