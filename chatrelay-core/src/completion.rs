//! Caller-facing entry points: authenticate, assemble history, resolve the
//! model and hand back its normalized event stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, RelayError};
use crate::model::ChatMessage;
use crate::normalizer::strip_empty_think;
use crate::provider_factory::ModelRegistry;
use crate::stream::BoxStreamEv;

pub const BRIEF_SYSTEM_PROMPT: &str =
    "You are a title generator. Give a short title for the user's input, no more than ten words.";

/// Inbound request context as seen by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub bearer: Option<String>,
}

/// Resolves the calling user. Failure of any kind maps to `Unauthenticated`.
pub trait IdentityExtractor: Send + Sync {
    fn user_id(&self, ctx: &AuthContext) -> CoreResult<String>;
}

/// Prior conversation state loaded from storage.
#[derive(Debug, Clone, Default)]
pub struct History {
    /// Newest-first.
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self, user_id: &str, req: &CompletionRequest) -> CoreResult<History>;
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub conversation_id: String,
    /// New messages for this turn, oldest first. At most one is accepted.
    pub messages: Vec<ChatMessage>,
}

/// Title generation input. The caller already knows which conversation the
/// title belongs to and stores it there.
#[derive(Debug, Clone)]
pub struct BriefRequest {
    pub messages: Vec<ChatMessage>,
}

pub struct CompletionService {
    registry: Arc<ModelRegistry>,
    history: Arc<dyn HistoryStore>,
    identity: Arc<dyn IdentityExtractor>,
    brief_model: String,
}

impl CompletionService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        history: Arc<dyn HistoryStore>,
        identity: Arc<dyn IdentityExtractor>,
        brief_model: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            history,
            identity,
            brief_model: brief_model.into(),
        }
    }

    fn authenticate(&self, ctx: &AuthContext) -> CoreResult<String> {
        self.identity.user_id(ctx).map_err(|e| {
            tracing::warn!(error = %e, "extract user id failed");
            RelayError::Unauthenticated
        })
    }

    /// Start a streamed completion for one new message.
    pub async fn completions(
        &self,
        ctx: &AuthContext,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> CoreResult<BoxStreamEv> {
        let uid = self.authenticate(ctx)?;
        if req.messages.len() > 1 {
            return Err(RelayError::Unimplemented("only one new message per request".into()));
        }

        let model = self.registry.get(&req.model, &uid)?;
        let History {
            messages: prior,
            system_prompt,
        } = self.history.load(&uid, &req).await?;

        let mut history = Vec::with_capacity(prior.len() + 2);
        history.extend(req.messages.iter().cloned());
        history.extend(prior);
        if let Some(prompt) = system_prompt {
            history.push(ChatMessage::system(prompt));
        }
        model.stream(history, cancel).await
    }

    /// Produce a short conversation title from the first user message.
    pub async fn generate_brief(&self, ctx: &AuthContext, req: &BriefRequest) -> CoreResult<String> {
        let uid = self.authenticate(ctx)?;
        let first = req
            .messages
            .first()
            .ok_or_else(|| RelayError::Validation("brief needs at least one message".into()))?;
        let model = self.registry.get(&self.brief_model, &uid)?;
        // newest-first
        let input = vec![
            ChatMessage::user(first.content.clone()),
            ChatMessage::system(BRIEF_SYSTEM_PROMPT),
        ];
        let out = model.generate(input).await?;
        Ok(strip_empty_think(&out.content))
    }
}
