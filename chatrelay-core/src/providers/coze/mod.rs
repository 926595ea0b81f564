use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeLabels, IntoRawToken, StreamBridge};
use crate::error::{CoreResult, RelayError};
use crate::http_client::{sse_frames, HttpClient, SseFrameStream};
use crate::model::{ChatMessage, Role, ToolInfo};
use crate::normalizer::{chronological, strip_names};
use crate::provider::{ChatModel, ModelClient};
use crate::provider_factory::{ModelDeps, ModelSpec};
use crate::stream::BoxStreamEv;
use crate::telemetry::{self, ProviderTrace};

pub const PROVIDER: &str = "coze";

/// Client for a platform-hosted bot. The platform keeps its own copy of the
/// conversation (`auto_save_history`), and every call is a streaming call.
#[derive(Debug, Clone)]
pub struct CozeBot {
    http: HttpClient,
    bridge: StreamBridge,
    base: String,
    api_key: SecretString,
    bot_id: String,
    logical: String,
    user: String,
}

impl CozeBot {
    pub fn from_spec(deps: &ModelDeps, spec: &ModelSpec<'_>) -> CoreResult<Self> {
        let bot_id = spec
            .cfg
            .bot_id
            .clone()
            .ok_or_else(|| RelayError::Validation(format!("bot model '{}' has no bot_id", spec.logical)))?;
        Ok(Self {
            http: deps.http.clone(),
            bridge: deps.bridge.clone(),
            base: spec.cfg.base_url.trim_end_matches('/').to_string(),
            api_key: spec.cfg.resolve_api_key(spec.logical)?,
            bot_id,
            logical: spec.logical.to_string(),
            user: spec.user_id.to_string(),
        })
    }

    /// Registry constructor for `ModelKind::Bot`.
    pub fn construct(deps: &ModelDeps, spec: &ModelSpec<'_>) -> CoreResult<Arc<dyn ChatModel>> {
        Ok(Arc::new(ModelClient::Bot(Self::from_spec(deps, spec)?)))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        CozeBot {
            http: HttpClient::new_default().unwrap(),
            bridge: StreamBridge::default(),
            base: server_base.to_string(),
            api_key: SecretString::from("pat-test".to_string()),
            bot_id: "7500".into(),
            logical: "deyu-bzr".into(),
            user: "u-1".into(),
        }
    }

    fn labels(&self) -> BridgeLabels {
        BridgeLabels {
            provider: PROVIDER,
            model: self.logical.clone(),
            user_id: Some(self.user.clone()),
        }
    }

    /// Open the chat event stream for `history` (newest-first).
    async fn open(&self, history: Vec<ChatMessage>) -> CoreResult<BotEventStream> {
        let mut ordered = chronological(history);
        strip_names(&mut ordered);
        let payload = CozeChatReq {
            bot_id: &self.bot_id,
            user_id: &self.user,
            stream: true,
            auto_save_history: true,
            additional_messages: ordered
                .iter()
                .map(|m| CozeMessage {
                    role: m.role,
                    content: &m.content,
                    reasoning_content: m.reasoning_content.as_deref(),
                    kind: "question",
                    content_type: "text",
                })
                .collect(),
        };
        let auth = format!("Bearer {}", self.api_key.expose_secret());
        let hdrs = [
            ("Authorization", auth.as_str()),
            ("Content-Type", "application/json"),
        ];
        let url = format!("{}/v3/chat", self.base);
        let lines = self.http.post_sse_lines(PROVIDER, &url, &payload, &hdrs).await?;
        Ok(event_stream(sse_frames(lines)))
    }
}

// ---- Wire structs ----
#[derive(Serialize)]
struct CozeChatReq<'a> {
    bot_id: &'a str,
    user_id: &'a str,
    stream: bool,
    auto_save_history: bool,
    additional_messages: Vec<CozeMessage<'a>>,
}

#[derive(Serialize)]
struct CozeMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'static str,
    content_type: &'static str,
}

/// Chat event names the platform sends on the `event:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEventKind {
    ChatCreated,
    ChatInProgress,
    MessageDelta,
    MessageCompleted,
    ChatCompleted,
    ChatFailed,
    Error,
    Done,
    Other(String),
}

impl BotEventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "conversation.chat.created" => Self::ChatCreated,
            "conversation.chat.in_progress" => Self::ChatInProgress,
            "conversation.message.delta" => Self::MessageDelta,
            "conversation.message.completed" => Self::MessageCompleted,
            "conversation.chat.completed" => Self::ChatCompleted,
            "conversation.chat.failed" => Self::ChatFailed,
            "error" => Self::Error,
            "done" => Self::Done,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Message payload of `conversation.message.*` events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BotChatEvent {
    pub kind: BotEventKind,
    pub message: Option<BotMessage>,
}

/// Only incremental message content is forwarded; completed messages repeat
/// the full answer and lifecycle events carry no content.
impl IntoRawToken for BotChatEvent {
    fn into_raw_token(self) -> Option<String> {
        match (self.kind, self.message) {
            (BotEventKind::MessageDelta, Some(m)) if !m.content.is_empty() => Some(m.content),
            _ => None,
        }
    }
}

#[derive(Deserialize, Default)]
struct CozeError {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    msg: String,
}

#[derive(Deserialize, Default)]
struct CozeFailedChat {
    #[serde(default)]
    last_error: Option<CozeError>,
}

fn platform_error(kind: &BotEventKind, data: &str) -> RelayError {
    let err = match kind {
        BotEventKind::ChatFailed => serde_json::from_str::<CozeFailedChat>(data)
            .ok()
            .and_then(|c| c.last_error),
        _ => serde_json::from_str::<CozeError>(data).ok(),
    }
    .unwrap_or_default();
    let code = match err.code {
        serde_json::Value::Null => "stream".to_string(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    let message = if err.msg.is_empty() { data.to_string() } else { err.msg };
    RelayError::ProviderError {
        provider: PROVIDER.into(),
        code,
        message,
    }
}

type BotEventStream = Pin<Box<dyn Stream<Item = CoreResult<BotChatEvent>> + Send>>;

/// Map SSE frames to chat events. Ends at `done`; a failure event is yielded
/// as the last item.
fn event_stream(frames: SseFrameStream) -> BotEventStream {
    Box::pin(futures_util::stream::unfold(Some(frames), |state| async move {
        let mut frames = state?;
        let frame = match frames.next().await? {
            Ok(frame) => frame,
            Err(e) => return Some((Err(e), None)),
        };
        let kind = BotEventKind::parse(frame.event.as_deref().unwrap_or_default());
        match kind {
            BotEventKind::Done => None,
            BotEventKind::Error | BotEventKind::ChatFailed => {
                Some((Err(platform_error(&kind, &frame.data)), None))
            }
            BotEventKind::MessageDelta | BotEventKind::MessageCompleted => {
                match serde_json::from_str::<BotMessage>(&frame.data) {
                    Ok(message) => Some((
                        Ok(BotChatEvent {
                            kind,
                            message: Some(message),
                        }),
                        Some(frames),
                    )),
                    Err(e) => Some((
                        Err(RelayError::ProviderError {
                            provider: PROVIDER.into(),
                            code: "stream".into(),
                            message: format!("json decode error: {e}"),
                        }),
                        None,
                    )),
                }
            }
            _ => Some((Ok(BotChatEvent { kind, message: None }), Some(frames))),
        }
    }))
}

#[async_trait]
impl ChatModel for CozeBot {
    fn name(&self) -> &str {
        &self.logical
    }

    /// Drains the event stream and joins the delta contents verbatim.
    async fn generate(&self, history: Vec<ChatMessage>) -> CoreResult<ChatMessage> {
        let trace = ProviderTrace::with_provider_model(PROVIDER, &self.logical).user_id(&self.user);
        let start = std::time::Instant::now();
        let drained = async {
            let mut events = self.open(history).await?;
            let mut content = String::new();
            while let Some(ev) = events.next().await {
                if let Some(token) = ev?.into_raw_token() {
                    content.push_str(&token);
                }
            }
            Ok::<_, RelayError>(content)
        }
        .await;
        match drained {
            Ok(content) => {
                telemetry::emit(trace.latency_ms(start.elapsed().as_millis()));
                Ok(ChatMessage::assistant(content))
            }
            Err(err) => {
                telemetry::emit(trace.error(&err));
                Err(err)
            }
        }
    }

    async fn stream(&self, history: Vec<ChatMessage>, cancel: CancellationToken) -> CoreResult<BoxStreamEv> {
        let events = self.open(history).await?;
        Ok(self.bridge.spawn(events, cancel, self.labels()))
    }

    fn with_tools(&self, _tools: Vec<ToolInfo>) -> CoreResult<Arc<dyn ChatModel>> {
        Err(RelayError::Validation(format!(
            "bot model '{}' manages its own tools",
            self.logical
        )))
    }
}
