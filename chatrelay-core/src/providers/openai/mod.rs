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
use crate::normalizer::chronological;
use crate::provider::{ChatModel, ModelClient};
use crate::provider_factory::{ModelDeps, ModelSpec};
use crate::stream::BoxStreamEv;
use crate::telemetry::{self, ProviderTrace};

pub const PROVIDER: &str = "openai";

/// Chat-completion client bound to one logical model and one user.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    http: HttpClient,
    bridge: StreamBridge,
    base: String,
    api_key: SecretString,
    /// Upstream model identifier.
    model: String,
    /// Logical name callers asked for.
    logical: String,
    user: String,
    disable_thinking: bool,
    tools: Vec<ToolInfo>,
}

impl OpenAiChat {
    pub fn from_spec(deps: &ModelDeps, spec: &ModelSpec<'_>) -> CoreResult<Self> {
        let model = spec
            .cfg
            .name
            .clone()
            .ok_or_else(|| RelayError::Validation(format!("direct model '{}' has no upstream name", spec.logical)))?;
        Ok(Self {
            http: deps.http.clone(),
            bridge: deps.bridge.clone(),
            base: spec.cfg.base_url.trim_end_matches('/').to_string(),
            api_key: spec.cfg.resolve_api_key(spec.logical)?,
            model,
            logical: spec.logical.to_string(),
            user: spec.user_id.to_string(),
            disable_thinking: spec.cfg.disable_thinking,
            tools: Vec::new(),
        })
    }

    /// Registry constructor for `ModelKind::Direct`.
    pub fn construct(deps: &ModelDeps, spec: &ModelSpec<'_>) -> CoreResult<Arc<dyn ChatModel>> {
        Ok(Arc::new(ModelClient::Direct(Self::from_spec(deps, spec)?)))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAiChat {
            http: HttpClient::new_default().unwrap(),
            bridge: StreamBridge::default(),
            base: server_base.to_string(),
            api_key: SecretString::from("test-key".to_string()),
            model: "qwen3-32b".into(),
            logical: "deyu-default".into(),
            user: "u-1".into(),
            disable_thinking: true,
            tools: Vec::new(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base)
    }

    fn payload<'a>(&'a self, ordered: &'a [ChatMessage], stream: bool) -> OAChatReq<'a> {
        OAChatReq {
            model: &self.model,
            messages: ordered
                .iter()
                .map(|m| OAMessage {
                    role: m.role,
                    content: &m.content,
                    name: m.name.as_deref(),
                })
                .collect(),
            stream,
            user: &self.user,
            chat_template_kwargs: self.disable_thinking.then_some(TemplateKwargs {
                enable_thinking: false,
            }),
            tools: self
                .tools
                .iter()
                .map(|t| OATool {
                    r#type: "function",
                    function: OAFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
        }
    }

    fn labels(&self) -> BridgeLabels {
        BridgeLabels {
            provider: PROVIDER,
            model: self.logical.clone(),
            user_id: Some(self.user.clone()),
        }
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OAChatReq<'a> {
    model: &'a str,
    messages: Vec<OAMessage<'a>>,
    stream: bool,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_template_kwargs: Option<TemplateKwargs>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OATool<'a>>,
}

#[derive(Serialize)]
struct OAMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct TemplateKwargs {
    enable_thinking: bool,
}

#[derive(Serialize)]
struct OATool<'a> {
    r#type: &'static str,
    function: OAFunction<'a>,
}

#[derive(Serialize)]
struct OAFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct OAChatResp {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<OAChoice>,
}

#[derive(Deserialize)]
struct OAChoice {
    message: OARespMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OARespMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct OAStreamChunk {
    #[serde(default)]
    choices: Vec<OAStreamChoice>,
    #[serde(default)]
    error: Option<OAStreamError>,
}

#[derive(Deserialize)]
struct OAStreamChoice {
    #[serde(default)]
    delta: OADelta,
}

#[derive(Deserialize, Default)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAStreamError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl IntoRawToken for OAStreamChunk {
    fn into_raw_token(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty())
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = CoreResult<OAStreamChunk>> + Send>>;

/// Decode `data:` frames until `[DONE]`. Stops after the first error.
fn chunk_stream(frames: SseFrameStream) -> ChunkStream {
    Box::pin(futures_util::stream::unfold(Some(frames), |state| async move {
        let mut frames = state?;
        loop {
            let frame = match frames.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some((Err(e), None)),
            };
            let data = frame.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                return None;
            }
            return match decode_chunk(data) {
                Ok(chunk) => Some((Ok(chunk), Some(frames))),
                Err(e) => Some((Err(e), None)),
            };
        }
    }))
}

fn decode_chunk(data: &str) -> CoreResult<OAStreamChunk> {
    let chunk: OAStreamChunk = serde_json::from_str(data).map_err(|e| RelayError::ProviderError {
        provider: PROVIDER.into(),
        code: "stream".into(),
        message: format!("json decode error: {e}"),
    })?;
    if let Some(err) = chunk.error {
        return Err(RelayError::ProviderError {
            provider: PROVIDER.into(),
            code: match err.code {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "stream".into(),
            },
            message: err.message,
        });
    }
    Ok(chunk)
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> &str {
        &self.logical
    }

    async fn generate(&self, history: Vec<ChatMessage>) -> CoreResult<ChatMessage> {
        let ordered = chronological(history);
        let payload = self.payload(&ordered, false);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let trace = ProviderTrace::with_provider_model(PROVIDER, &self.logical).user_id(&self.user);
        let (resp, provider_id, latency_ms) = match self
            .http
            .post_json::<_, OAChatResp>(PROVIDER, &self.url(), &payload, &hdrs)
            .await
        {
            Ok(ok) => ok,
            Err(err) => {
                telemetry::emit(trace.error(&err));
                return Err(err);
            }
        };

        let choice = resp.choices.into_iter().next();
        let finish = choice.as_ref().and_then(|c| c.finish_reason.clone());
        telemetry::emit(
            trace
                .provider_request_id_opt(provider_id.or(resp.id))
                .latency_ms(latency_ms as u128)
                .finish_reason_opt(finish.as_deref()),
        );

        let mut out = ChatMessage::assistant(String::new());
        if let Some(c) = choice {
            out.content = c.message.content.unwrap_or_default();
            out.reasoning_content = c.message.reasoning_content;
        }
        Ok(out)
    }

    async fn stream(&self, history: Vec<ChatMessage>, cancel: CancellationToken) -> CoreResult<BoxStreamEv> {
        let ordered = chronological(history);
        let payload = self.payload(&ordered, true);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let lines = self
            .http
            .post_sse_lines(PROVIDER, &self.url(), &payload, &hdrs)
            .await?;
        Ok(self
            .bridge
            .spawn(chunk_stream(sse_frames(lines)), cancel, self.labels()))
    }

    fn with_tools(&self, tools: Vec<ToolInfo>) -> CoreResult<Arc<dyn ChatModel>> {
        let mut bound = self.clone();
        bound.tools = tools;
        Ok(Arc::new(ModelClient::Direct(bound)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use std::time::Duration;

    use crate::config::HttpCfg;
    use crate::model::ContentCategory;
    use crate::stream::StreamEvent;
    use crate::telemetry::test_span::{enable_sink_capture, traces_for};
    use crate::test_util::{chat_chunk, slow_sse_server};

    fn sse_body(tokens: &[&str]) -> String {
        let mut body = String::new();
        body.push_str("data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n");
        for t in tokens {
            let chunk = json!({"id": "c1", "choices": [{"index": 0, "delta": {"content": t}}]});
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
        body.push_str("data: [DONE]\n\n");
        body
    }

    /// Newest-first, as storage returns it.
    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("q2"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("q1"),
        ]
    }

    async fn collect(mut events: BoxStreamEv) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = events.next().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn stream_normalizes_markers_and_stops() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["<think>", "\n\n", "x", "</think>", "\n\n", "y"]));
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());

        let events = collect(model.stream(history(), CancellationToken::new()).await.expect("stream")).await;
        let content: Vec<_> = events.iter().filter_map(|e| e.as_content()).collect();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0].category, ContentCategory::Think);
        assert_eq!(content[0].raw_token, "x");
        assert_eq!(content[1].category, ContentCategory::Text);
        assert_eq!(content[1].envelope, r#"{"text":"y","think":"","suggest":""}"#);
        assert!(matches!(events.last(), Some(StreamEvent::Stop)));
    }

    #[tokio::test]
    async fn stream_dispatches_history_chronologically() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("Authorization", "Bearer test-key")
                .body_contains(r#""messages":[{"role":"user","content":"q1"},{"role":"assistant","content":"a1"},{"role":"user","content":"q2"}]"#)
                .body_contains(r#""stream":true"#)
                .body_contains(r#""user":"u-1""#)
                .body_contains(r#""chat_template_kwargs":{"enable_thinking":false}"#);
            then.status(200).body(sse_body(&["ok"]));
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());

        let events = collect(model.stream(history(), CancellationToken::new()).await.expect("stream")).await;
        m.assert();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn stream_setup_error_fails_before_any_event() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body("bad key");
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());
        match model.stream(history(), CancellationToken::new()).await {
            Err(RelayError::ProviderError { code, provider, .. }) => {
                assert_eq!(code, "401");
                assert_eq!(provider, PROVIDER);
            }
            Err(other) => panic!("expected ProviderError, got {other:?}"),
            Ok(_) => panic!("expected setup failure"),
        }
    }

    #[tokio::test]
    async fn inline_error_chunk_is_terminal() {
        let server = MockServer::start();
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\n",
            json!({"choices": [{"delta": {"content": "partial"}}]}),
            json!({"error": {"message": "overloaded", "code": "server_busy"}}),
            json!({"choices": [{"delta": {"content": "never"}}]}),
        );
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(body.clone());
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());

        let events = collect(model.stream(history(), CancellationToken::new()).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_content().unwrap().raw_token, "partial");
        match &events[1] {
            StreamEvent::Error(RelayError::ProviderError { code, message, .. }) => {
                assert_eq!(code, "server_busy");
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected terminal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn generate_maps_reply_and_emits_trace() {
        enable_sink_capture();
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains(r#""content":"q1"},{"role":"assistant""#)
                .body_contains(r#""stream":false"#);
            then.status(200).json_body(json!({
                "id": "cmpl_123",
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello!", "reasoning_content": "because"},
                    "finish_reason": "stop"
                }]
            }));
        });
        let mut model = OpenAiChat::new_for_tests(&server.base_url());
        model.logical = "generate-trace".into();

        let reply = model.generate(history()).await.expect("generate");
        m.assert();
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Hello!");
        assert_eq!(reply.reasoning_content.as_deref(), Some("because"));

        let traces = traces_for("generate-trace");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(traces[0].provider_request_id.as_deref(), Some("cmpl_123"));
        assert_eq!(traces[0].user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn generate_empty_choices_yields_empty_reply() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({"id": "cmpl_empty", "choices": []}));
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());
        let reply = model.generate(history()).await.expect("generate");
        assert_eq!(reply.content, "");
        assert!(reply.reasoning_content.is_none());
    }

    #[tokio::test]
    async fn with_tools_sends_function_specs() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_contains(r#""tools":[{"type":"function","function":{"name":"lookup","description":"find a record""#);
            then.status(200).json_body(json!({"choices": [{"message": {"content": "done"}}]}));
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());
        let tooled = model
            .with_tools(vec![ToolInfo {
                name: "lookup".into(),
                description: "find a record".into(),
                parameters: json!({"type": "object"}),
            }])
            .expect("direct models accept tools");

        assert_eq!(tooled.name(), "deyu-default");
        let reply = tooled.generate(history()).await.expect("generate");
        m.assert();
        assert_eq!(reply.content, "done");
    }

    #[tokio::test]
    async fn thinking_flag_off_omits_template_kwargs() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({"choices": []}));
        });
        let mut model = OpenAiChat::new_for_tests(&server.base_url());
        model.disable_thinking = false;
        let ordered = chronological(history());
        let body = serde_json::to_value(model.payload(&ordered, false)).unwrap();
        assert!(body.get("chat_template_kwargs").is_none());
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn network_error_maps_to_unavailable() {
        let model = OpenAiChat::new_for_tests("http://127.0.0.1:9");
        let err = model.generate(history()).await.unwrap_err();
        assert!(matches!(err, RelayError::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn empty_delta_yields_no_event() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&["a", "", "b"]));
        });
        let model = OpenAiChat::new_for_tests(&server.base_url());

        let events = collect(model.stream(history(), CancellationToken::new()).await.unwrap()).await;
        let tokens: Vec<&str> = events
            .iter()
            .filter_map(|e| e.as_content())
            .map(|c| c.raw_token.as_str())
            .collect();
        assert_eq!(tokens, vec!["a", "b"]);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn slow_stream_runs_past_request_timeout() {
        let mut pieces: Vec<String> = (0..6).map(|i| chat_chunk(&format!("t{i}"))).collect();
        pieces.push("data: [DONE]\n\n".to_string());
        let base = slow_sse_server(pieces, Duration::from_millis(300)).await;
        let mut model = OpenAiChat::new_for_tests(&base);
        model.http = HttpClient::from_cfg(&HttpCfg {
            request_timeout_ms: 700,
            ..HttpCfg::default()
        })
        .unwrap();

        let events = collect(model.stream(history(), CancellationToken::new()).await.unwrap()).await;
        let tokens: Vec<&str> = events
            .iter()
            .filter_map(|e| e.as_content())
            .map(|c| c.raw_token.as_str())
            .collect();
        assert_eq!(tokens, vec!["t0", "t1", "t2", "t3", "t4", "t5"]);
        assert!(matches!(events.last(), Some(StreamEvent::Stop)));
    }
}
