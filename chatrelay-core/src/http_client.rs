use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::stream::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

/// One dispatched SSE event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }

    fn push_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            // id:, retry: and unknown fields carry nothing we use
            _ => {}
        }
    }
}

/// A boxed stream of `SseFrame` results.
pub type SseFrameStream = Pin<Box<dyn Stream<Item = CoreResult<SseFrame>> + Send>>;

/// Group raw SSE lines into frames. A blank line dispatches the pending frame;
/// an unterminated frame at end of body is flushed.
pub fn sse_frames(lines: SseStream) -> SseFrameStream {
    Box::pin(futures_util::stream::unfold(
        Some((lines, SseFrame::default())),
        |state| async move {
            let (mut lines, mut frame) = state?;
            loop {
                match lines.next().await {
                    Some(Ok(SseLine { line })) => {
                        if !line.is_empty() {
                            frame.push_line(&line);
                            continue;
                        }
                        if frame.is_empty() {
                            continue;
                        }
                        let ready = std::mem::take(&mut frame);
                        return Some((Ok(ready), Some((lines, frame))));
                    }
                    Some(Err(e)) => return Some((Err(e), None)),
                    None if frame.is_empty() => return None,
                    None => return Some((Ok(frame), None)),
                }
            }
        },
    ))
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    /// No total timeout: a healthy stream may outlive any fixed deadline.
    streaming: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let base = || {
            let builder = Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
            match cfg.pool_max_idle_per_host {
                Some(n) => builder.pool_max_idle_per_host(n),
                None => builder,
            }
        };
        let inner = base()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        let mut streaming = base();
        if let Some(ms) = cfg.stream_idle_timeout_ms {
            streaming = streaming.read_timeout(Duration::from_millis(ms));
        }
        let streaming = streaming
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            streaming,
            user_agent: "chatrelay/0.1".to_string(),
        })
    }

    /// POST JSON and decode a JSON response.
    /// Returns the body, the provider's request id if any, and latency in ms.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|_e| RelayError::ProviderUnavailable {
            provider: provider.into(),
        })?;

        let latency = start.elapsed().as_millis() as u32;
        let status = resp.status();
        let headers = resp.headers().clone();
        let provider_request_id = extract_request_id(&headers);

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let ra = parse_retry_after(&headers);
            return Err(map_http_error(provider, status, ra, &text));
        }

        let parsed = resp.json::<R>().await.map_err(|e| RelayError::ProviderError {
            provider: provider.into(),
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })?;
        Ok((parsed, provider_request_id, latency))
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line (trim not applied) from the SSE channel.
    /// Only the connect and idle timeouts apply; the body may run as long as
    /// the upstream keeps sending.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<SseStream> {
        let mut req = self
            .streaming
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|_| RelayError::ProviderUnavailable {
            provider: provider.into(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(provider, status, ra, &body));
        }

        let line_stream = LineStream::new(provider, Box::pin(resp.bytes_stream()));
        Ok(Box::pin(line_stream))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-tt-logid"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(provider: &str, status: StatusCode, retry_after: Option<u64>, body: &str) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => RelayError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => RelayError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

/// Cut at `max` bytes, backing off to a char boundary.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut t = s[..end].to_string();
    t.push_str("...");
    t
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Longest SSE line accepted before the stream is abandoned.
pub const MAX_SSE_LINE_BYTES: usize = 1 << 20;

/// Internal line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
/// Bytes are buffered until a full line is present so multi-byte characters
/// split across chunks decode intact.
struct LineStream {
    provider: String,
    inner: ByteStream,
    buf: Vec<u8>,
    max_line: usize,
    done: bool,
}

impl LineStream {
    fn new(provider: &str, inner: ByteStream) -> Self {
        Self {
            provider: provider.to_string(),
            inner,
            buf: Vec::new(),
            max_line: MAX_SSE_LINE_BYTES,
            done: false,
        }
    }

    #[cfg(test)]
    fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    fn take_line(&mut self, idx: usize) -> SseLine {
        let mut raw: Vec<u8> = self.buf.drain(..=idx).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                return Poll::Ready(Some(Ok(self.take_line(idx))));
            }
            if !self.done && self.buf.len() > self.max_line {
                self.done = true;
                self.buf.clear();
                return Poll::Ready(Some(Err(RelayError::ProviderError {
                    provider: self.provider.clone(),
                    code: "stream".into(),
                    message: format!("sse line exceeds {} bytes", self.max_line),
                })));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(_e))) => {
                    self.done = true;
                    self.buf.clear();
                    return Poll::Ready(Some(Err(RelayError::ProviderUnavailable {
                        provider: self.provider.clone(),
                    })));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let raw = std::mem::take(&mut self.buf);
                        return Poll::Ready(Some(Ok(SseLine {
                            line: String::from_utf8_lossy(&raw).into_owned(),
                        })));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
