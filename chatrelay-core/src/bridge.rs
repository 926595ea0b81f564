//! Stream bridge: one producer task per stream, pumping an upstream reader
//! through the delimiter state machine into a bounded pipe.
//!
//! The task owns the upstream handle and the pipe's sender exclusively. Both
//! are dropped when the task returns, so the pipe closes exactly once on every
//! exit path. Each wait (next upstream item, free pipe slot) is raced against
//! the cancellation token.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::envelope::{EnvelopeEncoder, JsonEnvelope};
use crate::error::CoreResult;
use crate::normalizer::DelimiterState;
use crate::stream::{BoxStreamEv, ContentEvent, StreamEvent};
use crate::telemetry::{StreamLog, StreamOutcome};

/// Pipe capacity used when none is configured.
pub const DEFAULT_PIPE_CAPACITY: usize = 5;

/// Unwraps one native upstream item into a raw content token.
/// `None` means the item carries no content and is skipped.
pub trait IntoRawToken {
    fn into_raw_token(self) -> Option<String>;
}

impl IntoRawToken for String {
    fn into_raw_token(self) -> Option<String> {
        Some(self)
    }
}

/// Labels attached to the bridge span and its telemetry.
#[derive(Debug, Clone)]
pub struct BridgeLabels {
    pub provider: &'static str,
    pub model: String,
    pub user_id: Option<String>,
}

#[derive(Clone)]
pub struct StreamBridge {
    capacity: usize,
    encoder: Arc<dyn EnvelopeEncoder>,
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new(DEFAULT_PIPE_CAPACITY)
    }
}

impl StreamBridge {
    /// A zero capacity is raised to one; tokio channels need at least one slot.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            encoder: Arc::new(JsonEnvelope),
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn EnvelopeEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Launch the producer task and return the consumer end immediately.
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, T>(&self, upstream: S, cancel: CancellationToken, labels: BridgeLabels) -> BoxStreamEv
    where
        S: Stream<Item = CoreResult<T>> + Send + Unpin + 'static,
        T: IntoRawToken + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.capacity);
        let span = tracing::info_span!(
            "chat.stream",
            llm.provider = labels.provider,
            llm.model = %labels.model,
            stream.events = tracing::field::Empty,
            stream.dropped = tracing::field::Empty,
            stream.outcome = tracing::field::Empty,
        );
        let pump = Pump {
            tx,
            cancel,
            encoder: self.encoder.clone(),
            state: DelimiterState::default(),
            events: 0,
            dropped: 0,
        };
        tokio::spawn(pump.run(upstream, labels).instrument(span));
        Box::pin(ReceiverStream::new(rx))
    }
}

enum Delivery {
    Sent,
    Cancelled,
    Closed,
}

struct Pump {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    encoder: Arc<dyn EnvelopeEncoder>,
    state: DelimiterState,
    events: u64,
    dropped: u64,
}

impl Pump {
    async fn run<S, T>(mut self, mut upstream: S, labels: BridgeLabels)
    where
        S: Stream<Item = CoreResult<T>> + Send + Unpin,
        T: IntoRawToken,
    {
        let started = Instant::now();
        let mut failure = None;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamOutcome::Cancelled,
                next = upstream.next() => next,
            };
            let item = match next {
                Some(Ok(item)) => item,
                None => match self.deliver(StreamEvent::Stop).await {
                    Delivery::Cancelled => break StreamOutcome::Cancelled,
                    _ => break StreamOutcome::Completed,
                },
                Some(Err(err)) => {
                    failure = Some((err.kind(), err.to_string()));
                    match self.deliver(StreamEvent::Error(err)).await {
                        Delivery::Cancelled => break StreamOutcome::Cancelled,
                        _ => break StreamOutcome::Failed,
                    }
                }
            };

            let Some(token) = item.into_raw_token() else {
                continue;
            };
            let Some(classified) = self.state.feed(token) else {
                continue;
            };
            let envelope = match self.encoder.encode(&classified.content) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.dropped += 1;
                    tracing::debug!(error = %err, "dropping token with unencodable envelope");
                    continue;
                }
            };
            let event = StreamEvent::Content(ContentEvent {
                envelope,
                category: classified.category,
                raw_token: classified.raw,
            });
            match self.deliver(event).await {
                Delivery::Sent => self.events += 1,
                Delivery::Cancelled => break StreamOutcome::Cancelled,
                Delivery::Closed => break StreamOutcome::ConsumerGone,
            }
        };
        drop(upstream);

        let span = tracing::Span::current();
        span.record("stream.events", self.events);
        span.record("stream.dropped", self.dropped);
        span.record("stream.outcome", outcome.as_str());

        let (error_kind, error_message) = match failure {
            Some((kind, message)) => (Some(kind.to_string()), Some(message)),
            None => (None, None),
        };
        crate::telemetry::emit_stream(StreamLog {
            provider: labels.provider.to_string(),
            model: labels.model,
            user_id: labels.user_id,
            events: self.events,
            dropped: self.dropped,
            outcome,
            error_kind,
            error_message,
            latency_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Push one event, waiting for a free slot unless cancelled first.
    async fn deliver(&self, event: StreamEvent) -> Delivery {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Delivery::Cancelled,
            res = self.tx.send(event) => match res {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            },
        }
    }
}
