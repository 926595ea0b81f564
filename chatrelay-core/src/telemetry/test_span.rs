#![cfg(test)]

//! Test capture for spans and telemetry sink output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{span, Subscriber};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::registry;
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::telemetry::{ProviderTrace, StreamLog, TelemetrySink};

#[derive(Default, Debug)]
pub struct SpanData {
    pub name: String,
    pub fields: Mutex<HashMap<String, String>>, // stringified values
}

impl SpanData {
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.lock().unwrap().get(key).cloned()
    }
}

#[derive(Default, Debug)]
pub struct SpanStore {
    pub spans: Mutex<HashMap<tracing::span::Id, Arc<SpanData>>>,
}

impl SpanStore {
    pub fn named(&self, name: &str) -> Vec<Arc<SpanData>> {
        self.spans
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    pub store: Arc<SpanStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let data = Arc::new(SpanData {
            name: attrs.metadata().name().to_string(),
            ..Default::default()
        });
        attrs.record(&mut MapVisitor {
            map: &mut data.fields.lock().unwrap(),
        });
        self.store.spans.lock().unwrap().insert(id.clone(), data);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(data) = self.store.spans.lock().unwrap().get(id) {
            values.record(&mut MapVisitor {
                map: &mut data.fields.lock().unwrap(),
            });
        }
    }
}

/// Install a capturing subscriber as the thread default and return its store.
/// The guard is returned so the capture lives exactly as long as the test.
pub fn install_capture() -> (Arc<SpanStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(SpanStore::default());
    let layer = CaptureLayer {
        store: store.clone(),
    };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}

pub static TRACES: Lazy<Mutex<Vec<ProviderTrace>>> = Lazy::new(|| Mutex::new(Vec::new()));
pub static STREAM_LOGS: Lazy<Mutex<Vec<StreamLog>>> = Lazy::new(|| Mutex::new(Vec::new()));

struct CaptureSink;

impl TelemetrySink for CaptureSink {
    fn record(&self, trace: ProviderTrace) {
        TRACES.lock().unwrap().push(trace);
    }
    fn record_stream(&self, log: StreamLog) {
        STREAM_LOGS.lock().unwrap().push(log);
    }
}

/// Install the shared capture sink (first caller wins) and enable emission
/// for the current test thread. Tests filter captured entries by model name.
pub fn enable_sink_capture() {
    let _ = crate::telemetry::set_telemetry_sink(Arc::new(CaptureSink));
    crate::telemetry::test_set_capture_enabled(true);
}

pub fn stream_logs_for(model: &str) -> Vec<StreamLog> {
    STREAM_LOGS
        .lock()
        .unwrap()
        .iter()
        .filter(|l| l.model == model)
        .cloned()
        .collect()
}

pub fn traces_for(model: &str) -> Vec<ProviderTrace> {
    TRACES
        .lock()
        .unwrap()
        .iter()
        .filter(|t| t.model.as_deref() == Some(model))
        .cloned()
        .collect()
}
