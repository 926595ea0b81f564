//! Telemetry primitives for caller-side observability.
//! The core only surfaces conditions; nothing is emitted unless a sink is
//! installed via `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive telemetry events.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` **may** be called from any thread, including bridge tasks.
/// - Keep overhead minimal; `record_stream` runs once per stream on exit.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, trace: crate::telemetry::ProviderTrace);

    fn record_stream(&self, _log: crate::telemetry::StreamLog) {}
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

#[inline]
fn capture_enabled() -> bool {
    #[cfg(test)]
    {
        TEST_CAPTURE.with(|c| c.get())
    }
    #[cfg(not(test))]
    {
        true
    }
}

/// Emit a provider trace if a sink is installed.
#[inline]
pub(crate) fn emit(trace: crate::telemetry::ProviderTrace) {
    if !capture_enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record(trace);
    }
}

/// Emit a stream summary if a sink is installed.
#[inline]
pub(crate) fn emit_stream(log: crate::telemetry::StreamLog) {
    if !capture_enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_stream(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
///
/// Bridge tasks spawned on a current-thread runtime share the test thread and
/// therefore the flag.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
