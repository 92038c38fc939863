//! Deterministic span ids for retry-delay events.
//!
//! Duplicate deliveries of the same completion must produce the same event
//! span, so the id is derived from the run's stored trace context and a
//! per-retry seed. The tracing format fixes the id width at 8 bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const RETRY_EVENT_ICON: &str = "schedule-attempt";

pub fn retry_span_seed(next_attempt_number: i32) -> String {
    format!("retry-{next_attempt_number}")
}

/// 8-byte span id as 16 hex chars, stable for a given trace context and seed.
pub fn deterministic_span_id(trace_context: &Value, seed: &str) -> String {
    let trace = trace_context
        .get("traceparent")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| trace_context.to_string());

    let mut hasher = Sha256::new();
    hasher.update(trace.as_bytes());
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();

    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
