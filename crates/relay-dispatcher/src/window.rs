//! Bounded tracing window: groups consecutive dispatch iterations under one
//! span, rolled over by item budget, wall-clock timeout, or a forced flag
//! after a transport fault. One window per dispatcher instance; spans never
//! nest.

use relay_core::contracts::SpanHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TraceWindowConfig {
    pub max_items: u32,
    pub timeout: Duration,
}

impl Default for TraceWindowConfig {
    fn default() -> Self {
        Self {
            max_items: 1_000,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct TraceWindow {
    config: TraceWindowConfig,
    span: Option<SpanHandle>,
    opened_at: Instant,
    remaining: u32,
    successes: u64,
    failures: u64,
    force_rollover: bool,
}

impl TraceWindow {
    pub fn new(config: TraceWindowConfig) -> Self {
        Self {
            config,
            span: None,
            opened_at: Instant::now(),
            remaining: 0,
            successes: 0,
            failures: 0,
            force_rollover: false,
        }
    }

    /// True when the next iteration must start a fresh span: no span open,
    /// item budget exhausted, timeout elapsed, or rollover forced.
    pub fn rollover_due(&self) -> bool {
        self.span.is_none()
            || self.force_rollover
            || self.remaining == 0
            || self.opened_at.elapsed() > self.config.timeout
    }

    /// Close the current span, if any, yielding it with its counters.
    pub fn close(&mut self) -> Option<(SpanHandle, u64, u64)> {
        let span = self.span.take()?;
        Some((span, self.successes, self.failures))
    }

    pub fn open(&mut self, span: SpanHandle) {
        self.span = Some(span);
        self.opened_at = Instant::now();
        self.remaining = self.config.max_items;
        self.successes = 0;
        self.failures = 0;
        self.force_rollover = false;
    }

    pub fn span(&self) -> Option<&SpanHandle> {
        self.span.as_ref()
    }

    /// Charge one dispatched message against the window's budget.
    pub fn count_dispatch(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub fn count_success(&mut self) {
        self.successes += 1;
    }

    pub fn count_failure(&mut self) {
        self.failures += 1;
    }

    pub fn force_rollover(&mut self) {
        self.force_rollover = true;
    }
}
