//! Logging setup and per-session counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `default_directive` when unset.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Counters shared by a session's tasks.
#[derive(Debug, Default)]
pub struct SessionTelemetry {
    push_events: AtomicU64,
    poll_events: AtomicU64,
    duplicates_collapsed: AtomicU64,
    invalid_transitions: AtomicU64,
    reconnect_attempts: AtomicU64,
    poll_failures: AtomicU64,
    stale_inputs_dropped: AtomicU64,
}

/// Plain copy of [`SessionTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub push_events: u64,
    pub poll_events: u64,
    pub duplicates_collapsed: u64,
    pub invalid_transitions: u64,
    pub reconnect_attempts: u64,
    pub poll_failures: u64,
    pub stale_inputs_dropped: u64,
}

impl SessionTelemetry {
    pub fn record_push_event(&self) {
        self.push_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_event(&self) {
        self.poll_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_collapsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_transition(&self) {
        self.invalid_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_input(&self) {
        self.stale_inputs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            push_events: self.push_events.load(Ordering::Relaxed),
            poll_events: self.poll_events.load(Ordering::Relaxed),
            duplicates_collapsed: self.duplicates_collapsed.load(Ordering::Relaxed),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            stale_inputs_dropped: self.stale_inputs_dropped.load(Ordering::Relaxed),
        }
    }
}
