//! Structured observability for Firefly lifecycle events.
//!
//! Provides:
//! - [`EventLog`]: in-memory retention of recent lifecycle events
//! - [`LifecycleMetrics`]: atomic counters per event type, with Prometheus
//!   text export
//! - [`CounterSink`]: event-sink adapter feeding the counters
//!
//! All types plug into the orchestrator through the [`EventSink`] trait and
//! can be shared via [`Arc`].

#![forbid(unsafe_code)]

use anyhow::Result;
use firefly::EventSink;
use firefly_proto::{EventType, FireflyEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

// ─────────────────────────────────────────────────────────────
// Atomic Counter
// ─────────────────────────────────────────────────────────────

/// Monotonic counter backed by an atomic u64.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment the counter by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Event Log
// ─────────────────────────────────────────────────────────────

/// In-memory log of recent lifecycle events with thread-safe access.
///
/// Mirrors every event to tracing (warn for `error`/`sync_failed`, info
/// otherwise) and retains the newest entries up to capacity for inspection
/// and export. Register it as the orchestrator's sink, keep an `Arc` for
/// querying.
pub struct EventLog {
    events: RwLock<Vec<FireflyEvent>>,
    /// Maximum number of events to retain in memory.
    capacity: usize,
}

impl EventLog {
    /// Create a new event log retaining up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            capacity,
        }
    }

    /// Create with default capacity (1,000 events).
    pub fn default_capacity() -> Self {
        Self::new(1_000)
    }

    /// Record one event: mirror it to tracing, then retain it.
    pub fn append(&self, event: &FireflyEvent) {
        let metadata_json = serde_json::to_string(&event.metadata).unwrap_or_default();
        match event.event_type {
            EventType::Error | EventType::SyncFailed => {
                warn!(
                    event_type = %event.event_type,
                    instance_id = ?event.instance_id,
                    provider = ?event.provider,
                    metadata = %metadata_json,
                    "firefly failure event"
                );
            }
            _ => {
                info!(
                    event_type = %event.event_type,
                    instance_id = ?event.instance_id,
                    provider = ?event.provider,
                    duration_ms = ?event.duration_ms,
                    metadata = %metadata_json,
                    "firefly event"
                );
            }
        }

        let mut events = self.events.write();
        events.push(event.clone());
        // Evict oldest events if over capacity
        if events.len() > self.capacity {
            let excess = events.len() - self.capacity;
            events.drain(0..excess);
        }
    }

    /// Query retained events filtered by type and/or instance, newest first.
    pub fn query(
        &self,
        event_type: Option<EventType>,
        instance_id: Option<&str>,
        limit: usize,
    ) -> Vec<FireflyEvent> {
        let events = self.events.read();
        events
            .iter()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| instance_id.is_none_or(|id| e.instance_id.as_deref() == Some(id)))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Return all retained events as a JSON array string.
    pub fn to_json(&self) -> String {
        let events = self.events.read();
        serde_json::to_string_pretty(&*events).unwrap_or_else(|_| "[]".to_string())
    }

    /// Number of retained events.
    pub fn count(&self) -> usize {
        self.events.read().len()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &FireflyEvent) -> Result<()> {
        self.append(event);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
// Lifecycle Metrics
// ─────────────────────────────────────────────────────────────

/// Atomic counters over the orchestrator's event stream.
///
/// `sync_started`/`sync_completed` are deliberately uncounted: sync attempts
/// are only interesting when they fail.
#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    /// Total successful ignite operations.
    pub ignites_total: Counter,
    /// Total successful fade operations.
    pub fades_total: Counter,
    /// Total failed orchestrator operations.
    pub errors_total: Counter,
    /// Total failed state hydrations and persists.
    pub syncs_failed: Counter,
    /// Total orphan instances detected by sweeps.
    pub orphans_detected: Counter,
    /// Total orphan instances terminated by sweeps.
    pub orphans_terminated: Counter,
    /// Total idle-threshold crossings.
    pub idle_triggers: Counter,
}

impl LifecycleMetrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter matching one event.
    pub fn record(&self, event: &FireflyEvent) {
        match event.event_type {
            EventType::Ignite => self.ignites_total.inc(),
            EventType::Fade => self.fades_total.inc(),
            EventType::Error => self.errors_total.inc(),
            EventType::SyncFailed => self.syncs_failed.inc(),
            EventType::OrphanDetected => self.orphans_detected.inc(),
            EventType::OrphanTerminated => self.orphans_terminated.inc(),
            EventType::IdleTriggered => self.idle_triggers.inc(),
            EventType::SyncStarted | EventType::SyncCompleted => {}
        }
    }

    /// Render all counters as a Prometheus text format string.
    ///
    /// Each counter is rendered with `# HELP`, `# TYPE`, and value lines.
    pub fn render_prometheus(&self, prefix: &str) -> String {
        let mut out = String::new();

        write_counter(
            &mut out,
            prefix,
            "ignites_total",
            "Total successful ignite operations",
            self.ignites_total.get(),
        );
        write_counter(
            &mut out,
            prefix,
            "fades_total",
            "Total successful fade operations",
            self.fades_total.get(),
        );
        write_counter(
            &mut out,
            prefix,
            "errors_total",
            "Total failed orchestrator operations",
            self.errors_total.get(),
        );
        write_counter(
            &mut out,
            prefix,
            "syncs_failed",
            "Total failed state hydrations and persists",
            self.syncs_failed.get(),
        );
        write_counter(
            &mut out,
            prefix,
            "orphans_detected",
            "Total orphan instances detected by sweeps",
            self.orphans_detected.get(),
        );
        write_counter(
            &mut out,
            prefix,
            "orphans_terminated",
            "Total orphan instances terminated by sweeps",
            self.orphans_terminated.get(),
        );
        write_counter(
            &mut out,
            prefix,
            "idle_triggers",
            "Total idle-threshold crossings",
            self.idle_triggers.get(),
        );

        out
    }
}

fn write_counter(out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
    out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
    out.push_str(&format!("{prefix}_{name} {value}\n\n"));
}

// ─────────────────────────────────────────────────────────────
// Counter Sink
// ─────────────────────────────────────────────────────────────

/// Adapts [`LifecycleMetrics`] to the orchestrator's event sink.
pub struct CounterSink {
    metrics: Arc<LifecycleMetrics>,
}

impl CounterSink {
    /// Create a sink feeding the given metrics.
    pub fn new(metrics: Arc<LifecycleMetrics>) -> Self {
        Self { metrics }
    }
}

impl EventSink for CounterSink {
    fn emit(&self, event: &FireflyEvent) -> Result<()> {
        self.metrics.record(event);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────
