//! Idle-activity detection for Firefly instances.
//!
//! Provides the [`IdleDetector`] collaborator trait and [`TimerIdleDetector`],
//! which runs one lightweight tokio task per monitored instance and fires the
//! registered callback once an instance has been inactive past its threshold.

#![forbid(unsafe_code)]

use firefly_proto::IdleConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Invoked with the instance id when its idle threshold is crossed.
pub type ThresholdCallback = Box<dyn Fn(&str) + Send + Sync>;

// ─── Detector trait ───────────────────────────────────────────────────────────

/// Per-instance activity clock with a single threshold-crossing callback.
///
/// The callback is invoked from within a tokio runtime context (the timer
/// implementation fires it from its monitoring task), so implementations of
/// the callback may spawn follow-up work.
pub trait IdleDetector: Send + Sync {
    fn start_monitoring(&self, instance_id: &str, config: &IdleConfig);
    fn stop_monitoring(&self, instance_id: &str);
    /// Reset the idle clock for an instance. No-op if the instance is not
    /// monitored.
    fn report_activity(&self, instance_id: &str);
    /// Elapsed idle time, or zero if the instance is unknown.
    fn idle_duration(&self, instance_id: &str) -> Duration;
    /// Register the threshold callback. First write wins; the orchestrator
    /// registers exactly once at construction.
    fn on_threshold(&self, callback: ThresholdCallback);
}

// ─── Timer implementation ─────────────────────────────────────────────────────

struct Watch {
    last_activity: Instant,
    config: IdleConfig,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    watches: Mutex<HashMap<String, Watch>>,
    callback: OnceLock<ThresholdCallback>,
}

/// Timer-backed detector: one spawned interval task per monitored instance,
/// checking elapsed idle time every `check_interval`. A watch that crosses
/// its threshold fires the callback once, removes itself, and ends its task.
pub struct TimerIdleDetector {
    inner: Arc<Inner>,
}

impl TimerIdleDetector {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner::default()) }
    }

    /// Number of instances currently monitored.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.lock().len()
    }
}

impl Default for TimerIdleDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleDetector for TimerIdleDetector {
    fn start_monitoring(&self, instance_id: &str, config: &IdleConfig) {
        debug!(
            instance_id = %instance_id,
            threshold_secs = config.idle_threshold.as_secs(),
            check_secs = config.check_interval.as_secs(),
            signals = ?config.signals,
            "starting idle monitoring"
        );

        let mut watches = self.inner.watches.lock();
        // Replace any previous watch for this id.
        if let Some(old) = watches.remove(instance_id)
            && let Some(task) = old.task
        {
            task.abort();
        }

        let inner = Arc::clone(&self.inner);
        let id = instance_id.to_string();
        let check_interval = config.check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            // The first tick completes immediately; consume it so the first
            // real check happens one interval after monitoring starts.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let crossed = {
                    let mut watches = inner.watches.lock();
                    match watches.get(&id) {
                        Some(watch) if watch.last_activity.elapsed() >= watch.config.idle_threshold => {
                            watches.remove(&id);
                            true
                        }
                        Some(_) => false,
                        None => return,
                    }
                };
                if crossed {
                    info!(instance_id = %id, "idle threshold crossed");
                    if let Some(callback) = inner.callback.get() {
                        callback(&id);
                    }
                    return;
                }
            }
        });

        watches.insert(
            instance_id.to_string(),
            Watch { last_activity: Instant::now(), config: config.clone(), task: Some(handle) },
        );
    }

    fn stop_monitoring(&self, instance_id: &str) {
        let mut watches = self.inner.watches.lock();
        if let Some(watch) = watches.remove(instance_id) {
            if let Some(task) = watch.task {
                task.abort();
            }
            debug!(instance_id = %instance_id, "stopped idle monitoring");
        }
    }

    fn report_activity(&self, instance_id: &str) {
        if let Some(watch) = self.inner.watches.lock().get_mut(instance_id) {
            watch.last_activity = Instant::now();
        }
    }

    fn idle_duration(&self, instance_id: &str) -> Duration {
        self.inner
            .watches
            .lock()
            .get(instance_id)
            .map(|watch| watch.last_activity.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn on_threshold(&self, callback: ThresholdCallback) {
        if self.inner.callback.set(callback).is_err() {
            warn!("idle threshold callback already registered, ignoring");
        }
    }
}

impl Drop for TimerIdleDetector {
    fn drop(&mut self) {
        let mut watches = self.inner.watches.lock();
        for (_, watch) in watches.drain() {
            if let Some(task) = watch.task {
                task.abort();
            }
        }
    }
}
