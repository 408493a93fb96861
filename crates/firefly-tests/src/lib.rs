//! Scripted mock collaborators for driving the Firefly orchestrator in tests.
//!
//! Every mock records the calls it receives and exposes failure switches so
//! individual lifecycle steps can be made to fail on demand. Everything is
//! deterministic: instance ids count up from zero and no real I/O happens.

#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use firefly::{EventSink, LifecycleHooks, StateSynchronizer};
use firefly_idle::{IdleDetector, ThresholdCallback};
use firefly_proto::{
    EventType, FireflyEvent, FireflySession, IdleConfig, ServerConfig, ServerInstance,
    ServerStatus,
};
use firefly_provision::Provider;
use firefly_store::{MemoryStore, StateStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// A plain running instance for store and sweep scenarios.
pub fn instance(id: &str, provider_server_id: &str) -> ServerInstance {
    ServerInstance {
        id: id.to_string(),
        provider_server_id: provider_server_id.to_string(),
        provider: "mock".to_string(),
        status: ServerStatus::Running,
        created_at: Utc::now(),
        public_ip: Some("203.0.113.10".to_string()),
        metadata: HashMap::new(),
    }
}

// ─── Mock Provider ────────────────────────────────────────────────────────────

/// Provider double with deterministic ids (`fly-0`, `fly-1`, ...) and
/// per-operation failure switches. `list_active` returns whatever tests put
/// into `active`.
#[derive(Debug)]
pub struct MockProvider {
    next_id: AtomicUsize,
    pub provision_calls: AtomicUsize,
    pub terminate_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub fail_provision: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub fail_list: AtomicBool,
    /// What `wait_for_ready` reports. Defaults to ready.
    pub ready: AtomicBool,
    /// Instances reported by `list_active`.
    pub active: Mutex<Vec<ServerInstance>>,
    /// Ids whose terminate call succeeded, in order.
    pub terminated_ids: Mutex<Vec<String>>,
    /// Every merged config handed to `provision`.
    pub configs: Mutex<Vec<ServerConfig>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            provision_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            fail_provision: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            active: Mutex::new(Vec::new()),
            terminated_ids: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn provision(&self, config: &ServerConfig) -> Result<ServerInstance> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().push(config.clone());
        if self.fail_provision.load(Ordering::SeqCst) {
            bail!("mock provision refused");
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ServerInstance {
            id: format!("fly-{n}"),
            provider_server_id: format!("srv-{n}"),
            provider: "mock".to_string(),
            status: ServerStatus::Running,
            created_at: Utc::now(),
            public_ip: Some("203.0.113.10".to_string()),
            metadata: HashMap::from([
                ("size".to_string(), config.size.clone()),
                ("region".to_string(), config.region.clone()),
            ]),
        })
    }

    async fn wait_for_ready(&self, _instance: &ServerInstance, _timeout: Duration) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn terminate(&self, instance: &ServerInstance) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            bail!("mock terminate refused");
        }
        self.terminated_ids.lock().push(instance.id.clone());
        Ok(())
    }

    async fn list_active(&self, _tags: &[String]) -> Result<Vec<ServerInstance>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            bail!("mock list refused");
        }
        Ok(self.active.lock().clone())
    }
}

// ─── Mock Store ───────────────────────────────────────────────────────────────

/// Wraps [`MemoryStore`] with injectable write failures. Reads always pass
/// through.
#[derive(Debug, Default)]
pub struct MockStore {
    inner: MemoryStore,
    pub fail_save: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_log_session: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MockStore {
    async fn save_instance(&self, instance: &ServerInstance) -> Result<()> {
        if self.fail_save.load(Ordering::SeqCst) {
            bail!("mock store rejected save");
        }
        self.inner.save_instance(instance).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServerInstance>> {
        self.inner.get_instance(instance_id).await
    }

    async fn update_status(&self, instance_id: &str, status: ServerStatus) -> Result<()> {
        if self.fail_update.load(Ordering::SeqCst) {
            bail!("mock store rejected status update");
        }
        self.inner.update_status(instance_id, status).await
    }

    async fn get_active_instances(&self) -> Result<Vec<ServerInstance>> {
        self.inner.get_active_instances().await
    }

    async fn log_session(&self, session: &FireflySession) -> Result<()> {
        if self.fail_log_session.load(Ordering::SeqCst) {
            bail!("mock store rejected session");
        }
        self.inner.log_session(session).await
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<FireflySession>> {
        self.inner.get_recent_sessions(limit).await
    }
}

// ─── Recording Sink ───────────────────────────────────────────────────────────

/// Event sink capturing everything emitted, with switches to misbehave: a
/// failing sink records the event and then errors, a panicking sink panics
/// before recording anything.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FireflyEvent>>,
    pub fail: AtomicBool,
    pub panic: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FireflyEvent> {
        self.events.lock().clone()
    }

    /// Event types in emission order.
    pub fn types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<FireflyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &FireflyEvent) -> Result<()> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("recording sink instructed to panic");
        }
        self.events.lock().push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            bail!("recording sink instructed to fail");
        }
        Ok(())
    }
}

// ─── Manual Idle Detector ─────────────────────────────────────────────────────

/// Idle detector driven entirely by the test: [`ManualIdleDetector::fire`]
/// invokes the registered threshold callback synchronously, standing in for
/// a timer crossing the threshold.
#[derive(Default)]
pub struct ManualIdleDetector {
    callback: OnceLock<ThresholdCallback>,
    pub monitored: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub activity: Mutex<Vec<String>>,
}

impl ManualIdleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Act as if `instance_id` crossed its idle threshold.
    ///
    /// Panics if no callback was registered, which means the orchestrator
    /// was built without an idle config.
    pub fn fire(&self, instance_id: &str) {
        let callback = self
            .callback
            .get()
            .expect("no threshold callback registered");
        callback(instance_id);
    }

    /// Monitored and not since stopped.
    pub fn is_monitoring(&self, instance_id: &str) -> bool {
        self.monitored.lock().iter().any(|id| id == instance_id)
            && !self.stopped.lock().iter().any(|id| id == instance_id)
    }
}

impl IdleDetector for ManualIdleDetector {
    fn start_monitoring(&self, instance_id: &str, _config: &IdleConfig) {
        self.monitored.lock().push(instance_id.to_string());
    }

    fn stop_monitoring(&self, instance_id: &str) {
        self.stopped.lock().push(instance_id.to_string());
    }

    fn report_activity(&self, instance_id: &str) {
        self.activity.lock().push(instance_id.to_string());
    }

    fn idle_duration(&self, _instance_id: &str) -> Duration {
        Duration::ZERO
    }

    fn on_threshold(&self, callback: ThresholdCallback) {
        let _ = self.callback.set(callback);
    }
}

// ─── Mock Synchronizer ────────────────────────────────────────────────────────

/// State synchronizer recording `(instance_id, state_key)` pairs for both
/// directions, with independent failure switches.
#[derive(Debug, Default)]
pub struct MockSynchronizer {
    pub fail_hydrate: AtomicBool,
    pub fail_persist: AtomicBool,
    pub hydrated: Mutex<Vec<(String, String)>>,
    pub persisted: Mutex<Vec<(String, String)>>,
}

impl MockSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateSynchronizer for MockSynchronizer {
    async fn hydrate(&self, instance: &ServerInstance, state_key: &str) -> Result<()> {
        if self.fail_hydrate.load(Ordering::SeqCst) {
            bail!("mock hydrate refused");
        }
        self.hydrated
            .lock()
            .push((instance.id.clone(), state_key.to_string()));
        Ok(())
    }

    async fn persist(&self, instance: &ServerInstance, state_key: &str) -> Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            bail!("mock persist refused");
        }
        self.persisted
            .lock()
            .push((instance.id.clone(), state_key.to_string()));
        Ok(())
    }
}

// ─── Recording Hooks ──────────────────────────────────────────────────────────

/// Lifecycle hooks recording which instances they saw, with a failure
/// switch per callback.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub fail_ignite: AtomicBool,
    pub fail_fade: AtomicBool,
    pub fail_orphan: AtomicBool,
    pub ignited: Mutex<Vec<String>>,
    pub faded: Mutex<Vec<String>>,
    pub orphans: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn on_ignite(&self, instance: &ServerInstance) -> Result<()> {
        if self.fail_ignite.load(Ordering::SeqCst) {
            bail!("ignite hook refused");
        }
        self.ignited.lock().push(instance.id.clone());
        Ok(())
    }

    async fn on_fade(&self, instance: &ServerInstance) -> Result<()> {
        if self.fail_fade.load(Ordering::SeqCst) {
            bail!("fade hook refused");
        }
        self.faded.lock().push(instance.id.clone());
        Ok(())
    }

    async fn on_orphan_found(&self, instance: &ServerInstance) -> Result<()> {
        if self.fail_orphan.load(Ordering::SeqCst) {
            bail!("orphan hook refused");
        }
        self.orphans.lock().push(instance.id.clone());
        Ok(())
    }
}
