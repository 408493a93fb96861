//! Firefly orchestrator: ephemeral compute that appears, works, and fades.
//!
//! Composes four collaborators behind narrow traits into the instance
//! lifecycle:
//! - a [`Provider`] that creates, watches, and destroys real servers,
//! - a [`StateStore`] holding instance records and completed sessions,
//! - an optional [`IdleDetector`] driving automatic teardown on inactivity,
//! - an optional [`StateSynchronizer`] moving an opaque working-state blob
//!   in and out of instances.
//!
//! Three operations cover the lifecycle: [`Firefly::ignite`] provisions an
//! instance and brings it to `running`, [`Firefly::fade`] tears it down and
//! records a session, and [`Firefly::sweep_orphans`] reconciles
//! provider-visible servers against tracked records. Every phase pushes a
//! [`FireflyEvent`] to the configured sink.

#![forbid(unsafe_code)]

pub mod error;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use firefly_idle::{IdleDetector, TimerIdleDetector};
use firefly_proto::{
    EventType, FireflyEvent, FireflySession, IdleConfig, IgniteOptions, ServerConfig,
    ServerInstance, ServerStatus,
};
use firefly_provision::Provider;
use firefly_store::{MemoryStore, StateStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use error::{FireflyError, FireflyResult};

/// Bound on readiness polling when no per-call override is given. Distinct
/// from `max_lifetime`: a boot that takes five minutes has failed, a session
/// that runs twelve hours has not.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Session-history page size used when callers have no better idea.
pub const DEFAULT_SESSION_LIMIT: usize = 10;

// ─── Collaborator traits ──────────────────────────────────────────────────────

/// Moves an instance's opaque working-state blob between the instance and
/// durable storage, independent of the store's structured records. Both
/// directions may fail; the orchestrator treats either failure as non-fatal
/// to the owning phase.
#[async_trait]
pub trait StateSynchronizer: Send + Sync {
    /// Pull previously saved state into a freshly ignited instance.
    async fn hydrate(&self, instance: &ServerInstance, state_key: &str) -> Result<()>;
    /// Push the instance's state out before teardown.
    async fn persist(&self, instance: &ServerInstance, state_key: &str) -> Result<()>;
}

/// Consumer lifecycle callbacks. All default to no-ops.
///
/// Unlike the event sink these are not sandboxed: a hook failure propagates
/// to the `ignite`/`fade`/`sweep_orphans` caller, even though the state
/// transition preceding the hook has already committed. Callers that observe
/// a [`FireflyError::Hook`] should treat the instance as running (ignite) or
/// terminated (fade) despite the error.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_ignite(&self, _instance: &ServerInstance) -> Result<()> {
        Ok(())
    }
    async fn on_fade(&self, _instance: &ServerInstance) -> Result<()> {
        Ok(())
    }
    async fn on_orphan_found(&self, _instance: &ServerInstance) -> Result<()> {
        Ok(())
    }
}

/// Receives every orchestrator event, synchronously, on the operation path.
///
/// Always sandboxed: an error return or a panic from `emit` is caught and
/// discarded, so a broken metrics handler can never break `ignite` or
/// `fade`. Implementations should still return quickly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &FireflyEvent) -> Result<()>;
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Wiring and defaults for a [`Firefly`] orchestrator.
///
/// Only the provider is required. An absent store falls back to
/// [`MemoryStore`]; an absent detector falls back to [`TimerIdleDetector`]
/// when `idle` is set. Idle detection is enabled if and only if `idle` is
/// set.
pub struct FireflyConfig {
    pub provider: Arc<dyn Provider>,
    pub store: Option<Arc<dyn StateStore>>,
    pub synchronizer: Option<Arc<dyn StateSynchronizer>>,
    pub detector: Option<Arc<dyn IdleDetector>>,
    pub hooks: Option<Arc<dyn LifecycleHooks>>,
    pub sink: Option<Arc<dyn EventSink>>,
    pub idle: Option<IdleConfig>,
    /// Readiness-poll bound, overridable per ignite call.
    pub ready_timeout: Duration,
    /// Default session-duration cap handed to the provider, overridable per
    /// ignite call. The orchestrator records it but does not enforce it.
    pub max_lifetime: Option<Duration>,
    /// Tags applied to every instance, merged before per-call tags.
    pub tags: Vec<String>,
    pub size: Option<String>,
    pub region: Option<String>,
    pub image: Option<String>,
    /// Name of the owning system, recorded on sessions and events.
    pub consumer: String,
}

impl FireflyConfig {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            store: None,
            synchronizer: None,
            detector: None,
            hooks: None,
            sink: None,
            idle: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            max_lifetime: None,
            tags: Vec::new(),
            size: None,
            region: None,
            image: None,
            consumer: "unknown".to_string(),
        }
    }
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

/// The orchestrator core. Construct with [`Firefly::new`]; all operations
/// take `&self` and may run concurrently for different instance ids. The
/// orchestrator holds no locks of its own and relies on the store to make
/// individual status updates atomic.
pub struct Firefly {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    synchronizer: Option<Arc<dyn StateSynchronizer>>,
    detector: Option<Arc<dyn IdleDetector>>,
    idle_config: Option<IdleConfig>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    sink: Option<Arc<dyn EventSink>>,
    ready_timeout: Duration,
    max_lifetime: Option<Duration>,
    default_tags: Vec<String>,
    default_size: Option<String>,
    default_region: Option<String>,
    default_image: Option<String>,
    consumer: String,
}

impl Firefly {
    /// Build the orchestrator and register the idle-threshold callback.
    ///
    /// Returns an `Arc` because the detector callback and any spawned
    /// auto-fade tasks need to share ownership. The callback itself holds
    /// only a weak reference, so dropping the last caller-held `Arc` stops
    /// idle triggers rather than keeping the orchestrator alive forever.
    pub fn new(config: FireflyConfig) -> Arc<Self> {
        let store = config
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn StateStore>);

        // Idle detection is driven by the presence of an idle config; a
        // detector supplied without one has nothing to monitor and is ignored.
        let (detector, idle_config) = match config.idle {
            Some(idle) => {
                let detector = config
                    .detector
                    .unwrap_or_else(|| Arc::new(TimerIdleDetector::new()) as Arc<dyn IdleDetector>);
                (Some(detector), Some(idle))
            }
            None => (None, None),
        };

        let firefly = Arc::new(Self {
            provider: config.provider,
            store,
            synchronizer: config.synchronizer,
            detector,
            idle_config,
            hooks: config.hooks,
            sink: config.sink,
            ready_timeout: config.ready_timeout,
            max_lifetime: config.max_lifetime,
            default_tags: config.tags,
            default_size: config.size,
            default_region: config.region,
            default_image: config.image,
            consumer: config.consumer,
        });

        if let Some(detector) = &firefly.detector {
            let weak = Arc::downgrade(&firefly);
            detector.on_threshold(Box::new(move |instance_id| {
                if let Some(firefly) = weak.upgrade() {
                    firefly.handle_idle_threshold(instance_id);
                }
            }));
        }

        firefly
    }

    // ─── Lifecycle: ignite ────────────────────────────────────────────────────

    /// Provision an instance and bring it to `running`.
    ///
    /// Step order is fixed: merge options, provision, overlay metadata,
    /// persist, wait for readiness, hydrate state (non-fatal), mark running,
    /// start idle monitoring, run the ignite hook, emit the `ignite` event.
    /// Fatal steps compensate before returning: a persist failure or a
    /// readiness timeout hands the fresh server a best-effort terminate so
    /// an unreachable instance is never left running.
    pub async fn ignite(&self, options: IgniteOptions) -> FireflyResult<ServerInstance> {
        let started = Instant::now();
        let config = self.merge_config(&options);
        debug!(
            provider = %config.provider,
            size = %config.size,
            region = %config.region,
            "igniting instance"
        );

        let mut instance = match self.provider.provision(&config).await {
            Ok(instance) => instance,
            Err(source) => {
                return Err(self.fail("ignite", None, FireflyError::Provision { source }));
            }
        };

        instance.overlay_metadata(&options.metadata);

        if let Err(source) = self.store.save_instance(&instance).await {
            self.cleanup(&instance, "ignite").await;
            return Err(self.fail(
                "ignite",
                Some(&instance.id),
                FireflyError::StoreWrite {
                    instance_id: instance.id.clone(),
                    source,
                },
            ));
        }

        let ready_timeout = options.ready_timeout.unwrap_or(self.ready_timeout);
        if !self.provider.wait_for_ready(&instance, ready_timeout).await {
            // Compensation, not the primary error: a failed status write here
            // must not mask the timeout.
            if let Err(error) = self
                .store
                .update_status(&instance.id, ServerStatus::Terminated)
                .await
            {
                warn!(instance_id = %instance.id, %error, "failed to mark timed-out instance terminated");
            }
            self.cleanup(&instance, "ignite").await;
            return Err(self.fail(
                "ignite",
                Some(&instance.id),
                FireflyError::ReadyTimeout {
                    instance_id: instance.id.clone(),
                    timeout_secs: ready_timeout.as_secs(),
                },
            ));
        }

        if let (Some(synchronizer), Some(state_key)) =
            (&self.synchronizer, options.state_key.as_deref())
        {
            match synchronizer.hydrate(&instance, state_key).await {
                Ok(()) => self.emit(
                    self.event(EventType::SyncCompleted)
                        .with_instance(&instance.id)
                        .with_meta("direction", "hydrate")
                        .with_meta("state_key", state_key),
                ),
                // Non-fatal: the instance is usable without restored state.
                Err(error) => {
                    warn!(instance_id = %instance.id, %error, "state hydration failed");
                    self.emit(
                        self.event(EventType::SyncFailed)
                            .with_instance(&instance.id)
                            .with_meta("direction", "hydrate")
                            .with_meta("error", &error.to_string()),
                    );
                }
            }
        }

        if let Err(source) = self
            .store
            .update_status(&instance.id, ServerStatus::Running)
            .await
        {
            return Err(self.fail(
                "ignite",
                Some(&instance.id),
                FireflyError::Store { source },
            ));
        }
        instance.status = ServerStatus::Running;

        if let (Some(detector), Some(idle_config)) = (&self.detector, &self.idle_config) {
            detector.start_monitoring(&instance.id, idle_config);
        }

        if let Some(hooks) = &self.hooks
            && let Err(source) = hooks.on_ignite(&instance).await
        {
            return Err(self.fail(
                "ignite",
                Some(&instance.id),
                FireflyError::Hook {
                    phase: "ignite",
                    instance_id: instance.id.clone(),
                    source,
                },
            ));
        }

        let mut event = self
            .event(EventType::Ignite)
            .with_instance(&instance.id)
            .with_duration(started.elapsed().as_millis() as u64)
            .with_meta("size", &config.size)
            .with_meta("region", &config.region);
        if let Some(public_ip) = &instance.public_ip {
            event = event.with_meta("public_ip", public_ip);
        }
        self.emit(event);

        info!(
            instance_id = %instance.id,
            provider = %self.provider.name(),
            duration_ms = started.elapsed().as_millis() as u64,
            "instance ignited"
        );
        Ok(instance)
    }

    // ─── Lifecycle: fade ──────────────────────────────────────────────────────

    /// Tear an instance down and record its session.
    ///
    /// Idempotent on already-terminated instances, since a consumer-initiated
    /// fade may race an idle-triggered one. State persistence is non-fatal;
    /// provider termination is fatal and leaves the instance in `terminating`
    /// on failure, never falsely terminated.
    pub async fn fade(&self, instance_id: &str, state_key: Option<&str>) -> FireflyResult<()> {
        let started = Instant::now();

        let instance = match self.store.get_instance(instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                return Err(self.fail(
                    "fade",
                    Some(instance_id),
                    FireflyError::InstanceNotFound(instance_id.to_string()),
                ));
            }
            Err(source) => {
                return Err(self.fail("fade", Some(instance_id), FireflyError::Store { source }));
            }
        };

        if instance.status == ServerStatus::Terminated {
            debug!(instance_id, "instance already terminated, fade is a no-op");
            return Ok(());
        }

        if let Err(source) = self
            .store
            .update_status(instance_id, ServerStatus::Terminating)
            .await
        {
            return Err(self.fail("fade", Some(instance_id), FireflyError::Store { source }));
        }

        if let Some(detector) = &self.detector {
            detector.stop_monitoring(instance_id);
        }

        if let (Some(synchronizer), Some(state_key)) = (&self.synchronizer, state_key) {
            self.emit(
                self.event(EventType::SyncStarted)
                    .with_instance(instance_id)
                    .with_meta("direction", "persist")
                    .with_meta("state_key", state_key),
            );
            match synchronizer.persist(&instance, state_key).await {
                Ok(()) => self.emit(
                    self.event(EventType::SyncCompleted)
                        .with_instance(instance_id)
                        .with_meta("direction", "persist")
                        .with_meta("state_key", state_key),
                ),
                // Non-fatal: a stuck sync must never block teardown.
                Err(error) => {
                    warn!(instance_id, %error, "state persistence failed, fading anyway");
                    self.emit(
                        self.event(EventType::SyncFailed)
                            .with_instance(instance_id)
                            .with_meta("direction", "persist")
                            .with_meta("error", &error.to_string()),
                    );
                }
            }
        }

        if let Err(source) = self.provider.terminate(&instance).await {
            return Err(self.fail(
                "fade",
                Some(instance_id),
                FireflyError::Terminate {
                    instance_id: instance_id.to_string(),
                    source,
                },
            ));
        }

        if let Err(source) = self
            .store
            .update_status(instance_id, ServerStatus::Terminated)
            .await
        {
            return Err(self.fail("fade", Some(instance_id), FireflyError::Store { source }));
        }

        // Session duration derives from the instance's own created_at, never
        // from anything the provider reports.
        let session = FireflySession::new(&instance, &self.consumer, Utc::now());
        let session_secs = session.duration_secs;
        if let Err(source) = self.store.log_session(&session).await {
            return Err(self.fail(
                "fade",
                Some(instance_id),
                FireflyError::StoreWrite {
                    instance_id: instance_id.to_string(),
                    source,
                },
            ));
        }

        if let Some(hooks) = &self.hooks
            && let Err(source) = hooks.on_fade(&instance).await
        {
            return Err(self.fail(
                "fade",
                Some(instance_id),
                FireflyError::Hook {
                    phase: "fade",
                    instance_id: instance_id.to_string(),
                    source,
                },
            ));
        }

        self.emit(
            self.event(EventType::Fade)
                .with_instance(instance_id)
                .with_duration(started.elapsed().as_millis() as u64)
                .with_meta("session_duration_secs", &session_secs.to_string()),
        );

        info!(instance_id, session_secs, "instance faded");
        Ok(())
    }

    // ─── Orphan reconciliation ────────────────────────────────────────────────

    /// Terminate provider-visible instances that have no tracked record.
    ///
    /// Returns every discovered orphan whether or not its termination went
    /// through; one unkillable orphan must not abort the sweep. Matching is
    /// by the provider's own server id, the only identifier both sides
    /// share.
    pub async fn sweep_orphans(&self, tags: &[String]) -> FireflyResult<Vec<ServerInstance>> {
        let cloud = match self.provider.list_active(tags).await {
            Ok(instances) => instances,
            Err(source) => return Err(self.fail("sweep", None, FireflyError::List { source })),
        };
        let tracked = match self.store.get_active_instances().await {
            Ok(instances) => instances,
            Err(source) => return Err(self.fail("sweep", None, FireflyError::Store { source })),
        };
        let tracked_ids: HashSet<&str> = tracked
            .iter()
            .map(|instance| instance.provider_server_id.as_str())
            .collect();

        let mut orphans = Vec::new();
        for instance in cloud {
            if tracked_ids.contains(instance.provider_server_id.as_str()) {
                continue;
            }

            warn!(
                instance_id = %instance.id,
                provider_server_id = %instance.provider_server_id,
                "orphan instance detected"
            );
            self.emit(
                self.event(EventType::OrphanDetected)
                    .with_instance(&instance.id)
                    .with_meta("provider_server_id", &instance.provider_server_id),
            );

            if let Some(hooks) = &self.hooks
                && let Err(source) = hooks.on_orphan_found(&instance).await
            {
                return Err(self.fail(
                    "sweep",
                    Some(&instance.id),
                    FireflyError::Hook {
                        phase: "orphan",
                        instance_id: instance.id.clone(),
                        source,
                    },
                ));
            }

            if self.cleanup(&instance, "sweep").await {
                self.emit(
                    self.event(EventType::OrphanTerminated)
                        .with_instance(&instance.id),
                );
            }

            orphans.push(instance);
        }

        if !orphans.is_empty() {
            info!(count = orphans.len(), "orphan sweep complete");
        }
        Ok(orphans)
    }

    // ─── Idle bridging ────────────────────────────────────────────────────────

    /// Reset the idle clock for an instance. No-op when idle detection is
    /// disabled.
    pub fn report_activity(&self, instance_id: &str) {
        if let Some(detector) = &self.detector {
            detector.report_activity(instance_id);
        }
    }

    /// Elapsed idle time, or zero when idle detection is disabled or the
    /// instance is unknown to the detector.
    pub fn idle_duration(&self, instance_id: &str) -> Duration {
        self.detector
            .as_ref()
            .map(|detector| detector.idle_duration(instance_id))
            .unwrap_or(Duration::ZERO)
    }

    /// Threshold callback target. Runs synchronously inside the detector's
    /// context, so the fade is spawned as a detached task: the callback must
    /// never block on teardown, and a fade failure (already surfaced via its
    /// own `error` event) must never escape the callback.
    fn handle_idle_threshold(self: &Arc<Self>, instance_id: &str) {
        info!(instance_id, "idle threshold crossed, fading instance");
        self.emit(self.event(EventType::IdleTriggered).with_instance(instance_id));

        let firefly = Arc::clone(self);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = firefly.fade(&instance_id, None).await {
                debug!(instance_id = %instance_id, %error, "idle-triggered fade failed");
            }
        });
    }

    // ─── State access ─────────────────────────────────────────────────────────

    pub async fn get_instance(&self, instance_id: &str) -> FireflyResult<Option<ServerInstance>> {
        self.store
            .get_instance(instance_id)
            .await
            .map_err(|source| FireflyError::Store { source })
    }

    /// All tracked instances that have not reached `terminated`.
    pub async fn active_instances(&self) -> FireflyResult<Vec<ServerInstance>> {
        self.store
            .get_active_instances()
            .await
            .map_err(|source| FireflyError::Store { source })
    }

    /// Completed sessions, newest first. [`DEFAULT_SESSION_LIMIT`] is a
    /// reasonable `limit` for dashboards.
    pub async fn recent_sessions(&self, limit: usize) -> FireflyResult<Vec<FireflySession>> {
        self.store
            .get_recent_sessions(limit)
            .await
            .map_err(|source| FireflyError::Store { source })
    }

    // ─── Internal ─────────────────────────────────────────────────────────────

    /// Fold per-call options over orchestrator defaults. Default tags come
    /// first so per-call tags read as refinements; consumer metadata is
    /// overlaid later, directly onto the provisioned instance.
    fn merge_config(&self, options: &IgniteOptions) -> ServerConfig {
        let mut tags = self.default_tags.clone();
        tags.extend(options.tags.iter().cloned());

        ServerConfig {
            provider: self.provider.name().to_string(),
            size: options
                .size
                .clone()
                .or_else(|| self.default_size.clone())
                .unwrap_or_default(),
            region: options
                .region
                .clone()
                .or_else(|| self.default_region.clone())
                .unwrap_or_default(),
            image: options
                .image
                .clone()
                .or_else(|| self.default_image.clone())
                .unwrap_or_default(),
            user_data: options.user_data.clone(),
            ssh_keys: options.ssh_keys.clone(),
            tags,
            max_lifetime: options.max_lifetime.or(self.max_lifetime),
            provider_options: options.provider_options.clone(),
        }
    }

    fn event(&self, event_type: EventType) -> FireflyEvent {
        FireflyEvent::new(event_type)
            .with_provider(self.provider.name())
            .with_consumer(&self.consumer)
    }

    /// Hand an event to the sink inside a sandbox. Observability must never
    /// break the control path, so an error return or a panic from the sink
    /// is logged and discarded.
    fn emit(&self, event: FireflyEvent) {
        let Some(sink) = &self.sink else { return };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.emit(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(event_type = %event.event_type, %error, "event sink rejected event");
            }
            Err(_) => {
                debug!(event_type = %event.event_type, "event sink panicked");
            }
        }
    }

    /// Emit the `error` event that precedes every fatal failure, then hand
    /// the error back for returning.
    fn fail(&self, phase: &str, instance_id: Option<&str>, error: FireflyError) -> FireflyError {
        let mut event = self
            .event(EventType::Error)
            .with_meta("phase", phase)
            .with_meta("error", &error.to_string());
        if let Some(instance_id) = instance_id {
            event = event.with_instance(instance_id);
        }
        self.emit(event);
        error
    }

    /// Best-effort compensating terminate. Runs inside its own error
    /// boundary: a secondary failure is logged, never allowed to mask the
    /// primary error being handled. Returns whether the terminate went
    /// through, which the sweep uses to decide on `orphan_terminated`.
    async fn cleanup(&self, instance: &ServerInstance, phase: &str) -> bool {
        match self.provider.terminate(instance).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    instance_id = %instance.id,
                    phase,
                    %error,
                    "best-effort cleanup terminate failed"
                );
                false
            }
        }
    }
}

// ─── Periodic sweeper ─────────────────────────────────────────────────────────

/// Spawn a detached task that runs [`Firefly::sweep_orphans`] every
/// `interval`, starting immediately. Sweep failures are logged and the loop
/// keeps going; abort the returned handle to stop it.
pub fn spawn_sweeper(
    firefly: Arc<Firefly>,
    tags: Vec<String>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match firefly.sweep_orphans(&tags).await {
                Ok(orphans) if !orphans.is_empty() => {
                    info!(count = orphans.len(), "sweeper cleaned up orphan instances");
                }
                Ok(_) => {}
                Err(error) => error!(%error, "orphan sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct NullProvider;

    #[async_trait]
    impl Provider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        async fn provision(&self, _config: &ServerConfig) -> Result<ServerInstance> {
            anyhow::bail!("null provider cannot provision")
        }
        async fn wait_for_ready(&self, _instance: &ServerInstance, _timeout: Duration) -> bool {
            false
        }
        async fn terminate(&self, _instance: &ServerInstance) -> Result<()> {
            Ok(())
        }
        async fn list_active(&self, _tags: &[String]) -> Result<Vec<ServerInstance>> {
            Ok(Vec::new())
        }
    }

    /// Counts `list_active` calls and fails exactly the first one.
    #[derive(Debug, Default)]
    struct CountingProvider {
        list_calls: AtomicUsize,
        fail_first_list: AtomicBool,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        async fn provision(&self, _config: &ServerConfig) -> Result<ServerInstance> {
            anyhow::bail!("not under test")
        }
        async fn wait_for_ready(&self, _instance: &ServerInstance, _timeout: Duration) -> bool {
            true
        }
        async fn terminate(&self, _instance: &ServerInstance) -> Result<()> {
            Ok(())
        }
        async fn list_active(&self, _tags: &[String]) -> Result<Vec<ServerInstance>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_list.swap(false, Ordering::SeqCst) {
                anyhow::bail!("provider api unavailable");
            }
            Ok(Vec::new())
        }
    }

    #[derive(Debug, Default)]
    struct VecSink(Mutex<Vec<FireflyEvent>>);

    impl EventSink for VecSink {
        fn emit(&self, event: &FireflyEvent) -> Result<()> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    struct PanicSink;

    impl EventSink for PanicSink {
        fn emit(&self, _event: &FireflyEvent) -> Result<()> {
            panic!("sink exploded");
        }
    }

    fn bare_firefly() -> Arc<Firefly> {
        Firefly::new(FireflyConfig::new(Arc::new(NullProvider)))
    }

    #[test]
    fn test_config_defaults() {
        let config = FireflyConfig::new(Arc::new(NullProvider));
        assert_eq!(config.ready_timeout, Duration::from_secs(300));
        assert_eq!(config.consumer, "unknown");
        assert!(config.store.is_none());
        assert!(config.idle.is_none());
        assert!(config.tags.is_empty());
    }

    #[test]
    fn test_merge_config_falls_back_to_defaults() {
        let mut config = FireflyConfig::new(Arc::new(NullProvider));
        config.size = Some("cx22".to_string());
        config.region = Some("nbg1".to_string());
        config.image = Some("debian-12".to_string());
        config.tags = vec!["firefly".to_string()];
        config.max_lifetime = Some(Duration::from_secs(3600));
        let firefly = Firefly::new(config);

        let merged = firefly.merge_config(&IgniteOptions::default());
        assert_eq!(merged.provider, "null");
        assert_eq!(merged.size, "cx22");
        assert_eq!(merged.region, "nbg1");
        assert_eq!(merged.image, "debian-12");
        assert_eq!(merged.tags, vec!["firefly".to_string()]);
        assert_eq!(merged.max_lifetime, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_merge_config_call_options_win() {
        let mut config = FireflyConfig::new(Arc::new(NullProvider));
        config.size = Some("cx22".to_string());
        config.tags = vec!["firefly".to_string()];
        let firefly = Firefly::new(config);

        let options = IgniteOptions {
            size: Some("cx32".to_string()),
            region: Some("fsn1".to_string()),
            tags: vec!["env=ci".to_string()],
            max_lifetime: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let merged = firefly.merge_config(&options);
        assert_eq!(merged.size, "cx32");
        assert_eq!(merged.region, "fsn1");
        // Default tags come first, call tags after.
        assert_eq!(merged.tags, vec!["firefly".to_string(), "env=ci".to_string()]);
        assert_eq!(merged.max_lifetime, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_fail_emits_error_event_first() {
        let sink = Arc::new(VecSink::default());
        let mut config = FireflyConfig::new(Arc::new(NullProvider));
        config.sink = Some(sink.clone());
        config.consumer = "test".to_string();
        let firefly = Firefly::new(config);

        let error = firefly.fail(
            "fade",
            Some("fly-1"),
            FireflyError::InstanceNotFound("fly-1".to_string()),
        );
        assert!(matches!(error, FireflyError::InstanceNotFound(_)));

        let events = sink.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].instance_id.as_deref(), Some("fly-1"));
        assert_eq!(events[0].provider.as_deref(), Some("null"));
        assert_eq!(events[0].consumer.as_deref(), Some("test"));
        assert_eq!(events[0].metadata.get("phase").map(String::as_str), Some("fade"));
        assert!(events[0].metadata.contains_key("error"));
    }

    #[test]
    fn test_emit_swallows_sink_panic() {
        let mut config = FireflyConfig::new(Arc::new(NullProvider));
        config.sink = Some(Arc::new(PanicSink));
        let firefly = Firefly::new(config);

        // Must not unwind into the caller.
        firefly.emit(firefly.event(EventType::Ignite));
    }

    #[test]
    fn test_emit_without_sink_is_noop() {
        let firefly = bare_firefly();
        firefly.emit(firefly.event(EventType::Fade));
    }

    #[test]
    fn test_idle_accessors_without_detector() {
        let firefly = bare_firefly();
        firefly.report_activity("fly-1");
        assert_eq!(firefly.idle_duration("fly-1"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_keeps_ticking_after_a_failed_sweep() {
        let provider = Arc::new(CountingProvider::default());
        provider.fail_first_list.store(true, Ordering::SeqCst);
        let firefly = Firefly::new(FireflyConfig::new(provider.clone()));

        let handle = spawn_sweeper(firefly, vec!["firefly".to_string()], Duration::from_secs(60));

        // First tick fires immediately and fails.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);

        // The loop must survive the failure and tick again.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 2);

        handle.abort();
    }
}
