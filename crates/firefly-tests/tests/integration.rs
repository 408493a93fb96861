//! Integration tests for the Firefly lifecycle.
//!
//! These tests drive the orchestrator end to end with scripted mocks:
//! - ignite → running, with defaults merged and consumer metadata overlaid
//! - fade → terminated, with exactly one recorded session
//! - idle threshold → automatic fade, manual and real-timer variants
//! - orphan sweeps reconciling provider state against the store
//! - the emitted event stream as consumed by the observe crate

use firefly::{DEFAULT_SESSION_LIMIT, Firefly, FireflyConfig, spawn_sweeper};
use firefly_observe::{CounterSink, EventLog, LifecycleMetrics};
use firefly_proto::{EventType, IdleConfig, IgniteOptions, ServerStatus, SessionStatus};
use firefly_tests::{
    ManualIdleDetector, MockProvider, MockStore, MockSynchronizer, RecordingHooks, RecordingSink,
    instance,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

// ─── Helpers ──────────────────────────────────────────────────────────────────

struct Rig {
    provider: Arc<MockProvider>,
    sink: Arc<RecordingSink>,
    hooks: Arc<RecordingHooks>,
    synchronizer: Arc<MockSynchronizer>,
    detector: Arc<ManualIdleDetector>,
    firefly: Arc<Firefly>,
}

/// Orchestrator wired with every mock collaborator and sensible defaults.
fn rig() -> Rig {
    let provider = Arc::new(MockProvider::new());
    let sink = Arc::new(RecordingSink::new());
    let hooks = Arc::new(RecordingHooks::new());
    let synchronizer = Arc::new(MockSynchronizer::new());
    let detector = Arc::new(ManualIdleDetector::new());

    let mut config = FireflyConfig::new(provider.clone());
    config.store = Some(Arc::new(MockStore::new()));
    config.sink = Some(sink.clone());
    config.hooks = Some(hooks.clone());
    config.synchronizer = Some(synchronizer.clone());
    config.detector = Some(detector.clone());
    config.idle = Some(IdleConfig::default());
    config.consumer = "buildbot".to_string();
    config.size = Some("cx22".to_string());
    config.region = Some("nbg1".to_string());
    config.image = Some("debian-12".to_string());
    config.tags = vec!["managed_by=firefly".to_string()];

    let firefly = Firefly::new(config);
    Rig {
        provider,
        sink,
        hooks,
        synchronizer,
        detector,
        firefly,
    }
}

// ─── Test 1: Ignite provisions, persists, and returns a running instance ──────

#[tokio::test]
async fn test_ignite_provisions_and_runs() {
    let rig = rig();
    let instance = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();

    assert_eq!(instance.id, "fly-0");
    assert_eq!(instance.status, ServerStatus::Running);
    assert_eq!(rig.provider.provision_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        instance.metadata.get("size").map(String::as_str),
        Some("cx22"),
        "orchestrator default size must reach the provider"
    );

    let stored = rig.firefly.get_instance("fly-0").await.unwrap().unwrap();
    assert_eq!(stored.status, ServerStatus::Running);
    assert!(rig.detector.is_monitoring("fly-0"));
    assert_eq!(rig.hooks.ignited.lock().clone(), vec!["fly-0".to_string()]);
}

// ─── Test 2: Ignite emits exactly one ignite event with config fields ─────────

#[tokio::test]
async fn test_ignite_emits_single_ignite_event() {
    let rig = rig();
    rig.firefly.ignite(IgniteOptions::default()).await.unwrap();

    assert_eq!(rig.sink.types(), vec![EventType::Ignite]);
    let event = &rig.sink.of_type(EventType::Ignite)[0];
    assert_eq!(event.instance_id.as_deref(), Some("fly-0"));
    assert_eq!(event.provider.as_deref(), Some("mock"));
    assert_eq!(event.consumer.as_deref(), Some("buildbot"));
    assert!(event.duration_ms.is_some(), "ignite event carries elapsed time");
    assert_eq!(event.metadata.get("size").map(String::as_str), Some("cx22"));
    assert_eq!(event.metadata.get("region").map(String::as_str), Some("nbg1"));
    assert_eq!(
        event.metadata.get("public_ip").map(String::as_str),
        Some("203.0.113.10")
    );
}

// ─── Test 3: Per-call options override orchestrator defaults ──────────────────

#[tokio::test]
async fn test_ignite_applies_call_overrides() {
    let rig = rig();
    let options = IgniteOptions {
        size: Some("cx32".to_string()),
        region: Some("fsn1".to_string()),
        tags: vec!["job=ci".to_string()],
        user_data: Some("#cloud-config\n".to_string()),
        ssh_keys: vec!["ops-key".to_string()],
        max_lifetime: Some(Duration::from_secs(3600)),
        ..Default::default()
    };
    rig.firefly.ignite(options).await.unwrap();

    let config = rig.provider.configs.lock()[0].clone();
    assert_eq!(config.size, "cx32");
    assert_eq!(config.region, "fsn1");
    assert_eq!(config.image, "debian-12", "unset fields fall back to defaults");
    assert_eq!(
        config.tags,
        vec!["managed_by=firefly".to_string(), "job=ci".to_string()],
        "default tags come first, call tags after"
    );
    assert_eq!(config.user_data.as_deref(), Some("#cloud-config\n"));
    assert_eq!(config.ssh_keys, vec!["ops-key".to_string()]);
    assert_eq!(config.max_lifetime, Some(Duration::from_secs(3600)));
}

// ─── Test 4: Consumer metadata overlays provider metadata ─────────────────────

#[tokio::test]
async fn test_ignite_overlays_consumer_metadata() {
    let rig = rig();
    let options = IgniteOptions {
        metadata: HashMap::from([
            ("size".to_string(), "custom".to_string()),
            ("purpose".to_string(), "ci".to_string()),
        ]),
        ..Default::default()
    };
    let instance = rig.firefly.ignite(options).await.unwrap();

    assert_eq!(
        instance.metadata.get("size").map(String::as_str),
        Some("custom"),
        "consumer metadata wins on collision"
    );
    assert_eq!(instance.metadata.get("purpose").map(String::as_str), Some("ci"));
    assert_eq!(instance.metadata.get("region").map(String::as_str), Some("nbg1"));

    let stored = rig.firefly.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(
        stored.metadata.get("purpose").map(String::as_str),
        Some("ci"),
        "overlay must happen before persistence"
    );
}

// ─── Test 5: Ignite hydrates state when a state key is supplied ───────────────

#[tokio::test]
async fn test_ignite_hydrates_state() {
    let rig = rig();
    let options = IgniteOptions {
        state_key: Some("proj-42".to_string()),
        ..Default::default()
    };
    rig.firefly.ignite(options).await.unwrap();

    assert_eq!(
        rig.synchronizer.hydrated.lock().clone(),
        vec![("fly-0".to_string(), "proj-42".to_string())]
    );
    assert_eq!(rig.sink.types(), vec![EventType::SyncCompleted, EventType::Ignite]);
    let sync = &rig.sink.of_type(EventType::SyncCompleted)[0];
    assert_eq!(sync.metadata.get("direction").map(String::as_str), Some("hydrate"));
    assert_eq!(sync.metadata.get("state_key").map(String::as_str), Some("proj-42"));
}

// ─── Test 6: Fade terminates, stops monitoring, and records a session ─────────

#[tokio::test]
async fn test_fade_terminates_and_records_session() {
    let rig = rig();
    let instance = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
    rig.firefly.fade(&instance.id, None).await.unwrap();

    let stored = rig.firefly.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServerStatus::Terminated);
    assert_eq!(
        rig.provider.terminated_ids.lock().clone(),
        vec!["fly-0".to_string()]
    );
    assert!(!rig.detector.is_monitoring("fly-0"));
    assert_eq!(rig.hooks.faded.lock().clone(), vec!["fly-0".to_string()]);

    let sessions = rig.firefly.recent_sessions(DEFAULT_SESSION_LIMIT).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.instance_id, "fly-0");
    assert_eq!(session.consumer, "buildbot");
    assert_eq!(session.provider, "mock");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.size.as_deref(), Some("cx22"));
    assert!(session.duration_secs <= 1, "session just started and ended");

    assert_eq!(rig.sink.types(), vec![EventType::Ignite, EventType::Fade]);
    let fade = &rig.sink.of_type(EventType::Fade)[0];
    assert!(fade.metadata.contains_key("session_duration_secs"));
}

// ─── Test 7: Fade persists state before terminating ───────────────────────────

#[tokio::test]
async fn test_fade_persists_state() {
    let rig = rig();
    let instance = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
    rig.firefly.fade(&instance.id, Some("proj-42")).await.unwrap();

    assert_eq!(
        rig.synchronizer.persisted.lock().clone(),
        vec![("fly-0".to_string(), "proj-42".to_string())]
    );
    assert_eq!(
        rig.sink.types(),
        vec![
            EventType::Ignite,
            EventType::SyncStarted,
            EventType::SyncCompleted,
            EventType::Fade,
        ],
        "persist announces itself before running"
    );
}

// ─── Test 8: Fade on a terminated instance is a no-op ─────────────────────────

#[tokio::test]
async fn test_fade_is_idempotent() {
    let rig = rig();
    let instance = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
    rig.firefly.fade(&instance.id, None).await.unwrap();
    rig.firefly.fade(&instance.id, None).await.unwrap();

    assert_eq!(
        rig.provider.terminate_calls.load(Ordering::SeqCst),
        1,
        "second fade must not touch the provider"
    );
    let sessions = rig.firefly.recent_sessions(DEFAULT_SESSION_LIMIT).await.unwrap();
    assert_eq!(sessions.len(), 1, "second fade must not write a second session");
    assert_eq!(rig.sink.of_type(EventType::Fade).len(), 1);
}

// ─── Test 9: Manual idle trigger fades the instance ───────────────────────────

#[tokio::test(start_paused = true)]
async fn test_idle_threshold_fades_instance() {
    let rig = rig();
    rig.firefly.ignite(IgniteOptions::default()).await.unwrap();

    rig.detector.fire("fly-0");
    // The fade runs on a detached task; yield until it has committed.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let stored = rig.firefly.get_instance("fly-0").await.unwrap().unwrap();
    assert_eq!(stored.status, ServerStatus::Terminated);
    assert_eq!(
        rig.sink.types(),
        vec![EventType::Ignite, EventType::IdleTriggered, EventType::Fade]
    );
    let sessions = rig.firefly.recent_sessions(DEFAULT_SESSION_LIMIT).await.unwrap();
    assert_eq!(sessions.len(), 1);
}

// ─── Test 10: Timer-based detector auto-fades after real inactivity ───────────

#[tokio::test(start_paused = true)]
async fn test_timer_idle_detector_auto_fades() {
    let provider = Arc::new(MockProvider::new());
    let sink = Arc::new(RecordingSink::new());
    let mut config = FireflyConfig::new(provider.clone());
    config.sink = Some(sink.clone());
    config.idle = Some(IdleConfig {
        check_interval: Duration::from_secs(5),
        idle_threshold: Duration::from_secs(30),
        signals: Vec::new(),
    });
    // No detector supplied: the timer-based default takes over.
    let firefly = Firefly::new(config);

    let instance = firefly.ignite(IgniteOptions::default()).await.unwrap();

    // Activity at t+10 resets the idle clock, so t+30 is still quiet time.
    tokio::time::sleep(Duration::from_secs(10)).await;
    firefly.report_activity(&instance.id);
    tokio::time::sleep(Duration::from_secs(20)).await;
    let stored = firefly.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(
        stored.status,
        ServerStatus::Running,
        "activity must reset the idle clock"
    );

    // Forty silent seconds cross the 30s threshold.
    tokio::time::sleep(Duration::from_secs(40)).await;
    let stored = firefly.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServerStatus::Terminated);
    assert_eq!(sink.of_type(EventType::IdleTriggered).len(), 1);
    assert_eq!(sink.of_type(EventType::Fade).len(), 1);
}

// ─── Test 11: Sweep terminates untracked provider instances ───────────────────

#[tokio::test]
async fn test_sweep_terminates_orphans() {
    let rig = rig();
    let tracked = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
    let ghost = instance("fly-ghost", "srv-ghost");
    rig.provider.active.lock().extend([tracked, ghost]);

    let orphans = rig
        .firefly
        .sweep_orphans(&["managed_by=firefly".to_string()])
        .await
        .unwrap();

    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, "fly-ghost");
    assert_eq!(
        rig.provider.terminated_ids.lock().clone(),
        vec!["fly-ghost".to_string()],
        "tracked instances must be left alone"
    );
    assert_eq!(rig.hooks.orphans.lock().clone(), vec!["fly-ghost".to_string()]);

    let detected = rig.sink.of_type(EventType::OrphanDetected);
    assert_eq!(detected.len(), 1);
    assert_eq!(
        detected[0].metadata.get("provider_server_id").map(String::as_str),
        Some("srv-ghost")
    );
    assert_eq!(rig.sink.of_type(EventType::OrphanTerminated).len(), 1);
}

// ─── Test 12: Sweep with nothing untracked does nothing ───────────────────────

#[tokio::test]
async fn test_sweep_leaves_tracked_instances_alone() {
    let rig = rig();
    let tracked = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
    rig.provider.active.lock().push(tracked);

    let orphans = rig.firefly.sweep_orphans(&[]).await.unwrap();

    assert!(orphans.is_empty());
    assert_eq!(rig.provider.terminate_calls.load(Ordering::SeqCst), 0);
    assert!(rig.sink.of_type(EventType::OrphanDetected).is_empty());
}

// ─── Test 13: The sweeper task cleans up on its own ───────────────────────────

#[tokio::test(start_paused = true)]
async fn test_spawn_sweeper_cleans_up_periodically() {
    let rig = rig();
    rig.provider.active.lock().push(instance("fly-ghost", "srv-ghost"));

    let handle = spawn_sweeper(
        rig.firefly.clone(),
        vec!["managed_by=firefly".to_string()],
        Duration::from_secs(300),
    );
    // First sweep fires immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        rig.provider.terminated_ids.lock().clone(),
        vec!["fly-ghost".to_string()]
    );
    handle.abort();
}

// ─── Test 14: Recent sessions are newest first and respect the limit ──────────

#[tokio::test]
async fn test_recent_sessions_newest_first() {
    let rig = rig();
    for _ in 0..3 {
        let instance = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
        rig.firefly.fade(&instance.id, None).await.unwrap();
    }

    let latest = rig.firefly.recent_sessions(2).await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].instance_id, "fly-2");
    assert_eq!(latest[1].instance_id, "fly-1");

    let all = rig.firefly.recent_sessions(DEFAULT_SESSION_LIMIT).await.unwrap();
    assert_eq!(all.len(), 3);
}

// ─── Test 15: Active instances shrink as instances fade ───────────────────────

#[tokio::test]
async fn test_active_instances_tracks_lifecycle() {
    let rig = rig();
    let first = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();
    let second = rig.firefly.ignite(IgniteOptions::default()).await.unwrap();

    assert_eq!(rig.firefly.active_instances().await.unwrap().len(), 2);

    rig.firefly.fade(&first.id, None).await.unwrap();
    let active = rig.firefly.active_instances().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, second.id);
}

// ─── Test 16: The observe crate consumes the live event stream ────────────────

#[tokio::test]
async fn test_event_log_captures_lifecycle() {
    let provider = Arc::new(MockProvider::new());
    let log = Arc::new(EventLog::default_capacity());
    let mut config = FireflyConfig::new(provider.clone());
    config.sink = Some(log.clone());
    config.consumer = "buildbot".to_string();
    let firefly = Firefly::new(config);

    let instance = firefly.ignite(IgniteOptions::default()).await.unwrap();
    firefly.fade(&instance.id, None).await.unwrap();

    assert_eq!(log.count(), 2);
    let fades = log.query(Some(EventType::Fade), None, 10);
    assert_eq!(fades.len(), 1);
    assert_eq!(fades[0].instance_id.as_deref(), Some("fly-0"));

    let metrics = LifecycleMetrics::new();
    for event in log.query(None, None, 10) {
        metrics.record(&event);
    }
    assert_eq!(metrics.ignites_total.get(), 1);
    assert_eq!(metrics.fades_total.get(), 1);
    assert!(
        metrics
            .render_prometheus("firefly")
            .contains("firefly_ignites_total 1")
    );
}

// ─── Test 17: CounterSink counts events as they happen ────────────────────────

#[tokio::test]
async fn test_counter_sink_counts_live_events() {
    let provider = Arc::new(MockProvider::new());
    let metrics = Arc::new(LifecycleMetrics::new());
    let mut config = FireflyConfig::new(provider.clone());
    config.sink = Some(Arc::new(CounterSink::new(metrics.clone())));
    let firefly = Firefly::new(config);

    let instance = firefly.ignite(IgniteOptions::default()).await.unwrap();
    firefly.fade(&instance.id, None).await.unwrap();

    assert_eq!(metrics.ignites_total.get(), 1);
    assert_eq!(metrics.fades_total.get(), 1);
    assert_eq!(metrics.errors_total.get(), 0);
}
