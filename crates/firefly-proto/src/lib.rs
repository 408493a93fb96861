//! Shared data model for the Firefly orchestrator.
//!
//! Defines the instance, session, event, and idle-detection types exchanged
//! between the orchestrator core and its provider, store, and observability
//! collaborators.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

// ─── Instance Status ─────────────────────────────────────────────────────────

/// Lifecycle status of a tracked instance. Strictly advances
/// running → terminating → terminated; no provisioning status is ever
/// persisted since an instance only becomes tracked once provisioning
/// succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Terminating,
    Terminated,
}

impl ServerStatus {
    /// An instance counts as active until it reaches `Terminated`.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

// ─── Server Config ───────────────────────────────────────────────────────────

/// Fully merged provisioning request handed to a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub provider: String,
    pub size: String,
    pub region: String,
    pub image: String,
    pub user_data: Option<String>,
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
    pub max_lifetime: Option<Duration>,
    pub provider_options: HashMap<String, serde_json::Value>,
}

/// Per-call overrides for `ignite`. Anything left unset falls back to the
/// orchestrator-level defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IgniteOptions {
    pub size: Option<String>,
    pub region: Option<String>,
    pub image: Option<String>,
    pub user_data: Option<String>,
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
    pub max_lifetime: Option<Duration>,
    /// Consumer metadata overlaid onto the provisioned instance
    /// (consumer values win on key collision).
    pub metadata: HashMap<String, String>,
    /// Key for state hydration via the synchronizer, if one is configured.
    pub state_key: Option<String>,
    pub ready_timeout: Option<Duration>,
    pub provider_options: HashMap<String, serde_json::Value>,
}

// ─── Server Instance ─────────────────────────────────────────────────────────

/// A provider-managed compute instance tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: String,
    /// The provider's own identifier, used only for orphan reconciliation.
    pub provider_server_id: String,
    pub provider: String,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
    pub public_ip: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ServerInstance {
    /// Overlay consumer metadata onto provider-populated metadata.
    /// Consumer values win on key collision.
    pub fn overlay_metadata(&mut self, extra: &HashMap<String, String>) {
        for (key, value) in extra {
            self.metadata.insert(key.clone(), value.clone());
        }
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Immutable usage record written exactly once, at the end of a successful
/// fade. There is no representation for an aborted or partial session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireflySession {
    pub id: Uuid,
    pub instance_id: String,
    pub consumer: String,
    pub provider: String,
    pub size: Option<String>,
    pub region: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub status: SessionStatus,
}

impl FireflySession {
    /// Build the session row for a faded instance. Duration is derived from
    /// the instance's own `created_at`, never trusted from the provider, and
    /// clamped at zero.
    pub fn new(instance: &ServerInstance, consumer: &str, ended_at: DateTime<Utc>) -> Self {
        let duration_secs = (ended_at - instance.created_at).num_seconds().max(0) as u64;
        Self {
            id: Uuid::new_v4(),
            instance_id: instance.id.clone(),
            consumer: consumer.to_string(),
            provider: instance.provider.clone(),
            size: instance.metadata.get("size").cloned(),
            region: instance.metadata.get("region").cloned(),
            started_at: instance.created_at,
            ended_at,
            duration_secs,
            status: SessionStatus::Completed,
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ignite,
    Fade,
    Error,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    OrphanDetected,
    OrphanTerminated,
    IdleTriggered,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ignite => write!(f, "ignite"),
            Self::Fade => write!(f, "fade"),
            Self::Error => write!(f, "error"),
            Self::SyncStarted => write!(f, "sync_started"),
            Self::SyncCompleted => write!(f, "sync_completed"),
            Self::SyncFailed => write!(f, "sync_failed"),
            Self::OrphanDetected => write!(f, "orphan_detected"),
            Self::OrphanTerminated => write!(f, "orphan_terminated"),
            Self::IdleTriggered => write!(f, "idle_triggered"),
        }
    }
}

/// Push-only observability record handed to the event sink, never retained
/// by the orchestrator itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireflyEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub instance_id: Option<String>,
    pub provider: Option<String>,
    pub consumer: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub metadata: HashMap<String, String>,
}

impl FireflyEvent {
    /// New event stamped with the current time.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            instance_id: None,
            provider: None,
            consumer: None,
            timestamp: Utc::now(),
            duration_ms: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn with_consumer(mut self, consumer: &str) -> Self {
        self.consumer = Some(consumer.to_string());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

// ─── Idle Detection ──────────────────────────────────────────────────────────

/// Activity sources a consumer may report on a monitored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    SshSessionActive,
    ProcessCpuAboveThreshold,
    NetworkTraffic,
    PlayerConnected,
    AgentTaskRunning,
    CiJobRunning,
}

/// Per-instance idle monitoring parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// How often the detector checks elapsed idle time.
    pub check_interval: Duration,
    /// Inactivity span after which the threshold callback fires.
    pub idle_threshold: Duration,
    /// Declared activity sources; activity itself arrives via
    /// `report_activity`.
    pub signals: Vec<ActivitySignal>,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(300),
            signals: Vec::new(),
        }
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate an instance ID format.
pub fn validate_instance_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Validate a tag for use in provider label selectors. Bare tags and
/// `key=value` tags are both accepted.
pub fn validate_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag.chars().all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '='))
        && tag.matches('=').count() <= 1
}
