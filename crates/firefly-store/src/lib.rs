//! Instance and session state stores for the Firefly orchestrator.
//!
//! Provides the [`StateStore`] collaborator trait plus two implementations:
//! [`MemoryStore`], the default for tests and short-lived processes, and
//! [`JsonFileStore`], which keeps the same data in memory and snapshots to
//! JSON files on every write.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use firefly_proto::{FireflySession, ServerInstance, ServerStatus};
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ─── Store trait ──────────────────────────────────────────────────────────────

/// Durable records of tracked instances and completed sessions.
///
/// Each status update must appear atomic; no multi-step transaction
/// contract is required beyond that.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    async fn save_instance(&self, instance: &ServerInstance) -> Result<()>;
    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServerInstance>>;
    async fn update_status(&self, instance_id: &str, status: ServerStatus) -> Result<()>;
    /// All instances that have not reached `Terminated`.
    async fn get_active_instances(&self) -> Result<Vec<ServerInstance>>;
    async fn log_session(&self, session: &FireflySession) -> Result<()>;
    /// Completed sessions, newest first.
    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<FireflySession>>;
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// Default store: plain maps behind locks, nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, ServerInstance>>,
    sessions: RwLock<Vec<FireflySession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_instance(&self, instance: &ServerInstance) -> Result<()> {
        self.instances.write().insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServerInstance>> {
        Ok(self.instances.read().get(instance_id).cloned())
    }

    async fn update_status(&self, instance_id: &str, status: ServerStatus) -> Result<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .with_context(|| format!("instance '{instance_id}' not found"))?;
        instance.status = status;
        Ok(())
    }

    async fn get_active_instances(&self) -> Result<Vec<ServerInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.status.is_active())
            .cloned()
            .collect())
    }

    async fn log_session(&self, session: &FireflySession) -> Result<()> {
        self.sessions.write().push(session.clone());
        Ok(())
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<FireflySession>> {
        Ok(self.sessions.read().iter().rev().take(limit).cloned().collect())
    }
}

// ─── JSON snapshot helper ─────────────────────────────────────────────────────

/// One JSON file per domain of data; load tolerates missing or corrupt
/// files and starts fresh.
struct JsonSnapshot {
    path: PathBuf,
}

impl JsonSnapshot {
    fn new(state_dir: &Path, domain: &str) -> Self {
        Self { path: state_dir.join(format!("{domain}.json")) }
    }

    fn load<T: DeserializeOwned + Default>(&self) -> T {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                T::default()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                T::default()
            }
        }
    }

    fn save<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

impl std::fmt::Debug for JsonSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSnapshot").field("path", &self.path).finish()
    }
}

// ─── JSON file-backed store ───────────────────────────────────────────────────

/// `MemoryStore` semantics with JSON snapshots under a state directory:
/// `instances.json` and `sessions.json`, written on every mutation and
/// loaded at construction.
#[derive(Debug)]
pub struct JsonFileStore {
    instances: RwLock<HashMap<String, ServerInstance>>,
    sessions: RwLock<Vec<FireflySession>>,
    instance_snapshot: JsonSnapshot,
    session_snapshot: JsonSnapshot,
}

impl JsonFileStore {
    pub fn new(state_dir: &Path) -> Self {
        let instance_snapshot = JsonSnapshot::new(state_dir, "instances");
        let session_snapshot = JsonSnapshot::new(state_dir, "sessions");
        let instances: HashMap<String, ServerInstance> = instance_snapshot.load();
        let sessions: Vec<FireflySession> = session_snapshot.load();
        debug!(
            instances = instances.len(),
            sessions = sessions.len(),
            dir = %state_dir.display(),
            "loaded firefly state from disk"
        );
        Self {
            instances: RwLock::new(instances),
            sessions: RwLock::new(sessions),
            instance_snapshot,
            session_snapshot,
        }
    }

    fn snapshot_instances(&self) -> Result<()> {
        let instances = self.instances.read();
        self.instance_snapshot
            .save(&*instances)
            .context("failed to write instance snapshot")
    }

    fn snapshot_sessions(&self) -> Result<()> {
        let sessions = self.sessions.read();
        self.session_snapshot
            .save(&*sessions)
            .context("failed to write session snapshot")
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save_instance(&self, instance: &ServerInstance) -> Result<()> {
        self.instances.write().insert(instance.id.clone(), instance.clone());
        self.snapshot_instances()
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServerInstance>> {
        Ok(self.instances.read().get(instance_id).cloned())
    }

    async fn update_status(&self, instance_id: &str, status: ServerStatus) -> Result<()> {
        {
            let mut instances = self.instances.write();
            let instance = instances
                .get_mut(instance_id)
                .with_context(|| format!("instance '{instance_id}' not found"))?;
            instance.status = status;
        }
        self.snapshot_instances()
    }

    async fn get_active_instances(&self) -> Result<Vec<ServerInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.status.is_active())
            .cloned()
            .collect())
    }

    async fn log_session(&self, session: &FireflySession) -> Result<()> {
        self.sessions.write().push(session.clone());
        self.snapshot_sessions()
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<FireflySession>> {
        Ok(self.sessions.read().iter().rev().take(limit).cloned().collect())
    }
}
