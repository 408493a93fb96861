//! Provider adapters for the Firefly orchestrator.
//!
//! Supports Hetzner Cloud and Fly.io Machines. The orchestrator calls this
//! crate through the [`Provider`] trait; provider-specific implementations
//! handle authentication, API quirks, and tag-to-label mappings.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firefly_proto::{ServerConfig, ServerInstance, ServerStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label stamped on every server created through this crate, so sweeps can
/// tell managed instances apart from unrelated ones in the same account.
pub const MANAGED_BY_LABEL: (&str, &str) = ("managed_by", "firefly");

// ─── Provider trait ───────────────────────────────────────────────────────────

/// A compute backend that can create, watch, and destroy instances.
///
/// Contract notes:
/// - `provision` returns an instance considered live from creation; the
///   orchestrator decides when it is usable via `wait_for_ready`.
/// - `wait_for_ready` never errors: poll failures count as not-ready and the
///   call returns false once the timeout elapses.
/// - `terminate` must be safe to call more than once; an already-deleted
///   instance is success, not an error.
/// - `list_active` returns provider-side snapshots whose `id` is best-effort
///   (derived from the server name); only `provider_server_id` participates
///   in orphan reconciliation.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    async fn provision(&self, config: &ServerConfig) -> Result<ServerInstance>;
    async fn wait_for_ready(&self, instance: &ServerInstance, timeout: Duration) -> bool;
    async fn terminate(&self, instance: &ServerInstance) -> Result<()>;
    async fn list_active(&self, tags: &[String]) -> Result<Vec<ServerInstance>>;
}

// ─── Provider registry ────────────────────────────────────────────────────────

/// Name-keyed set of configured providers.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    /// Register every provider whose credentials are present in the
    /// environment.
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        if let Ok(token) = std::env::var("HETZNER_API_TOKEN") {
            registry.register(Arc::new(HetznerProvider::new(token)));
        }
        if let (Ok(token), Ok(app)) = (std::env::var("FLY_API_TOKEN"), std::env::var("FLY_APP_NAME")) {
            registry.register(Arc::new(FlyProvider::new(token, app)));
        }

        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        info!(name = provider.name(), "registering provider");
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
}

// ─── Tag / label mapping ──────────────────────────────────────────────────────

/// Split a tag into a label pair: `k=v` maps to (k, v), a bare tag `t`
/// maps to (t, "true").
fn label_pair(tag: &str) -> (String, String) {
    match tag.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (tag.to_string(), "true".to_string()),
    }
}

fn tag_labels(tags: &[String]) -> HashMap<String, String> {
    let mut labels: HashMap<String, String> = tags.iter().map(|t| label_pair(t)).collect();
    labels.insert(MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string());
    labels
}

/// Selector string for list endpoints: `k=v,k2=v2`, always including the
/// managed-by label.
fn label_selector(tags: &[String]) -> String {
    let labels = tag_labels(tags);
    let mut parts: Vec<String> = labels.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    parts.join(",")
}

fn short_name(instance_id: &str) -> String {
    format!("firefly-{}", &instance_id[..8.min(instance_id.len())])
}

// ─── Hetzner provider ─────────────────────────────────────────────────────────

const HETZNER_READY_POLL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HetznerProvider {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerProvider {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token,
            base_url: "https://api.hetzner.cloud/v1".to_string(),
            client: build_client(),
        }
    }

    async fn fetch_server_status(&self, server_id: &str) -> Result<String> {
        let url = format!("{}/servers/{}", self.base_url, server_id);
        let resp: serde_json::Value = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp["server"]["status"].as_str().unwrap_or("unknown").to_string())
    }

    /// List managed servers matching the label selector, following
    /// pagination.
    async fn list_servers(&self, tags: &[String]) -> Result<Vec<HetznerServer>> {
        let selector = label_selector(tags);
        let mut all_servers = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!("{}/servers", self.base_url);
            let resp: HetznerListServersResponse = self
                .client
                .get(&url)
                .query(&[
                    ("label_selector", selector.as_str()),
                    ("page", &page.to_string()),
                    ("per_page", "25"),
                ])
                .bearer_auth(&self.api_token)
                .send()
                .await
                .context("Hetzner GET /servers request failed")?
                .error_for_status()
                .context("Hetzner GET /servers returned error status")?
                .json()
                .await
                .context("failed to parse Hetzner server list")?;

            let has_next = resp.meta.pagination.next_page.is_some();
            all_servers.extend(resp.servers);
            if has_next { page += 1; } else { break; }
        }

        debug!(count = all_servers.len(), selector = %selector, "listed Hetzner servers");
        Ok(all_servers)
    }

    fn map_server(server: &HetznerServer) -> ServerInstance {
        let created_at = DateTime::parse_from_rfc3339(&server.created)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        ServerInstance {
            id: server.name.clone(),
            provider_server_id: server.id.to_string(),
            provider: "hetzner".to_string(),
            status: ServerStatus::Running,
            created_at,
            public_ip: server.public_net.ipv4.as_ref().map(|v4| v4.ip.clone()),
            metadata: server.labels.clone(),
        }
    }
}

#[async_trait]
impl Provider for HetznerProvider {
    fn name(&self) -> &str { "hetzner" }

    async fn provision(&self, config: &ServerConfig) -> Result<ServerInstance> {
        let start = std::time::Instant::now();
        let instance_id = Uuid::new_v4().to_string();
        let server_name = short_name(&instance_id);
        info!(%instance_id, size = %config.size, region = %config.region, "provisioning Hetzner server");

        let body = serde_json::json!({
            "name": server_name,
            "server_type": config.size,
            "location": config.region,
            "image": config.image,
            "user_data": config.user_data.clone().unwrap_or_default(),
            "ssh_keys": config.ssh_keys,
            "labels": tag_labels(&config.tags),
            "start_after_create": true,
        });

        let resp: serde_json::Value = self
            .client
            .post(format!("{}/servers", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("Hetzner POST /servers request failed")?
            .error_for_status()
            .context("Hetzner POST /servers returned error status")?
            .json()
            .await
            .context("failed to parse Hetzner server creation response")?;

        let server_id = resp["server"]["id"]
            .as_u64()
            .context("missing server.id in Hetzner response")?;
        let public_ip = resp["server"]["public_net"]["ipv4"]["ip"]
            .as_str()
            .map(String::from);

        let mut metadata = HashMap::from([
            ("size".to_string(), config.size.clone()),
            ("region".to_string(), config.region.clone()),
            ("image".to_string(), config.image.clone()),
            ("name".to_string(), server_name),
        ]);
        for (key, value) in tag_labels(&config.tags) {
            metadata.entry(key).or_insert(value);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(%instance_id, server_id, duration_ms, "Hetzner server created");

        Ok(ServerInstance {
            id: instance_id,
            provider_server_id: server_id.to_string(),
            provider: "hetzner".to_string(),
            status: ServerStatus::Running,
            created_at: Utc::now(),
            public_ip,
            metadata,
        })
    }

    async fn wait_for_ready(&self, instance: &ServerInstance, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            match self.fetch_server_status(&instance.provider_server_id).await {
                Ok(status) if status == "running" => return true,
                Ok(status) if status == "off" || status == "error" => {
                    warn!(instance_id = %instance.id, status = %status, "Hetzner server entered unexpected state");
                    return false;
                }
                Ok(status) => {
                    if attempt % 12 == 0 {
                        info!(instance_id = %instance.id, status = %status, "waiting for Hetzner server to reach running state");
                    }
                }
                Err(error) => {
                    debug!(instance_id = %instance.id, %error, "Hetzner readiness poll failed, retrying");
                }
            }

            attempt += 1;
            if tokio::time::Instant::now() + HETZNER_READY_POLL > deadline {
                warn!(instance_id = %instance.id, timeout_secs = timeout.as_secs(), "timed out waiting for Hetzner server");
                return false;
            }
            tokio::time::sleep(HETZNER_READY_POLL).await;
        }
    }

    async fn terminate(&self, instance: &ServerInstance) -> Result<()> {
        info!(instance_id = %instance.id, provider_server_id = %instance.provider_server_id, "terminating Hetzner server");
        let resp = self
            .client
            .delete(format!("{}/servers/{}", self.base_url, instance.provider_server_id))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Hetzner DELETE /servers request failed")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(instance_id = %instance.id, "Hetzner server already gone");
            return Ok(());
        }
        resp.error_for_status()
            .context("Hetzner DELETE /servers returned error status")?;
        info!(instance_id = %instance.id, "Hetzner server deleted");
        Ok(())
    }

    async fn list_active(&self, tags: &[String]) -> Result<Vec<ServerInstance>> {
        let servers = self.list_servers(tags).await?;
        Ok(servers
            .iter()
            .filter(|s| s.status == "running")
            .map(Self::map_server)
            .collect())
    }
}

// ─── Hetzner API types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerServer {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub created: String,
    pub public_net: HetznerPublicNet,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerPublicNet {
    pub ipv4: Option<HetznerIpv4>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerIpv4 {
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerListServersResponse {
    pub servers: Vec<HetznerServer>,
    pub meta: HetznerMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerMeta {
    pub pagination: HetznerPagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerPagination {
    pub page: u32,
    pub per_page: u32,
    pub next_page: Option<u32>,
    pub total_entries: u32,
}

// ─── Fly.io provider ──────────────────────────────────────────────────────────

const FLY_READY_POLL: Duration = Duration::from_secs(3);

/// Fly.io Machines API provider. Machines are created inside a single Fly
/// app; the app name is part of the provider configuration.
#[derive(Debug)]
pub struct FlyProvider {
    api_token: String,
    app: String,
    base_url: String,
    client: reqwest::Client,
}

impl FlyProvider {
    pub fn new(api_token: String, app: String) -> Self {
        Self {
            api_token,
            app,
            base_url: "https://api.machines.dev/v1".to_string(),
            client: build_client(),
        }
    }

    /// Create from env vars: `FLY_API_TOKEN` and `FLY_APP_NAME`.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("FLY_API_TOKEN").context("FLY_API_TOKEN not set")?;
        let app = std::env::var("FLY_APP_NAME").context("FLY_APP_NAME not set")?;
        Ok(Self::new(token, app))
    }

    fn machines_url(&self, path: &str) -> String {
        format!("{}/apps/{}/machines{}", self.base_url, self.app, path)
    }

    async fn fetch_machine(&self, machine_id: &str) -> Result<FlyMachine> {
        let machine: FlyMachine = self
            .client
            .get(self.machines_url(&format!("/{machine_id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(machine)
    }

    fn map_machine(&self, machine: &FlyMachine) -> ServerInstance {
        let metadata = machine
            .config
            .as_ref()
            .and_then(|c| c.metadata.clone())
            .unwrap_or_default();

        ServerInstance {
            id: machine.name.clone(),
            provider_server_id: machine.id.clone(),
            provider: "fly".to_string(),
            status: ServerStatus::Running,
            created_at: Utc::now(),
            public_ip: self.machine_address(machine),
            metadata,
        }
    }

    /// Machines are reachable on the org network; fall back to the internal
    /// DNS name when the API omits the address.
    fn machine_address(&self, machine: &FlyMachine) -> Option<String> {
        machine
            .private_ip
            .clone()
            .or_else(|| Some(format!("{}.vm.{}.internal", machine.id, self.app)))
    }
}

#[async_trait]
impl Provider for FlyProvider {
    fn name(&self) -> &str { "fly" }

    async fn provision(&self, config: &ServerConfig) -> Result<ServerInstance> {
        let start = std::time::Instant::now();
        let instance_id = Uuid::new_v4().to_string();
        let machine_name = short_name(&instance_id);
        info!(%instance_id, size = %config.size, region = %config.region, app = %self.app, "provisioning Fly machine");

        let files = config.user_data.as_ref().map(|payload| {
            vec![serde_json::json!({
                "guest_path": "/run/firefly/user-data",
                "raw_value": payload,
            })]
        });

        let mut machine_config = serde_json::json!({
            "image": config.image,
            "size": config.size,
            "metadata": tag_labels(&config.tags),
            "auto_destroy": false,
        });
        if let Some(files) = files {
            machine_config["files"] = serde_json::Value::Array(files);
        }
        if let Some(env) = config.provider_options.get("env") {
            machine_config["env"] = env.clone();
        }

        let body = serde_json::json!({
            "name": machine_name,
            "region": config.region,
            "config": machine_config,
        });

        let machine: FlyMachine = self
            .client
            .post(self.machines_url(""))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("Fly POST /machines request failed")?
            .error_for_status()
            .context("Fly POST /machines returned error status")?
            .json()
            .await
            .context("failed to parse Fly machine creation response")?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(%instance_id, machine_id = %machine.id, duration_ms, "Fly machine created");

        let mut instance = self.map_machine(&machine);
        instance.id = instance_id;
        instance.metadata.insert("size".to_string(), config.size.clone());
        instance.metadata.insert("region".to_string(), config.region.clone());
        instance.metadata.insert("image".to_string(), config.image.clone());
        Ok(instance)
    }

    async fn wait_for_ready(&self, instance: &ServerInstance, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            match self.fetch_machine(&instance.provider_server_id).await {
                Ok(machine) if machine.state == "started" => return true,
                Ok(machine) if machine.state == "destroyed" || machine.state == "failed" => {
                    warn!(instance_id = %instance.id, state = %machine.state, "Fly machine entered unexpected state");
                    return false;
                }
                Ok(machine) => {
                    if attempt % 20 == 0 {
                        info!(instance_id = %instance.id, state = %machine.state, "waiting for Fly machine to start");
                    }
                }
                Err(error) => {
                    debug!(instance_id = %instance.id, %error, "Fly readiness poll failed, retrying");
                }
            }

            attempt += 1;
            if tokio::time::Instant::now() + FLY_READY_POLL > deadline {
                warn!(instance_id = %instance.id, timeout_secs = timeout.as_secs(), "timed out waiting for Fly machine");
                return false;
            }
            tokio::time::sleep(FLY_READY_POLL).await;
        }
    }

    async fn terminate(&self, instance: &ServerInstance) -> Result<()> {
        info!(instance_id = %instance.id, machine_id = %instance.provider_server_id, "terminating Fly machine");
        let resp = self
            .client
            .delete(self.machines_url(&format!("/{}?force=true", instance.provider_server_id)))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Fly DELETE /machines request failed")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(instance_id = %instance.id, "Fly machine already gone");
            return Ok(());
        }
        resp.error_for_status()
            .context("Fly DELETE /machines returned error status")?;
        info!(instance_id = %instance.id, "Fly machine destroyed");
        Ok(())
    }

    async fn list_active(&self, tags: &[String]) -> Result<Vec<ServerInstance>> {
        let machines: Vec<FlyMachine> = self
            .client
            .get(self.machines_url(""))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Fly GET /machines request failed")?
            .error_for_status()
            .context("Fly GET /machines returned error status")?
            .json()
            .await
            .context("failed to parse Fly machine list")?;

        let wanted = tag_labels(tags);
        let active = machines
            .iter()
            .filter(|m| m.state == "started")
            .filter(|m| {
                let metadata = m.config.as_ref().and_then(|c| c.metadata.as_ref());
                wanted.iter().all(|(key, value)| {
                    metadata.is_some_and(|meta| meta.get(key) == Some(value))
                })
            })
            .map(|m| self.map_machine(m))
            .collect::<Vec<_>>();

        debug!(count = active.len(), app = %self.app, "listed Fly machines");
        Ok(active)
    }
}

// ─── Fly API types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FlyMachine {
    pub id: String,
    pub name: String,
    pub state: String,
    pub region: String,
    pub private_ip: Option<String>,
    pub config: Option<FlyMachineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlyMachineConfig {
    pub metadata: Option<HashMap<String, String>>,
}
