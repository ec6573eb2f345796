//! Dependency watching: snapshots on demand plus a broadcast of change
//! events.
//!
//! Tasks never talk to Consul directly. Each task registers the
//! dependencies its condition and module inputs need; the watcher keeps
//! the latest value per dependency and broadcasts `(task, id, value)`
//! updates whenever one changes. Notifiers consume only the events; the
//! renderer reads the snapshot when a trigger fires.
//!
//! [`DepHub`] is the in-memory store + broadcast half. [`ConsulWatcher`]
//! is the polling half that feeds the hub from a live agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::consul::{ConsulClient, KvPair, ServiceEntry};
use crate::errors::BoxError;

/// Opaque dependency identifier, stable for a task's lifetime.
pub type DepId = String;

/// A catalog entry: service name and its registered tags.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogServiceEntry {
    pub name: String,
    pub tags: Vec<String>,
}

/// Typed dependency value delivered to notifiers and the renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum DepValue {
    HealthServiceList(Vec<ServiceEntry>),
    CatalogServiceList(Vec<CatalogServiceEntry>),
    KeyPair(KvPair),
    KeyPairList(Vec<KvPair>),
    KvValue(String),
    KvExists(bool),
}

impl DepValue {
    /// True for the KV-shaped variants.
    pub fn is_kv(&self) -> bool {
        matches!(
            self,
            DepValue::KeyPair(_)
                | DepValue::KeyPairList(_)
                | DepValue::KvValue(_)
                | DepValue::KvExists(_)
        )
    }
}

/// What to watch for one dependency.
#[derive(Debug, Clone, PartialEq)]
pub enum DepSpec {
    /// Healthy instances of one named service.
    HealthService { name: String },
    /// Healthy instances of every service whose name matches the regex.
    HealthServiceRegex { regex: String },
    /// The catalog's service-name → tags map, filtered by the regex.
    CatalogServices { regex: String },
    /// Existence of a single key.
    KvExists { path: String },
    /// Value of a single key.
    KvKey { path: String },
    /// Every pair under a prefix.
    KvPrefix { path: String },
}

impl DepSpec {
    /// Stable identifier used as the snapshot key.
    pub fn id(&self) -> DepId {
        match self {
            DepSpec::HealthService { name } => format!("health.{}", name),
            DepSpec::HealthServiceRegex { regex } => format!("health-regex.{}", regex),
            DepSpec::CatalogServices { regex } => format!("catalog-services.{}", regex),
            DepSpec::KvExists { path } => format!("kv-exists.{}", path),
            DepSpec::KvKey { path } => format!("kv.{}", path),
            DepSpec::KvPrefix { path } => format!("kv-prefix.{}", path),
        }
    }
}

/// One change event on a task's dependency.
#[derive(Debug, Clone)]
pub struct DepUpdate {
    pub task: String,
    pub id: DepId,
    pub value: DepValue,
}

#[derive(Debug, Error)]
#[error("dependency {id} already registered for task \"{task}\"")]
pub struct DuplicateDependency {
    pub task: String,
    pub id: DepId,
}

// ── Hub ───────────────────────────────────────────────────────────────────────

const BROADCAST_CAPACITY: usize = 256;

/// In-memory dependency store and broadcaster.
///
/// Owns the dependency cache; updates are serialized through the
/// internal lock so subscribers observe a consistent order.
#[derive(Debug)]
pub struct DepHub {
    registered: Mutex<HashMap<String, Vec<DepSpec>>>,
    values: Mutex<HashMap<String, HashMap<DepId, DepValue>>>,
    tx: broadcast::Sender<DepUpdate>,
}

impl Default for DepHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DepHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registered: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Registers a dependency for a task. Each dependency is registered
    /// exactly once per task lifetime; duplicates are an error.
    pub fn register(&self, task: &str, spec: DepSpec) -> Result<(), DuplicateDependency> {
        let mut registered = self.registered.lock().unwrap();
        let deps = registered.entry(task.to_string()).or_default();
        if deps.iter().any(|d| d.id() == spec.id()) {
            return Err(DuplicateDependency {
                task: task.to_string(),
                id: spec.id(),
            });
        }
        debug!(task = task, dep = %spec.id(), "Registered dependency");
        deps.push(spec);
        Ok(())
    }

    /// Drops every registration and cached value for a task.
    pub fn deregister_task(&self, task: &str) {
        self.registered.lock().unwrap().remove(task);
        self.values.lock().unwrap().remove(task);
    }

    /// Registered dependency specs for a task.
    pub fn registered(&self, task: &str) -> Vec<DepSpec> {
        self.registered
            .lock()
            .unwrap()
            .get(task)
            .cloned()
            .unwrap_or_default()
    }

    /// Every task with at least one registration.
    pub fn tasks(&self) -> Vec<String> {
        self.registered.lock().unwrap().keys().cloned().collect()
    }

    /// Stores a value and broadcasts the update.
    pub fn update(&self, task: &str, id: &str, value: DepValue) {
        self.values
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .insert(id.to_string(), value.clone());
        // A send error only means no live subscriber; the snapshot
        // still advanced, so drop it.
        let _ = self.tx.send(DepUpdate {
            task: task.to_string(),
            id: id.to_string(),
            value,
        });
    }

    /// Latest value per dependency for a task.
    pub fn snapshot(&self, task: &str) -> HashMap<DepId, DepValue> {
        self.values
            .lock()
            .unwrap()
            .get(task)
            .cloned()
            .unwrap_or_default()
    }

    /// Current value of a single dependency.
    pub fn value(&self, task: &str, id: &str) -> Option<DepValue> {
        self.values
            .lock()
            .unwrap()
            .get(task)
            .and_then(|m| m.get(id))
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepUpdate> {
        self.tx.subscribe()
    }
}

// ── Consul poller ─────────────────────────────────────────────────────────────

/// Default interval between dependency polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls every registered dependency against the agent and pushes
/// changed values into the hub.
pub struct ConsulWatcher {
    client: Arc<ConsulClient>,
    hub: Arc<DepHub>,
    poll_interval: Duration,
}

impl ConsulWatcher {
    pub fn new(client: Arc<ConsulClient>, hub: Arc<DepHub>, poll_interval: Duration) -> Self {
        Self {
            client,
            hub,
            poll_interval,
        }
    }

    /// Poll loop. Runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "Dependency watcher started");
        loop {
            self.poll_once(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Dependency watcher stopping");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// One pass over every registered dependency of every task.
    pub async fn poll_once(&self, cancel: &CancellationToken) {
        for task in self.hub.tasks() {
            for spec in self.hub.registered(&task) {
                if cancel.is_cancelled() {
                    return;
                }
                match self.resolve(cancel, &spec).await {
                    Ok(value) => {
                        let id = spec.id();
                        if self.hub.value(&task, &id).as_ref() != Some(&value) {
                            debug!(task = %task, dep = %id, "Dependency changed");
                            self.hub.update(&task, &id, value);
                        }
                    }
                    Err(e) => {
                        error!(task = %task, dep = %spec.id(), error = %e, "Dependency poll failed");
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        cancel: &CancellationToken,
        spec: &DepSpec,
    ) -> Result<DepValue, BoxError> {
        match spec {
            DepSpec::HealthService { name } => {
                let entries = self.client.get_health_service(cancel, name).await?;
                Ok(DepValue::HealthServiceList(entries))
            }
            DepSpec::HealthServiceRegex { regex } => {
                let re = regex::Regex::new(regex)?;
                let catalog = self.client.catalog_services(cancel).await?;
                let mut names: Vec<&String> =
                    catalog.keys().filter(|n| re.is_match(n)).collect();
                names.sort();
                let mut entries = Vec::new();
                for name in names {
                    entries.extend(self.client.get_health_service(cancel, name).await?);
                }
                Ok(DepValue::HealthServiceList(entries))
            }
            DepSpec::CatalogServices { regex } => {
                let re = regex::Regex::new(regex)?;
                let catalog = self.client.catalog_services(cancel).await?;
                let mut services: Vec<CatalogServiceEntry> = catalog
                    .into_iter()
                    .filter(|(name, _)| re.is_match(name))
                    .map(|(name, tags)| CatalogServiceEntry { name, tags })
                    .collect();
                services.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(DepValue::CatalogServiceList(services))
            }
            DepSpec::KvExists { path } => {
                let pairs = self.client.kv_get(cancel, path, false).await?;
                Ok(DepValue::KvExists(!pairs.is_empty()))
            }
            DepSpec::KvKey { path } => {
                let pairs = self.client.kv_get(cancel, path, false).await?;
                match pairs.into_iter().next().and_then(|p| p.value) {
                    Some(value) => Ok(DepValue::KvValue(value)),
                    None => Ok(DepValue::KvExists(false)),
                }
            }
            DepSpec::KvPrefix { path } => {
                let pairs = self.client.kv_get(cancel, path, true).await?;
                Ok(DepValue::KeyPairList(pairs))
            }
        }
    }
}
