//! Task model: condition, module inputs, dependency derivation and
//! variable rendering.
//!
//! A task binds exactly one condition to a Terraform module. Its
//! dependencies (what the watcher must track) derive from the condition
//! plus every module input; its module variables re-render from the
//! watcher snapshot on each trigger.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::debug;

use crate::config::{ConditionConfig, ModuleInputConfig, TaskConfig};
use crate::errors::BoxError;
use crate::notifier::{
    CatalogServicesNotifier, ConsulKvNotifier, Notifier, ServicesNotifier, SuppressNotifier,
    Template,
};
use crate::watcher::{DepId, DepSpec, DepValue};

/// A finalized task. The workspace name always equals the task name.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub enabled: bool,
    pub module: String,
    pub version: Option<String>,
    pub condition: ConditionConfig,
    pub module_inputs: Vec<ModuleInputConfig>,
    pub working_dir: PathBuf,
    pub variable_files: Vec<PathBuf>,
    pub providers: serde_json::Map<String, serde_json::Value>,
    pub retries: i64,
}

impl Task {
    pub fn from_config(config: TaskConfig) -> Self {
        let working_dir = config
            .working_dir
            .unwrap_or_else(|| PathBuf::from("sync-tasks").join(&config.name));
        Self {
            name: config.name,
            enabled: config.enabled,
            module: config.module,
            version: config.version,
            condition: config.condition,
            module_inputs: config.module_inputs,
            working_dir,
            variable_files: config.variable_files,
            providers: config.providers,
            retries: config.retries,
        }
    }

    /// Workspace in the provisioning backend. Same as the task name.
    pub fn workspace(&self) -> &str {
        &self.name
    }

    /// Parsed cron schedule for schedule-condition tasks.
    pub fn schedule(&self) -> Option<cron::Schedule> {
        match &self.condition {
            // Validated at config load; a parse failure here would be a
            // config given to the runtime without validation.
            ConditionConfig::Schedule(s) => cron::Schedule::from_str(&s.cron).ok(),
            _ => None,
        }
    }

    /// Dependencies the watcher must track for this task, deduplicated:
    /// a dependency named by both the condition and a module input is
    /// registered once.
    pub fn deps(&self) -> Vec<DepSpec> {
        let mut specs: Vec<DepSpec> = Vec::new();
        let mut push = |spec: DepSpec, specs: &mut Vec<DepSpec>| {
            if !specs.iter().any(|s| s.id() == spec.id()) {
                specs.push(spec);
            }
        };

        match &self.condition {
            ConditionConfig::Services(s) => {
                for spec in services_deps(s) {
                    push(spec, &mut specs);
                }
            }
            ConditionConfig::CatalogServices(c) => {
                push(
                    DepSpec::CatalogServices {
                        regex: c.regex.clone(),
                    },
                    &mut specs,
                );
            }
            ConditionConfig::ConsulKv(kv) => {
                for spec in kv_deps(&kv.path, kv.recurse) {
                    push(spec, &mut specs);
                }
            }
            ConditionConfig::Schedule(_) => {}
        }

        for input in &self.module_inputs {
            match input {
                ModuleInputConfig::Services(s) => {
                    for spec in services_deps(s) {
                        push(spec, &mut specs);
                    }
                }
                ModuleInputConfig::CatalogServices(c) => {
                    push(
                        DepSpec::CatalogServices {
                            regex: c.regex.clone(),
                        },
                        &mut specs,
                    );
                }
                ModuleInputConfig::ConsulKv(kv) => {
                    for spec in kv_deps(&kv.path, kv.recurse) {
                        push(spec, &mut specs);
                    }
                }
            }
        }

        specs
    }

    /// Template-function count used as the once-mode expected
    /// dependency count: a services block counts its names, a regex
    /// counts one, each KV and catalog block counts one, a schedule
    /// counts nothing.
    pub fn expected_dep_count(&self) -> usize {
        let condition_count = match &self.condition {
            ConditionConfig::Services(s) => services_count(s),
            ConditionConfig::CatalogServices(_) => 1,
            ConditionConfig::ConsulKv(_) => 1,
            ConditionConfig::Schedule(_) => 0,
        };
        let input_count: usize = self
            .module_inputs
            .iter()
            .map(|input| match input {
                ModuleInputConfig::Services(s) => services_count(s),
                ModuleInputConfig::CatalogServices(_) => 1,
                ModuleInputConfig::ConsulKv(_) => 1,
            })
            .sum();
        condition_count + input_count
    }

    /// Builds the notifier matching this task's condition.
    pub fn build_notifier(&self, template: std::sync::Arc<dyn Template>) -> Box<dyn Notifier> {
        let expected = self.expected_dep_count();
        match &self.condition {
            ConditionConfig::Services(_) => {
                Box::new(ServicesNotifier::new(template, expected))
            }
            ConditionConfig::CatalogServices(_) => {
                Box::new(CatalogServicesNotifier::new(template, expected))
            }
            ConditionConfig::ConsulKv(kv) => {
                Box::new(ConsulKvNotifier::new(template, expected, !kv.recurse))
            }
            ConditionConfig::Schedule(_) => Box::new(SuppressNotifier::new(template, expected)),
        }
    }

    /// Dependency specs whose values feed the module variables: the
    /// condition's (unless opted out) plus every module input's.
    fn contributing_deps(&self) -> Vec<DepSpec> {
        let mut specs = Vec::new();

        let condition_contributes = match &self.condition {
            ConditionConfig::Services(s) => s.use_as_module_input,
            ConditionConfig::CatalogServices(c) => c.use_as_module_input,
            ConditionConfig::ConsulKv(kv) => kv.use_as_module_input,
            ConditionConfig::Schedule(_) => false,
        };

        for spec in self.deps() {
            let from_condition = self.condition_declares(&spec);
            let from_input = self.module_inputs_declare(&spec);
            if (from_condition && condition_contributes) || from_input {
                specs.push(spec);
            }
        }
        specs
    }

    fn condition_declares(&self, spec: &DepSpec) -> bool {
        let id = spec.id();
        match &self.condition {
            ConditionConfig::Services(s) => services_deps(s).iter().any(|d| d.id() == id),
            ConditionConfig::CatalogServices(c) => {
                DepSpec::CatalogServices {
                    regex: c.regex.clone(),
                }
                .id() == id
            }
            ConditionConfig::ConsulKv(kv) => {
                kv_deps(&kv.path, kv.recurse).iter().any(|d| d.id() == id)
            }
            ConditionConfig::Schedule(_) => false,
        }
    }

    fn module_inputs_declare(&self, spec: &DepSpec) -> bool {
        let id = spec.id();
        self.module_inputs.iter().any(|input| match input {
            ModuleInputConfig::Services(s) => services_deps(s).iter().any(|d| d.id() == id),
            ModuleInputConfig::CatalogServices(c) => {
                DepSpec::CatalogServices {
                    regex: c.regex.clone(),
                }
                .id() == id
            }
            ModuleInputConfig::ConsulKv(kv) => {
                kv_deps(&kv.path, kv.recurse).iter().any(|d| d.id() == id)
            }
        })
    }

    /// Serializes the dependency snapshot into the task's
    /// auto-loaded variable file. Returns the written path.
    pub fn render_variables(
        &self,
        snapshot: &HashMap<DepId, DepValue>,
    ) -> Result<PathBuf, BoxError> {
        let mut services = Vec::new();
        let mut catalog_services = serde_json::Map::new();
        let mut consul_kv = serde_json::Map::new();

        for spec in self.contributing_deps() {
            let Some(value) = snapshot.get(&spec.id()) else {
                continue;
            };
            match value {
                DepValue::HealthServiceList(entries) => {
                    for entry in entries {
                        services.push(json!({
                            "id": entry.service.id,
                            "name": entry.service.service,
                            "address": entry.service.address,
                            "port": entry.service.port,
                            "tags": entry.service.tags,
                            "passing": entry.passing(),
                        }));
                    }
                }
                DepValue::CatalogServiceList(entries) => {
                    for entry in entries {
                        catalog_services
                            .insert(entry.name.clone(), json!(entry.tags));
                    }
                }
                DepValue::KeyPair(pair) => {
                    if let Some(v) = &pair.value {
                        consul_kv.insert(pair.key.clone(), json!(v));
                    }
                }
                DepValue::KeyPairList(pairs) => {
                    for pair in pairs {
                        if let Some(v) = &pair.value {
                            consul_kv.insert(pair.key.clone(), json!(v));
                        }
                    }
                }
                DepValue::KvValue(v) => {
                    let key = match &spec {
                        DepSpec::KvKey { path } => path.clone(),
                        _ => spec.id(),
                    };
                    consul_kv.insert(key, json!(v));
                }
                // Existence probes carry no variable content.
                DepValue::KvExists(_) => {}
            }
        }

        let mut variables = serde_json::Map::new();
        variables.insert("services".to_string(), json!(services));
        if !catalog_services.is_empty() {
            variables.insert("catalog_services".to_string(), json!(catalog_services));
        }
        if !consul_kv.is_empty() {
            variables.insert("consul_kv".to_string(), json!(consul_kv));
        }

        std::fs::create_dir_all(&self.working_dir)?;
        let path = self.variables_path();
        let contents = serde_json::to_string_pretty(&serde_json::Value::Object(variables))?;
        std::fs::write(&path, contents)?;
        debug!(task = %self.name, path = %path.display(), "Rendered module variables");
        Ok(path)
    }

    /// Path of the rendered variable file.
    pub fn variables_path(&self) -> PathBuf {
        self.working_dir.join(format!("{}.auto.tfvars.json", self.name))
    }
}

fn services_deps(source: &crate::config::ServicesSourceConfig) -> Vec<DepSpec> {
    if let Some(regex) = &source.regex {
        vec![DepSpec::HealthServiceRegex {
            regex: regex.clone(),
        }]
    } else {
        source
            .names
            .iter()
            .map(|name| DepSpec::HealthService { name: name.clone() })
            .collect()
    }
}

fn services_count(source: &crate::config::ServicesSourceConfig) -> usize {
    if source.regex.is_some() {
        1
    } else {
        source.names.len()
    }
}

fn kv_deps(path: &str, recurse: bool) -> Vec<DepSpec> {
    if recurse {
        vec![DepSpec::KvPrefix {
            path: path.to_string(),
        }]
    } else {
        vec![
            DepSpec::KvExists {
                path: path.to_string(),
            },
            DepSpec::KvKey {
                path: path.to_string(),
            },
        ]
    }
}

// ── Template buffer ───────────────────────────────────────────────────────────

/// Dirty-flag template. Notifiers forward updates here; the runtime
/// re-renders the variable file when the flag is set.
#[derive(Debug, Default)]
pub struct TaskTemplate {
    dirty: AtomicBool,
}

impl TaskTemplate {
    pub fn new() -> Self {
        Self {
            dirty: AtomicBool::new(true),
        }
    }

    /// Clears and returns the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

impl Template for TaskTemplate {
    fn notify(&self, _value: &DepValue) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Last-run outcome exposed to the HTTP surface.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Not yet run since creation or enablement.
    Pending,
    Success,
    Failed(String),
}

/// Per-task status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub name: String,
    pub enabled: bool,
    pub status: RunStatus,
}
