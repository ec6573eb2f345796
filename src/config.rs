//! Finalized configuration model.
//!
//! The daemon consumes a fully-finalized in-memory configuration. The
//! declarative file formats are YAML and JSON; loading dispatches on
//! the file extension. `finalize()` fills defaults, `validate()`
//! collects every problem before failing, and the result is the only
//! form the rest of the crate sees.
//!
//! Fields marked *instance-local* below (id, port, working_dir) are the
//! ones two highly-available peers may legitimately disagree on; the
//! compatibility checker in [`crate::compat`] skips exactly those.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading, parsing or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML config: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON config: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Unsupported config file extension: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

// ── Top level ─────────────────────────────────────────────────────────────────

/// Root configuration. All blocks are optional in the file; `finalize`
/// fills every default so downstream code never sees an absent block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Instance id. Instance-local.
    #[serde(default)]
    pub id: String,

    /// Port of the daemon's own HTTP surface. Instance-local.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base directory for per-task workspaces. Instance-local.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub consul: ConsulConfig,

    #[serde(default)]
    pub service_registration: ServiceRegistrationConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub tasks: Vec<TaskConfig>,

    /// Deprecated peer-compatibility tag; still compared by the HA
    /// checker for configs that carry it.
    #[serde(default)]
    pub ha_group: Option<String>,
}

fn default_port() -> u16 {
    8558
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("sync-tasks")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: String::new(),
            port: default_port(),
            working_dir: default_working_dir(),
            log: LogConfig::default(),
            tls: TlsConfig::default(),
            consul: ConsulConfig::default(),
            service_registration: ServiceRegistrationConfig::default(),
            driver: DriverConfig::default(),
            tasks: Vec::new(),
            ha_group: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit log lines as JSON objects.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// TLS on the daemon's own HTTP surface. Transport-level only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    /// Agent HTTP(S) address, e.g. `http://127.0.0.1:8500`.
    #[serde(default = "default_consul_address")]
    pub address: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Per-request timeout, seconds.
    #[serde(default = "default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,

    /// Retries after the initial attempt for each Consul call.
    #[serde(default = "default_consul_retries")]
    pub retries: i64,
}

fn default_consul_address() -> String {
    "http://localhost:8500".to_string()
}

fn default_transport_timeout_secs() -> u64 {
    30
}

fn default_consul_retries() -> i64 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            token: None,
            datacenter: None,
            namespace: None,
            transport_timeout_secs: default_transport_timeout_secs(),
            retries: default_consul_retries(),
        }
    }
}

impl ConsulConfig {
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceRegistrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Whether to attach the default HTTP health check.
    #[serde(default = "default_true")]
    pub default_check: bool,

    /// Override for the health check address; defaults to
    /// `<scheme>://localhost:<port>`.
    #[serde(default)]
    pub check_address: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "Consul-Terraform-Sync".to_string()
}

impl Default for ServiceRegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: default_service_name(),
            namespace: None,
            default_check: true,
            check_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    /// Directory holding the `terraform` binary. Empty means `$PATH`.
    #[serde(default)]
    pub exec_path: Option<PathBuf>,

    /// Tee backend output to a `terraform.log` in each working dir.
    #[serde(default)]
    pub persist_log: bool,

    /// Also mirror backend output to the daemon's own log.
    #[serde(default = "default_true")]
    pub log: bool,

    /// Development mode: log lifecycle calls instead of invoking the
    /// backend binary.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            exec_path: None,
            persist_log: false,
            log: true,
            dev_mode: false,
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Module path or registry URL.
    pub module: String,

    /// Module version constraint. Informational; passed to the backend.
    #[serde(default)]
    pub version: Option<String>,

    pub condition: ConditionConfig,

    #[serde(default)]
    pub module_inputs: Vec<ModuleInputConfig>,

    /// Extra variable files passed to plan/apply, converted to absolute
    /// paths at driver construction.
    #[serde(default)]
    pub variable_files: Vec<PathBuf>,

    /// Provider configuration, opaque to the daemon.
    #[serde(default)]
    pub providers: serde_json::Map<String, serde_json::Value>,

    /// Per-task working directory; defaults to
    /// `<working_dir>/<task name>`.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Retries for this task's plan/apply. `-1` means unbounded.
    #[serde(default = "default_task_retries")]
    pub retries: i64,
}

fn default_task_retries() -> i64 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

/// The rule that determines when a task re-applies. Exactly one per
/// task, enforced by the enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionConfig {
    Services(ServicesSourceConfig),
    CatalogServices(CatalogServicesSourceConfig),
    ConsulKv(ConsulKvSourceConfig),
    Schedule(ScheduleConditionConfig),
}

/// Extra variables supplied to the module regardless of trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleInputConfig {
    Services(ServicesSourceConfig),
    CatalogServices(CatalogServicesSourceConfig),
    ConsulKv(ConsulKvSourceConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServicesSourceConfig {
    /// Explicit service names. Mutually exclusive with `regex`.
    #[serde(default)]
    pub names: Vec<String>,

    /// Regex over service names. Mutually exclusive with `names`.
    #[serde(default)]
    pub regex: Option<String>,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_true")]
    pub use_as_module_input: bool,
}

impl Default for ServicesSourceConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            regex: None,
            datacenter: None,
            namespace: None,
            use_as_module_input: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CatalogServicesSourceConfig {
    pub regex: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_true")]
    pub use_as_module_input: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConsulKvSourceConfig {
    pub path: String,

    #[serde(default)]
    pub recurse: bool,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_true")]
    pub use_as_module_input: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConditionConfig {
    /// Cron expression, seconds-first format.
    pub cron: String,
}

// ── Loading / finalize / validate ─────────────────────────────────────────────

impl Config {
    /// Loads configuration from a YAML or JSON file, finalizes defaults
    /// and validates. The returned config is ready for the controller.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let mut config: Config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.finalize();
        config.validate()?;
        Ok(config)
    }

    /// Fills every unset default. Idempotent.
    pub fn finalize(&mut self) {
        if self.id.is_empty() {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            self.id = format!("cts-{}", host);
        }
        for task in &mut self.tasks {
            if task.working_dir.is_none() {
                task.working_dir = Some(self.working_dir.join(&task.name));
            }
        }
    }

    /// Collects every configuration problem; fails with all of them at
    /// once so the operator fixes a file in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("port: must be non-zero".to_string());
        }
        if self.consul.address.is_empty() {
            errors.push("consul.address: must not be empty".to_string());
        }
        if self.consul.retries < crate::retry::UNBOUNDED {
            errors.push(format!(
                "consul.retries: {} is not a valid retry count (-1 means unbounded)",
                self.consul.retries
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            let prefix = format!("task \"{}\"", task.name);
            if task.name.is_empty() {
                errors.push("task: name must not be empty".to_string());
            }
            if !seen.insert(task.name.clone()) {
                errors.push(format!("{}: duplicate task name", prefix));
            }
            if task.module.is_empty() {
                errors.push(format!("{}: module must not be empty", prefix));
            }
            if task.retries < crate::retry::UNBOUNDED {
                errors.push(format!(
                    "{}: retries {} is not a valid retry count",
                    prefix, task.retries
                ));
            }

            Self::validate_condition(&task.condition, &prefix, &mut errors);
            for input in &task.module_inputs {
                Self::validate_module_input(input, &prefix, &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn validate_services(source: &ServicesSourceConfig, prefix: &str, errors: &mut Vec<String>) {
        match (&source.regex, source.names.is_empty()) {
            (Some(_), false) => errors.push(format!(
                "{}: services block cannot set both names and regex",
                prefix
            )),
            (None, true) => errors.push(format!(
                "{}: services block requires names or regex",
                prefix
            )),
            (Some(re), true) => {
                if let Err(e) = regex::Regex::new(re) {
                    errors.push(format!("{}: invalid services regex: {}", prefix, e));
                }
            }
            (None, false) => {}
        }
    }

    fn validate_condition(condition: &ConditionConfig, prefix: &str, errors: &mut Vec<String>) {
        match condition {
            ConditionConfig::Services(s) => Self::validate_services(s, prefix, errors),
            ConditionConfig::CatalogServices(c) => {
                if let Err(e) = regex::Regex::new(&c.regex) {
                    errors.push(format!("{}: invalid catalog-services regex: {}", prefix, e));
                }
            }
            ConditionConfig::ConsulKv(kv) => {
                if kv.path.is_empty() {
                    errors.push(format!("{}: consul-kv path must not be empty", prefix));
                }
            }
            ConditionConfig::Schedule(s) => {
                use std::str::FromStr;
                if let Err(e) = cron::Schedule::from_str(&s.cron) {
                    errors.push(format!("{}: invalid cron expression: {}", prefix, e));
                }
            }
        }
    }

    fn validate_module_input(input: &ModuleInputConfig, prefix: &str, errors: &mut Vec<String>) {
        match input {
            ModuleInputConfig::Services(s) => Self::validate_services(s, prefix, errors),
            ModuleInputConfig::CatalogServices(c) => {
                if let Err(e) = regex::Regex::new(&c.regex) {
                    errors.push(format!("{}: invalid catalog-services regex: {}", prefix, e));
                }
            }
            ModuleInputConfig::ConsulKv(kv) => {
                if kv.path.is_empty() {
                    errors.push(format!("{}: consul-kv path must not be empty", prefix));
                }
            }
        }
    }

    /// Scheme of the daemon's own HTTP surface.
    pub fn scheme(&self) -> &'static str {
        if self.tls.enabled {
            "https"
        } else {
            "http"
        }
    }

    /// Config for tests: one enabled services-condition task.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        let mut config = Config {
            tasks: vec![TaskConfig {
                name: "web".to_string(),
                description: None,
                enabled: true,
                module: "./modules/web".to_string(),
                version: None,
                condition: ConditionConfig::Services(ServicesSourceConfig {
                    names: vec!["api".to_string(), "db".to_string()],
                    ..ServicesSourceConfig::default()
                }),
                module_inputs: Vec::new(),
                variable_files: Vec::new(),
                providers: serde_json::Map::new(),
                working_dir: None,
                retries: default_task_retries(),
            }],
            ..Config::default()
        };
        config.finalize();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_applied_on_finalize() {
        let mut config = Config::default();
        config.finalize();
        assert!(config.id.starts_with("cts-"));
        assert_eq!(config.port, 8558);
        assert_eq!(config.consul.address, "http://localhost:8500");
        assert_eq!(config.service_registration.service_name, "Consul-Terraform-Sync");
    }

    #[test]
    fn task_working_dir_defaults_under_base() {
        let config = Config::for_testing();
        assert_eq!(
            config.tasks[0].working_dir.as_deref(),
            Some(Path::new("sync-tasks/web"))
        );
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(Config::for_testing().validate().is_ok());
    }

    #[test]
    fn duplicate_task_names_rejected() {
        let mut config = Config::for_testing();
        let dup = config.tasks[0].clone();
        config.tasks.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate task name"));
    }

    #[test]
    fn services_condition_requires_names_or_regex() {
        let mut config = Config::for_testing();
        config.tasks[0].condition =
            ConditionConfig::Services(ServicesSourceConfig::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requires names or regex"));
    }

    #[test]
    fn services_condition_rejects_names_and_regex_together() {
        let mut config = Config::for_testing();
        config.tasks[0].condition = ConditionConfig::Services(ServicesSourceConfig {
            names: vec!["api".to_string()],
            regex: Some("^api$".to_string()),
            ..ServicesSourceConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_cron_expression_rejected() {
        let mut config = Config::for_testing();
        config.tasks[0].condition = ConditionConfig::Schedule(ScheduleConditionConfig {
            cron: "not a cron".to_string(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn bad_services_regex_rejected() {
        let mut config = Config::for_testing();
        config.tasks[0].condition = ConditionConfig::Services(ServicesSourceConfig {
            regex: Some("[unclosed".to_string()),
            ..ServicesSourceConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
working_dir: /tmp/cts
tasks:
  - name: web
    module: ./modules/web
    condition:
      services:
        names: [api, db]
"#
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks[0].name, "web");
        assert_eq!(
            config.tasks[0].working_dir.as_deref(),
            Some(Path::new("/tmp/cts/web"))
        );
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
  "tasks": [
    {{
      "name": "kv-task",
      "module": "./modules/kv",
      "condition": {{ "consul-kv": {{ "path": "config/app" }} }}
    }}
  ]
}}"#
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert!(matches!(
            config.tasks[0].condition,
            ConditionConfig::ConsulKv(_)
        ));
    }

    #[test]
    fn unsupported_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn scheme_follows_tls_flag() {
        let mut config = Config::for_testing();
        assert_eq!(config.scheme(), "http");
        config.tls.enabled = true;
        assert_eq!(config.scheme(), "https");
    }
}
