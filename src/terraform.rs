//! Terraform CLI driver.
//!
//! Wraps an external `terraform` binary behind the [`Driver`] contract.
//! The low-level subcommand surface lives behind [`TerraformExec`] so
//! the workspace-bootstrap logic can be tested against a mock that
//! counts invocations; [`TerraformBinary`] is the real subprocess
//! implementation.
//!
//! Each task owns one driver pinned to its workspace: every invocation
//! inherits the composed environment plus `TF_WORKSPACE`, and state for
//! the task is isolated under that workspace in the configured backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{Driver, Plan};
use crate::errors::{chain, BoxError};
use crate::version;

/// Environment variable pinning the per-task workspace.
pub const WORKSPACE_ENV: &str = "TF_WORKSPACE";

/// File name for persisted backend output under the working directory.
pub const LOG_FILE_NAME: &str = "terraform.log";

// ── Errors ────────────────────────────────────────────────────────────────────

/// A subcommand exited non-zero. Display carries the combined output so
/// substring checks on known Terraform phrasings work at any depth.
#[derive(Debug, Error)]
#[error("terraform {command} failed (exit code {code:?}): {output}")]
pub struct TerraformCommandError {
    pub command: String,
    pub code: Option<i32>,
    pub output: String,
}

/// Typed form of the "workspace does not exist" failure.
#[derive(Debug, Error)]
#[error("workspace \"{0}\" does not exist")]
pub struct NoWorkspaceError(pub String);

#[derive(Debug, Error)]
#[error(
    "terraform version {version} does not satisfy the supported constraint {constraint}"
)]
pub struct UnsupportedVersionError {
    pub version: String,
    pub constraint: &'static str,
}

/// Module validation failed; one line per error diagnostic.
#[derive(Debug, Error)]
#[error("module validation failed:\n{}", .0.join("\n"))]
pub struct ValidationError(pub Vec<String>);

fn is_workspace_select_failure(err: &BoxError) -> bool {
    chain(err.as_ref()).any(|e| {
        e.downcast_ref::<NoWorkspaceError>().is_some()
            || e.to_string().contains("Failed to select workspace")
    })
}

fn is_workspace_exists(err: &BoxError) -> bool {
    chain(err.as_ref()).any(|e| e.to_string().contains("already exists"))
}

// ── Validate output ───────────────────────────────────────────────────────────

/// Parsed `terraform validate -json` output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidateOutput {
    pub valid: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub severity: String,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
}

// ── Exec seam ─────────────────────────────────────────────────────────────────

/// Low-level subcommand surface of the backend binary.
#[async_trait]
pub trait TerraformExec: Send + Sync + std::fmt::Debug {
    fn set_env(&mut self, env: HashMap<String, String>);

    async fn version(&self) -> Result<semver::Version, BoxError>;

    async fn init(&self) -> Result<(), BoxError>;

    async fn workspace_new(&self, name: &str) -> Result<(), BoxError>;

    async fn workspace_select(&self, name: &str) -> Result<(), BoxError>;

    async fn plan(&self, var_files: &[PathBuf]) -> Result<Plan, BoxError>;

    async fn apply(&self, var_files: &[PathBuf]) -> Result<(), BoxError>;

    async fn validate(&self) -> Result<ValidateOutput, BoxError>;
}

// ── Subprocess implementation ─────────────────────────────────────────────────

/// Shells out to `<exec_path>/terraform` in the task's working
/// directory. Output can be mirrored to the daemon log and/or persisted
/// to `<working_dir>/terraform.log`.
#[derive(Debug)]
pub struct TerraformBinary {
    bin: PathBuf,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    log_output: bool,
    persist_log: bool,
}

impl TerraformBinary {
    pub fn new(
        exec_path: Option<&Path>,
        working_dir: &Path,
        log_output: bool,
        persist_log: bool,
    ) -> Self {
        let bin = match exec_path {
            Some(dir) => dir.join("terraform"),
            None => PathBuf::from("terraform"),
        };
        Self {
            bin,
            working_dir: working_dir.to_path_buf(),
            env: HashMap::new(),
            log_output,
            persist_log,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(Option<i32>, String), BoxError> {
        let command_line = args.join(" ");
        debug!(
            command = %command_line,
            dir = %self.working_dir.display(),
            "terraform invocation"
        );

        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .kill_on_drop(false)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        if self.log_output {
            for line in combined.lines() {
                debug!(command = %command_line, "terraform: {}", line);
            }
        }
        if self.persist_log {
            self.append_log(&command_line, &combined).await;
        }

        Ok((output.status.code(), combined))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, BoxError> {
        let (code, output) = self.run(args).await?;
        if code == Some(0) {
            Ok(output)
        } else {
            Err(Box::new(TerraformCommandError {
                command: args.join(" "),
                code,
                output,
            }))
        }
    }

    async fn append_log(&self, command: &str, output: &str) {
        use tokio::io::AsyncWriteExt;
        let path = self.working_dir.join(LOG_FILE_NAME);
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match result {
            Ok(mut file) => {
                let entry = format!("terraform {}\n{}\n", command, output);
                if let Err(e) = file.write_all(entry.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "Failed to persist terraform log");
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open terraform log");
            }
        }
    }

    fn var_file_args(var_files: &[PathBuf]) -> Vec<String> {
        var_files
            .iter()
            .map(|f| format!("-var-file={}", f.display()))
            .collect()
    }
}

#[async_trait]
impl TerraformExec for TerraformBinary {
    fn set_env(&mut self, env: HashMap<String, String>) {
        self.env = env;
    }

    async fn version(&self) -> Result<semver::Version, BoxError> {
        let output = self.run_checked(&["version"]).await?;
        version::parse_version_output(&output)
    }

    async fn init(&self) -> Result<(), BoxError> {
        self.run_checked(&["init", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    async fn workspace_new(&self, name: &str) -> Result<(), BoxError> {
        self.run_checked(&["workspace", "new", "-no-color", name])
            .await?;
        Ok(())
    }

    async fn workspace_select(&self, name: &str) -> Result<(), BoxError> {
        self.run_checked(&["workspace", "select", "-no-color", name])
            .await?;
        Ok(())
    }

    async fn plan(&self, var_files: &[PathBuf]) -> Result<Plan, BoxError> {
        let mut args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-detailed-exitcode".to_string(),
        ];
        args.extend(Self::var_file_args(var_files));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let (code, output) = self.run(&arg_refs).await?;
        // -detailed-exitcode: 0 clean, 2 changes present, else failure.
        match code {
            Some(0) => Ok(Plan {
                changes_present: false,
                output,
            }),
            Some(2) => Ok(Plan {
                changes_present: true,
                output,
            }),
            code => Err(Box::new(TerraformCommandError {
                command: "plan".to_string(),
                code,
                output,
            })),
        }
    }

    async fn apply(&self, var_files: &[PathBuf]) -> Result<(), BoxError> {
        let mut args = vec![
            "apply".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-auto-approve".to_string(),
        ];
        args.extend(Self::var_file_args(var_files));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs).await?;
        Ok(())
    }

    async fn validate(&self) -> Result<ValidateOutput, BoxError> {
        // validate -json exits non-zero on invalid configs but still
        // prints the diagnostics document; parse whatever came out.
        let (_, output) = self.run(&["validate", "-json", "-no-color"]).await?;
        Ok(serde_json::from_str(&output)?)
    }
}

// ── Driver implementation ─────────────────────────────────────────────────────

/// The Terraform-backed [`Driver`].
#[derive(Debug)]
pub struct TerraformCli {
    exec: Box<dyn TerraformExec>,
    workspace: String,
    var_files: Vec<PathBuf>,
}

impl TerraformCli {
    /// Builds the driver, verifying the binary's version against the
    /// compiled-in constraint. An unsupported version is a fatal
    /// configuration error.
    pub async fn new(
        exec: Box<dyn TerraformExec>,
        workspace: &str,
        var_files: Vec<PathBuf>,
    ) -> Result<Self, BoxError> {
        let binary_version = exec.version().await?;
        if !version::check(&binary_version) {
            return Err(Box::new(UnsupportedVersionError {
                version: binary_version.to_string(),
                constraint: version::TERRAFORM_VERSION_CONSTRAINT,
            }));
        }
        info!(
            workspace = workspace,
            version = %binary_version,
            "Terraform driver ready"
        );

        // Var-file paths become absolute here, once, so later plan and
        // apply calls are independent of the daemon's cwd.
        let cwd = std::env::current_dir()?;
        let var_files = var_files
            .into_iter()
            .map(|p| if p.is_absolute() { p } else { cwd.join(p) })
            .collect();

        Ok(Self {
            exec,
            workspace: workspace.to_string(),
            var_files,
        })
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Rewrites the known unsupported-argument diagnostics into
    /// actionable messages; everything else renders as-is.
    fn diagnostic_line(&self, diag: &Diagnostic) -> String {
        if diag.detail.contains("\"services\" is not expected here") {
            return format!(
                "module for task \"{}\" is missing the \"services\" variable",
                self.workspace
            );
        }
        if diag.detail.contains("\"catalog_services\" is not expected here") {
            return format!(
                "module for task \"{}\" is missing the \"catalog_services\" variable, set use_as_module_input = false if the module should not receive it",
                self.workspace
            );
        }
        if diag.detail.is_empty() {
            diag.summary.clone()
        } else {
            format!("{}: {}", diag.summary, diag.detail)
        }
    }
}

#[async_trait]
impl Driver for TerraformCli {
    fn set_env(&mut self, mut env: HashMap<String, String>) -> Result<(), BoxError> {
        env.insert(WORKSPACE_ENV.to_string(), self.workspace.clone());
        self.exec.set_env(env);
        Ok(())
    }

    /// Workspace bootstrap. Plain path: init, create workspace
    /// (existing is fine), select it. If init itself fails because the
    /// pinned workspace does not exist yet (empty state), the workspace
    /// is created and init re-runs exactly once; a second failure is
    /// fatal.
    async fn init(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let mut workspace_created = false;

        if let Err(err) = self.exec.init().await {
            if !is_workspace_select_failure(&err) {
                return Err(err);
            }
            info!(
                workspace = %self.workspace,
                "Workspace missing during init; creating it"
            );
            match self.exec.workspace_new(&self.workspace).await {
                Ok(()) => {}
                Err(e) if is_workspace_exists(&e) => {}
                Err(e) => return Err(e),
            }
            workspace_created = true;
            self.exec.init().await?;
        }

        if !workspace_created {
            match self.exec.workspace_new(&self.workspace).await {
                Ok(()) => {}
                Err(e) if is_workspace_exists(&e) => {
                    debug!(workspace = %self.workspace, "Workspace already exists");
                }
                Err(e) => return Err(e),
            }
        }

        self.exec.workspace_select(&self.workspace).await
    }

    async fn plan(&self, _cancel: &CancellationToken) -> Result<Plan, BoxError> {
        self.exec.plan(&self.var_files).await
    }

    async fn apply(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.exec.apply(&self.var_files).await
    }

    async fn validate(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        let result = self.exec.validate().await?;

        let mut lines = Vec::new();
        for diag in &result.diagnostics {
            if diag.severity == "warning" {
                warn!(
                    workspace = %self.workspace,
                    summary = %diag.summary,
                    "terraform validate warning"
                );
            } else {
                lines.push(self.diagnostic_line(diag));
            }
        }

        if result.valid {
            Ok(())
        } else {
            Err(Box::new(ValidationError(lines)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock exec that scripts init results and counts every call.
    #[derive(Debug, Default)]
    struct MockExec {
        init_results: Mutex<Vec<Result<(), String>>>,
        init_calls: AtomicUsize,
        workspace_new_calls: AtomicUsize,
        workspace_select_calls: AtomicUsize,
        workspace_new_error: Mutex<Option<String>>,
        validate_output: Mutex<Option<ValidateOutput>>,
    }

    impl MockExec {
        fn with_init_results(results: Vec<Result<(), String>>) -> Self {
            Self {
                init_results: Mutex::new(results),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TerraformExec for MockExec {
        fn set_env(&mut self, _env: HashMap<String, String>) {}

        async fn version(&self) -> Result<semver::Version, BoxError> {
            Ok(semver::Version::parse("1.5.7").unwrap())
        }

        async fn init(&self) -> Result<(), BoxError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.init_results.lock().unwrap();
            if results.is_empty() {
                return Ok(());
            }
            match results.remove(0) {
                Ok(()) => Ok(()),
                Err(message) => Err(Box::new(TerraformCommandError {
                    command: "init".to_string(),
                    code: Some(1),
                    output: message,
                })),
            }
        }

        async fn workspace_new(&self, name: &str) -> Result<(), BoxError> {
            self.workspace_new_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.workspace_new_error.lock().unwrap().clone() {
                return Err(Box::new(TerraformCommandError {
                    command: format!("workspace new {}", name),
                    code: Some(1),
                    output: message,
                }));
            }
            Ok(())
        }

        async fn workspace_select(&self, _name: &str) -> Result<(), BoxError> {
            self.workspace_select_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn plan(&self, _var_files: &[PathBuf]) -> Result<Plan, BoxError> {
            Ok(Plan {
                changes_present: true,
                output: "1 to add".to_string(),
            })
        }

        async fn apply(&self, _var_files: &[PathBuf]) -> Result<(), BoxError> {
            Ok(())
        }

        async fn validate(&self) -> Result<ValidateOutput, BoxError> {
            Ok(self
                .validate_output
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(ValidateOutput {
                    valid: true,
                    diagnostics: Vec::new(),
                }))
        }
    }

    async fn driver_with(exec: MockExec) -> (TerraformCli, &'static MockExec) {
        // Leak the mock so the test can keep inspecting counters after
        // handing ownership to the driver.
        let leaked: &'static MockExec = Box::leak(Box::new(exec));
        let exec_box: Box<dyn TerraformExec> = Box::new(MockRef(leaked));
        let driver = TerraformCli::new(exec_box, "web", Vec::new()).await.unwrap();
        (driver, leaked)
    }

    /// Forwarding wrapper so the test retains a handle to the mock.
    #[derive(Debug)]
    struct MockRef(&'static MockExec);

    #[async_trait]
    impl TerraformExec for MockRef {
        fn set_env(&mut self, _env: HashMap<String, String>) {}
        async fn version(&self) -> Result<semver::Version, BoxError> {
            self.0.version().await
        }
        async fn init(&self) -> Result<(), BoxError> {
            self.0.init().await
        }
        async fn workspace_new(&self, name: &str) -> Result<(), BoxError> {
            self.0.workspace_new(name).await
        }
        async fn workspace_select(&self, name: &str) -> Result<(), BoxError> {
            self.0.workspace_select(name).await
        }
        async fn plan(&self, var_files: &[PathBuf]) -> Result<Plan, BoxError> {
            self.0.plan(var_files).await
        }
        async fn apply(&self, var_files: &[PathBuf]) -> Result<(), BoxError> {
            self.0.apply(var_files).await
        }
        async fn validate(&self) -> Result<ValidateOutput, BoxError> {
            self.0.validate().await
        }
    }

    #[tokio::test]
    async fn init_plain_path_creates_and_selects_workspace() {
        let (driver, mock) = driver_with(MockExec::default()).await;
        driver.init(&CancellationToken::new()).await.unwrap();
        assert_eq!(mock.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.workspace_new_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.workspace_select_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_workspace_race_recovers_once() {
        // First init fails with the select failure, second succeeds.
        let (driver, mock) = driver_with(MockExec::with_init_results(vec![
            Err("Initializing the backend...\nFailed to select workspace \"web\"".to_string()),
            Ok(()),
        ]))
        .await;

        driver.init(&CancellationToken::new()).await.unwrap();
        assert_eq!(mock.init_calls.load(Ordering::SeqCst), 2);
        assert_eq!(mock.workspace_new_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.workspace_select_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_second_failure_is_fatal() {
        let (driver, mock) = driver_with(MockExec::with_init_results(vec![
            Err("Failed to select workspace \"web\"".to_string()),
            Err("Failed to select workspace \"web\"".to_string()),
        ]))
        .await;

        assert!(driver.init(&CancellationToken::new()).await.is_err());
        // Exactly one recovery attempt; no recursion.
        assert_eq!(mock.init_calls.load(Ordering::SeqCst), 2);
        assert_eq!(mock.workspace_new_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_tolerates_existing_workspace() {
        let mock = MockExec::default();
        *mock.workspace_new_error.lock().unwrap() =
            Some("Workspace \"web\" already exists".to_string());
        let (driver, mock) = driver_with(mock).await;

        driver.init(&CancellationToken::new()).await.unwrap();
        assert_eq!(mock.workspace_new_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.workspace_select_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_unrelated_failure_propagates_without_recovery() {
        let (driver, mock) = driver_with(MockExec::with_init_results(vec![Err(
            "Error: backend configuration changed".to_string(),
        )]))
        .await;

        assert!(driver.init(&CancellationToken::new()).await.is_err());
        assert_eq!(mock.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.workspace_new_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        #[derive(Debug)]
        struct OldVersion;

        #[async_trait]
        impl TerraformExec for OldVersion {
            fn set_env(&mut self, _env: HashMap<String, String>) {}
            async fn version(&self) -> Result<semver::Version, BoxError> {
                Ok(semver::Version::parse("0.13.6").unwrap())
            }
            async fn init(&self) -> Result<(), BoxError> {
                Ok(())
            }
            async fn workspace_new(&self, _name: &str) -> Result<(), BoxError> {
                Ok(())
            }
            async fn workspace_select(&self, _name: &str) -> Result<(), BoxError> {
                Ok(())
            }
            async fn plan(&self, _var_files: &[PathBuf]) -> Result<Plan, BoxError> {
                unreachable!()
            }
            async fn apply(&self, _var_files: &[PathBuf]) -> Result<(), BoxError> {
                unreachable!()
            }
            async fn validate(&self) -> Result<ValidateOutput, BoxError> {
                unreachable!()
            }
        }

        let err = TerraformCli::new(Box::new(OldVersion), "web", Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0.13.6"));
    }

    #[tokio::test]
    async fn validate_rewrites_unsupported_module_arguments() {
        let mock = MockExec::default();
        *mock.validate_output.lock().unwrap() = Some(ValidateOutput {
            valid: false,
            diagnostics: vec![
                Diagnostic {
                    severity: "error".to_string(),
                    summary: "Unsupported argument".to_string(),
                    detail: "An argument named \"services\" is not expected here.".to_string(),
                },
                Diagnostic {
                    severity: "error".to_string(),
                    summary: "Unsupported argument".to_string(),
                    detail: "An argument named \"catalog_services\" is not expected here."
                        .to_string(),
                },
                Diagnostic {
                    severity: "warning".to_string(),
                    summary: "Deprecated attribute".to_string(),
                    detail: String::new(),
                },
            ],
        });
        let (driver, _) = driver_with(mock).await;

        let err = driver.validate(&CancellationToken::new()).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("module for task \"web\" is missing the \"services\" variable"));
        assert!(text.contains("\"catalog_services\""));
        assert!(text.contains("use_as_module_input = false"));
        // The warning is logged, not included in the error.
        assert!(!text.contains("Deprecated attribute"));
    }

    #[tokio::test]
    async fn validate_warnings_alone_succeed() {
        let mock = MockExec::default();
        *mock.validate_output.lock().unwrap() = Some(ValidateOutput {
            valid: true,
            diagnostics: vec![Diagnostic {
                severity: "warning".to_string(),
                summary: "Deprecated attribute".to_string(),
                detail: String::new(),
            }],
        });
        let (driver, _) = driver_with(mock).await;
        driver.validate(&CancellationToken::new()).await.unwrap();
    }
}
