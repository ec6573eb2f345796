//! Provisioning driver contract.
//!
//! Any backend able to converge a task's module implements [`Driver`].
//! Drivers are per-task; the same lifecycle is used by once-mode,
//! inspect-mode and the daemon loop. The real backend is the Terraform
//! CLI driver in [`crate::terraform`]; [`PrinterDriver`] is the
//! in-process stand-in that only logs, for development and dry wiring.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::BoxError;

/// Result of a plan: whether anything would change, and the backend's
/// textual rendering of the plan for inspect-mode output.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub changes_present: bool,
    pub output: String,
}

/// Uniform backend lifecycle. Calls take a cancellation token;
/// cancellation interrupts waits, not an in-flight backend invocation.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Environment inherited by every backend invocation.
    fn set_env(&mut self, env: HashMap<String, String>) -> Result<(), BoxError>;

    /// Prepares the task's workspace. Idempotent.
    async fn init(&self, cancel: &CancellationToken) -> Result<(), BoxError>;

    async fn plan(&self, cancel: &CancellationToken) -> Result<Plan, BoxError>;

    async fn apply(&self, cancel: &CancellationToken) -> Result<(), BoxError>;

    /// Checks the rendered module configuration without touching state.
    async fn validate(&self, cancel: &CancellationToken) -> Result<(), BoxError>;
}

/// Driver that logs each lifecycle call and changes nothing. Useful in
/// development to watch what the daemon would do.
#[derive(Debug)]
pub struct PrinterDriver {
    task_name: String,
    env: HashMap<String, String>,
}

impl PrinterDriver {
    pub fn new(task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            env: HashMap::new(),
        }
    }
}

#[async_trait]
impl Driver for PrinterDriver {
    fn set_env(&mut self, env: HashMap<String, String>) -> Result<(), BoxError> {
        info!(task = %self.task_name, vars = env.len(), "printer driver: set env");
        self.env = env;
        Ok(())
    }

    async fn init(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        info!(task = %self.task_name, "printer driver: init");
        Ok(())
    }

    async fn plan(&self, _cancel: &CancellationToken) -> Result<Plan, BoxError> {
        info!(task = %self.task_name, "printer driver: plan");
        Ok(Plan {
            changes_present: false,
            output: format!("printer driver plan for task \"{}\"", self.task_name),
        })
    }

    async fn apply(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        info!(task = %self.task_name, "printer driver: apply");
        Ok(())
    }

    async fn validate(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        info!(task = %self.task_name, "printer driver: validate");
        Ok(())
    }
}
