//! Controller: supervises every task across once, inspect and daemon
//! modes.
//!
//! Startup is the same in all modes: the finalized config produces one
//! driver + notifier + runtime per task, with the backend binary
//! verified while the first driver is built. The modes then diverge:
//!
//! - `inspect`: plan each enabled task, surface the textual plans, exit.
//! - `once`: converge each enabled task once in parallel, exit.
//! - `daemon`: spawn the runtimes and the dependency watcher, wait for
//!   every notifier to complete once-mode, then keep reacting to
//!   triggers until shutdown.
//!
//! Task lifecycle operations (create / enable / disable / delete) are
//! the capability the outer HTTP surface consumes. Delete is two-phase:
//! an idle task is removed immediately, an in-flight one is marked and
//! reaped at its next idle transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigError, TaskConfig};
use crate::consul::ConsulClient;
use crate::driver::{Driver, Plan, PrinterDriver};
use crate::errors::{chain, BoxError};
use crate::runtime::{RuntimeEvent, TaskRuntime};
use crate::task::{Task, TaskStatus};
use crate::terraform::{
    TerraformBinary, TerraformCli, TerraformCommandError, UnsupportedVersionError,
};
use crate::watcher::{ConsulWatcher, DepHub, DEFAULT_POLL_INTERVAL};

/// Process exit codes; part of the contract to shell callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    Error = 10,
    Interrupt = 11,
    RequiredFlagsError = 12,
    ParseFlagsError = 13,
    ConfigError = 14,
    DriverError = 15,
}

/// Mode chosen at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Inspect,
    Daemon,
}

/// Maps an error chain onto the exit-code contract: configuration
/// problems exit 14, backend-driver failures 15, everything else 10.
pub fn exit_code_for(err: &BoxError) -> ExitCode {
    for e in chain(err.as_ref()) {
        if e.downcast_ref::<ConfigError>().is_some() {
            return ExitCode::ConfigError;
        }
        if e.downcast_ref::<UnsupportedVersionError>().is_some()
            || e.downcast_ref::<TerraformCommandError>().is_some()
        {
            return ExitCode::DriverError;
        }
    }
    ExitCode::Error
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("task \"{0}\" does not exist")]
    UnknownTask(String),

    #[error("task \"{0}\" already exists")]
    DuplicateTask(String),
}

pub struct Controller {
    config: Config,
    client: Arc<ConsulClient>,
    hub: Arc<DepHub>,
    watcher: Arc<ConsulWatcher>,
    tasks: RwLock<HashMap<String, Arc<TaskRuntime>>>,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RuntimeEvent>>>,
    cancel: CancellationToken,
    daemon_running: AtomicBool,
    /// Join handles for every spawned task-runtime loop, including
    /// tasks created while the daemon is running. Drained at shutdown
    /// so no loop outlives [`Controller::run`].
    runtime_joins: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Controller {
    /// Builds the controller and one runtime per configured task. The
    /// backend binary is verified as part of driver construction; a
    /// missing or unsupported binary fails here.
    pub async fn new(config: Config, cancel: CancellationToken) -> Result<Self, BoxError> {
        let client = Arc::new(ConsulClient::new(&config.consul)?);
        let hub = Arc::new(DepHub::new());
        let watcher = Arc::new(ConsulWatcher::new(
            client.clone(),
            hub.clone(),
            DEFAULT_POLL_INTERVAL,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let controller = Self {
            config,
            client,
            hub,
            watcher,
            tasks: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            cancel,
            daemon_running: AtomicBool::new(false),
            runtime_joins: std::sync::Mutex::new(Vec::new()),
        };

        for task_config in controller.config.tasks.clone() {
            controller.build_runtime(task_config).await?;
        }
        Ok(controller)
    }

    pub fn consul_client(&self) -> Arc<ConsulClient> {
        self.client.clone()
    }

    fn driver_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "CONSUL_HTTP_ADDR".to_string(),
            self.config.consul.address.clone(),
        );
        if let Some(token) = &self.config.consul.token {
            env.insert("CONSUL_HTTP_TOKEN".to_string(), token.clone());
        }
        env
    }

    async fn build_driver(&self, task: &Task) -> Result<Box<dyn Driver>, BoxError> {
        if self.config.driver.dev_mode {
            let mut driver = PrinterDriver::new(&task.name);
            driver.set_env(self.driver_env())?;
            return Ok(Box::new(driver));
        }

        std::fs::create_dir_all(&task.working_dir)?;
        let binary = TerraformBinary::new(
            self.config.driver.exec_path.as_deref(),
            &task.working_dir,
            self.config.driver.log,
            self.config.driver.persist_log,
        );
        let mut driver = TerraformCli::new(
            Box::new(binary),
            task.workspace(),
            task.variable_files.clone(),
        )
        .await?;
        driver.set_env(self.driver_env())?;
        Ok(Box::new(driver))
    }

    /// Registers the task's dependencies and stores its runtime.
    async fn build_runtime(&self, config: TaskConfig) -> Result<Arc<TaskRuntime>, BoxError> {
        let name = config.name.clone();
        if self.tasks.read().unwrap().contains_key(&name) {
            return Err(Box::new(ControllerError::DuplicateTask(name)));
        }

        let task = Task::from_config(config);
        for spec in task.deps() {
            self.hub.register(&task.name, spec)?;
        }
        let driver = self.build_driver(&task).await?;
        let runtime = Arc::new(TaskRuntime::new(
            task,
            driver,
            self.hub.clone(),
            self.events_tx.clone(),
        ));
        self.tasks
            .write()
            .unwrap()
            .insert(name, runtime.clone());
        Ok(runtime)
    }

    fn runtimes(&self) -> Vec<Arc<TaskRuntime>> {
        self.tasks.read().unwrap().values().cloned().collect()
    }

    /// Spawns a task's daemon loop and records its handle for the
    /// shutdown drain.
    fn spawn_runtime_loop(&self, runtime: Arc<TaskRuntime>) {
        let handle = tokio::spawn(runtime.run(self.cancel.clone()));
        self.runtime_joins.lock().unwrap().push(handle);
    }

    /// Awaits every recorded runtime loop. Loops spawned while a drain
    /// pass is in flight are caught by the next pass.
    async fn drain_runtime_loops(&self) {
        loop {
            let handles: Vec<tokio::task::JoinHandle<()>> =
                std::mem::take(&mut *self.runtime_joins.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                // A panicked loop still counts as exited.
                let _ = handle.await;
            }
        }
    }

    /// Number of task-runtime loops that have not yet exited. Zero
    /// after shutdown completes.
    pub fn pending_runtime_loops(&self) -> usize {
        self.runtime_joins
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    fn runtime(&self, name: &str) -> Result<Arc<TaskRuntime>, ControllerError> {
        self.tasks
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownTask(name.to_string()))
    }

    // ── Modes ─────────────────────────────────────────────────────────

    /// Once pass: converge every enabled task exactly once, in
    /// parallel. Returns the first failure after every task finished.
    pub async fn once(&self) -> Result<(), BoxError> {
        self.watcher.poll_once(&self.cancel).await;

        let mut set: JoinSet<(String, Result<(), BoxError>)> = JoinSet::new();
        for runtime in self.runtimes() {
            if !runtime.handle().is_enabled() {
                continue;
            }
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let name = runtime.task().name.clone();
                let result = async {
                    runtime.init(&cancel).await?;
                    runtime.validate(&cancel).await?;
                    runtime.run_once(&cancel).await
                }
                .await;
                (name, result)
            });
        }

        // First failure wins, with its concrete type intact so the
        // caller can still classify it into an exit code.
        let mut first_error: Option<BoxError> = None;
        while let Some(joined) = set.join_next().await {
            let (name, result) = joined?;
            match result {
                Ok(()) => info!(task = %name, "Once-mode convergence complete"),
                Err(e) => {
                    error!(task = %name, error = %e, "Once-mode convergence failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Inspect pass: plan each enabled task and return the plans.
    pub async fn inspect(&self) -> Result<Vec<(String, Plan)>, BoxError> {
        self.watcher.poll_once(&self.cancel).await;

        let mut plans = Vec::new();
        for runtime in self.runtimes() {
            if !runtime.handle().is_enabled() {
                continue;
            }
            runtime.init(&self.cancel).await?;
            let plan = runtime.plan_once(&self.cancel).await?;
            info!(
                task = %runtime.task().name,
                changes = plan.changes_present,
                "Inspection plan complete"
            );
            plans.push((runtime.task().name.clone(), plan));
        }
        Ok(plans)
    }

    /// Daemon loop: spawn every runtime and the watcher, wait for
    /// once-mode to complete across all enabled tasks, then serve until
    /// cancelled. Returns after every supervised loop has exited.
    pub async fn run(self: Arc<Self>) -> Result<(), BoxError> {
        self.daemon_running.store(true, Ordering::SeqCst);

        let mut joins: JoinSet<()> = JoinSet::new();

        // Controller-side event listener: reaps deleted tasks, records
        // fatal task errors.
        let events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("controller daemon loop started twice");
        joins.spawn(event_loop(events_rx, self.cancel.clone(), self.clone()));

        {
            let watcher = self.watcher.clone();
            let cancel = self.cancel.clone();
            joins.spawn(async move { watcher.run(cancel).await });
        }

        for runtime in self.runtimes() {
            self.spawn_runtime_loop(runtime);
        }

        self.wait_for_once_completion().await;
        info!("Once-mode complete; entering daemon loop");

        self.cancel.cancelled().await;
        info!("Shutdown requested; draining task loops");
        self.drain_runtime_loops().await;
        while joins.join_next().await.is_some() {}
        Ok(())
    }

    /// Blocks until every enabled task's notifier reports
    /// once-completion (or shutdown).
    async fn wait_for_once_completion(&self) {
        loop {
            let pending: Vec<String> = self
                .runtimes()
                .iter()
                .filter(|r| r.handle().is_enabled() && !r.notifier().once_complete())
                .map(|r| r.task().name.clone())
                .collect();
            if pending.is_empty() {
                return;
            }
            debug!(pending = ?pending, "Waiting for once-mode completion");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    // ── Task lifecycle ────────────────────────────────────────────────

    /// Creates a task at runtime. Against already-warm dependencies the
    /// new notifier would wait forever for deliveries that happened
    /// before it existed, so once-completion is forced.
    pub async fn create_task(&self, config: TaskConfig) -> Result<(), BoxError> {
        let name = config.name.clone();
        let runtime = self.build_runtime(config).await?;
        runtime.notifier().override_once();

        if self.daemon_running.load(Ordering::SeqCst) {
            self.spawn_runtime_loop(runtime.clone());
            // First convergence for the new task.
            runtime.handle().request_trigger();
        }
        info!(task = %name, "Task created");
        Ok(())
    }

    pub fn enable_task(&self, name: &str) -> Result<(), BoxError> {
        let runtime = self.runtime(name)?;
        runtime.handle().set_enabled(true);
        runtime.handle().request_trigger();
        info!(task = %name, "Task enabled");
        Ok(())
    }

    pub fn disable_task(&self, name: &str) -> Result<(), BoxError> {
        let runtime = self.runtime(name)?;
        runtime.handle().set_enabled(false);
        info!(task = %name, "Task disabled");
        Ok(())
    }

    /// Two-phase delete. Never destroys infrastructure: the workspace
    /// and its state stay behind.
    ///
    /// Marks the task and returns immediately; an idle task reaps on
    /// the wake this triggers, an in-flight one at its next idle
    /// transition. Outside the daemon loop there is nothing in flight,
    /// so removal happens here.
    pub async fn delete_task(&self, name: &str) -> Result<(), BoxError> {
        let runtime = self.runtime(name)?;
        runtime.handle().mark_for_deletion();

        if !self.daemon_running.load(Ordering::SeqCst) {
            self.tasks.write().unwrap().remove(name);
            self.hub.deregister_task(name);
            info!(task = %name, "Task deleted");
        } else {
            info!(task = %name, "Task marked for deletion");
        }
        Ok(())
    }

    /// Removes a reaped task's handle. Called from the daemon's event
    /// listener.
    pub fn remove_reaped(&self, name: &str) {
        self.tasks.write().unwrap().remove(name);
    }

    /// Plan a single task for the enable workflow: textual plan plus
    /// whether changes are present.
    pub async fn inspect_task(&self, name: &str) -> Result<Plan, BoxError> {
        let runtime = self.runtime(name)?;
        runtime.init(&self.cancel).await?;
        Ok(runtime.plan_once(&self.cancel).await?)
    }

    pub fn task_status(&self, name: &str) -> Result<TaskStatus, BoxError> {
        Ok(self.runtime(name)?.status())
    }

    pub fn tasks(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> =
            self.runtimes().iter().map(|r| r.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

async fn event_loop(
    mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
    cancel: CancellationToken,
    controller: Arc<Controller>,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(RuntimeEvent::FatalError { task, error: message }) => {
                error!(task = %task, error = %message, "Task reported a fatal error");
            }
            Some(RuntimeEvent::Reaped { task }) => {
                controller.remove_reaped(&task);
                info!(task = %task, "Task reaped");
            }
            None => return,
        }
    }
}
