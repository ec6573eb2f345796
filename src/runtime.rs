//! Per-task runtime: the render/trigger loop.
//!
//! Each enabled task runs as one lightweight loop owning its driver,
//! notifier and template. Dependency updates arrive over the watcher's
//! broadcast; the notifier decides whether they trigger. Triggers are
//! coalesced through a single stored permit (`tokio::sync::Notify`): at
//! most one plan-or-apply is in flight per task, and a burst of
//! triggers during execution collapses into one follow-up run that sees
//! the latest snapshot.
//!
//! Cancellation lets an in-flight driver step run to completion (the
//! backend binary is not interruptible across the process boundary),
//! then exits the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, Plan};
use crate::errors::{is_missing_acl, is_non_enterprise, is_non_retryable, BoxError};
use crate::notifier::Notifier;
use crate::retry::Retry;
use crate::task::{RunStatus, Task, TaskStatus, TaskTemplate};
use crate::watcher::{DepHub, DepUpdate};

/// Events the runtime surfaces to the controller.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A classified, non-retryable failure. Retrying will not help;
    /// the operator has to act.
    FatalError { task: String, error: String },
    /// The task was marked for deletion and has now gone idle; the
    /// controller can drop its handle.
    Reaped { task: String },
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// State shared between the controller and a task's runtime loop.
#[derive(Debug)]
pub struct TaskHandle {
    pub name: String,
    enabled: AtomicBool,
    marked_for_deletion: AtomicBool,
    status: Mutex<RunStatus>,
    trigger: Notify,
}

impl TaskHandle {
    pub fn new(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled: AtomicBool::new(enabled),
            marked_for_deletion: AtomicBool::new(false),
            status: Mutex::new(RunStatus::Pending),
            trigger: Notify::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::SeqCst);
        // Wake the loop so an idle task reaps immediately.
        self.trigger.notify_one();
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::SeqCst)
    }

    /// Queues one coalesced trigger.
    pub fn request_trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn status(&self) -> RunStatus {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.lock().unwrap() = status;
    }
}

// ── Runtime ───────────────────────────────────────────────────────────────────

pub struct TaskRuntime {
    task: Task,
    driver: Box<dyn Driver>,
    notifier: Arc<dyn Notifier>,
    template: Arc<TaskTemplate>,
    handle: Arc<TaskHandle>,
    hub: Arc<DepHub>,
    retry: Retry,
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

impl TaskRuntime {
    pub fn new(
        task: Task,
        driver: Box<dyn Driver>,
        hub: Arc<DepHub>,
        events: mpsc::UnboundedSender<RuntimeEvent>,
    ) -> Self {
        let template = Arc::new(TaskTemplate::new());
        let notifier: Arc<dyn Notifier> = task.build_notifier(template.clone()).into();
        let handle = Arc::new(TaskHandle::new(&task.name, task.enabled));
        let retry = Retry::with_max_attempts(task.retries);
        Self {
            task,
            driver,
            notifier,
            template,
            handle,
            hub,
            retry,
            events,
        }
    }

    /// Swap the retry engine; tests use this to clamp waits.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn handle(&self) -> Arc<TaskHandle> {
        self.handle.clone()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            name: self.task.name.clone(),
            enabled: self.handle.is_enabled(),
            status: self.handle.status(),
        }
    }

    /// One full convergence: render the latest snapshot, then plan and
    /// apply through the retry engine. Classified errors short-circuit
    /// inside the engine and surface to the controller.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        let result = self
            .retry
            .run(
                cancel,
                || async move { self.converge(cancel).await },
                &format!("task \"{}\" apply", self.task.name),
            )
            .await;
        match &result {
            Ok(()) => {
                self.handle.set_status(RunStatus::Success);
                info!(task = %self.task.name, "Task applied");
            }
            Err(e) => {
                self.handle.set_status(RunStatus::Failed(e.to_string()));
                self.surface_error(e);
            }
        }
        result
    }

    /// Plan without applying; inspect-mode and plan-for-enable.
    pub async fn plan_once(&self, cancel: &CancellationToken) -> Result<Plan, BoxError> {
        self.render_if_dirty()?;
        self.driver.plan(cancel).await
    }

    async fn converge(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        self.render_if_dirty()?;
        let plan = self.driver.plan(cancel).await?;
        debug!(
            task = %self.task.name,
            changes = plan.changes_present,
            "Plan complete"
        );
        self.driver.apply(cancel).await
    }

    fn render_if_dirty(&self) -> Result<(), BoxError> {
        if self.template.take_dirty() {
            let snapshot = self.hub.snapshot(&self.task.name);
            self.task.render_variables(&snapshot)?;
        }
        Ok(())
    }

    fn surface_error(&self, err: &BoxError) {
        if is_missing_acl(err.as_ref())
            || is_non_enterprise(err.as_ref())
            || is_non_retryable(err.as_ref())
        {
            error!(task = %self.task.name, error = %err, "Task failed with a non-retryable error");
            let _ = self.events.send(RuntimeEvent::FatalError {
                task: self.task.name.clone(),
                error: err.to_string(),
            });
        } else {
            error!(task = %self.task.name, error = %err, "Task failed after retries");
        }
    }

    /// Workspace bootstrap for this task.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        self.driver.init(cancel).await
    }

    /// Module validation for this task.
    pub async fn validate(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        self.driver.validate(cancel).await
    }

    /// Daemon loop: pump dependency updates through the notifier and
    /// converge on each coalesced trigger until cancelled or reaped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let pump = tokio::spawn(pump_events(
            self.task.name.clone(),
            self.notifier.clone(),
            self.handle.clone(),
            self.hub.subscribe(),
            cancel.clone(),
        ));

        let ticker = self.task.schedule().map(|schedule| {
            tokio::spawn(schedule_ticker(
                self.task.name.clone(),
                schedule,
                self.handle.clone(),
                cancel.clone(),
            ))
        });

        info!(task = %self.task.name, "Task runtime started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.handle.trigger.notified() => {
                    if self.handle.is_marked_for_deletion() {
                        break;
                    }
                    if !self.handle.is_enabled() {
                        debug!(task = %self.task.name, "Trigger ignored; task disabled");
                        continue;
                    }
                    // Errors are reflected in status and surfaced via
                    // the event channel; the loop keeps serving.
                    let _ = self.run_once(&cancel).await;

                    // Idle transition: a deletion marked mid-run reaps
                    // here, never mid-flight.
                    if self.handle.is_marked_for_deletion() {
                        break;
                    }
                }
            }
        }

        pump.abort();
        if let Some(t) = ticker {
            t.abort();
        }

        if self.handle.is_marked_for_deletion() {
            self.hub.deregister_task(&self.task.name);
            info!(task = %self.task.name, "Task deleted");
            let _ = self.events.send(RuntimeEvent::Reaped {
                task: self.task.name.clone(),
            });
        } else {
            info!(task = %self.task.name, "Task runtime stopped");
        }
    }
}

/// Delivers this task's dependency updates to its notifier. Runs on its
/// own lightweight thread so notification never blocks behind an
/// in-flight apply.
async fn pump_events(
    task: String,
    notifier: Arc<dyn Notifier>,
    handle: Arc<TaskHandle>,
    mut events: broadcast::Receiver<DepUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return,
            update = events.recv() => update,
        };
        match update {
            Ok(update) if update.task == task => {
                if notifier.notify(&update.value) {
                    debug!(task = %task, dep = %update.id, "Dependency update triggered task");
                    handle.request_trigger();
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Fall behind and the snapshot still holds the latest
                // values; trigger once to catch up.
                warn!(task = %task, missed = missed, "Dependency updates lagged");
                handle.request_trigger();
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Fires the task's trigger at each cron boundary.
async fn schedule_ticker(
    task: String,
    schedule: cron::Schedule,
    handle: Arc<TaskHandle>,
    cancel: CancellationToken,
) {
    loop {
        let now = chrono::Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            warn!(task = %task, "Cron schedule has no future fire times");
            return;
        };
        let wait = (next - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {
                debug!(task = %task, "Schedule fired");
                handle.request_trigger();
            }
        }
    }
}
