//! Runs Terraform tasks in response to Consul catalog, health and KV
//! changes.
//!
//! A **task** binds a condition (service changes, catalog membership,
//! KV changes, or a cron schedule) to a Terraform module. When the
//! condition fires, the daemon re-renders the module's variables from
//! the current catalog state and drives `init`/`plan`/`apply` against
//! the task's workspace.
//!
//! Crate layout, leaves first: [`retry`] and [`errors`] underpin every
//! outbound call; [`consul`] wraps the agent API; [`watcher`] turns
//! polled state into dependency updates; [`notifier`] filters updates
//! into triggers; [`driver`]/[`terraform`] run the backend;
//! [`runtime`] is the per-task loop and [`controller`] supervises all
//! of it across once / inspect / daemon modes.

pub mod compat;
pub mod config;
pub mod consul;
pub mod controller;
pub mod driver;
pub mod errors;
pub mod health;
pub mod logging;
pub mod notifier;
pub mod registration;
pub mod retry;
pub mod runtime;
pub mod task;
pub mod terraform;
pub mod version;
pub mod watcher;
