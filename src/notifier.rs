//! Trigger notifiers.
//!
//! A notifier sits between the watcher's broadcast and a task's
//! render/trigger path. `notify(value)` returns true when the task
//! should run; false consumes the update silently (the underlying
//! template is still told about updates it must re-render on the next
//! trigger).
//!
//! All variants share the once-mode completion rule: until the task has
//! seen as many dependency deliveries as it has template functions,
//! every delivery counts, and the delivery that reaches the expected
//! count returns true regardless of the variant's own filter. After
//! that, the filters apply. Once-completion is monotonic.
//!
//! `override_once` forces completion without a trigger; used when a
//! task is created at runtime against already-warm dependencies so it
//! does not hang waiting for a count that will never drain.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::watcher::DepValue;

/// Receiver for updates a notifier forwards ahead of the next render.
pub trait Template: Send + Sync {
    fn notify(&self, value: &DepValue);
}

/// Dependency-to-trigger filter. `notify` runs on the watcher's
/// delivery path and must not block beyond the template forwarding;
/// counters live behind a per-notifier mutex.
pub trait Notifier: Send + Sync {
    /// True ⇒ trigger the task.
    fn notify(&self, value: &DepValue) -> bool;

    /// Force `once_complete` without triggering.
    fn override_once(&self);

    fn once_complete(&self) -> bool;
}

// ── Shared once-completion counter ────────────────────────────────────────────

#[derive(Debug)]
struct OnceState {
    once_complete: bool,
    expected: usize,
    received: usize,
}

impl OnceState {
    fn new(expected: usize) -> Self {
        Self {
            once_complete: false,
            expected,
            received: 0,
        }
    }

    /// Counts one delivery; true exactly when this delivery completes
    /// once-mode.
    fn tick(&mut self) -> bool {
        if self.once_complete {
            return false;
        }
        self.received += 1;
        if self.received >= self.expected {
            self.once_complete = true;
            debug!(
                received = self.received,
                expected = self.expected,
                "Once-mode dependency count complete"
            );
            return true;
        }
        false
    }

    fn force_complete(&mut self) {
        self.once_complete = true;
    }
}

// ── Services ──────────────────────────────────────────────────────────────────

/// Triggers on every health-service list; every update is forwarded.
pub struct ServicesNotifier {
    template: Arc<dyn Template>,
    state: Mutex<OnceState>,
}

impl ServicesNotifier {
    pub fn new(template: Arc<dyn Template>, expected_dep_count: usize) -> Self {
        Self {
            template,
            state: Mutex::new(OnceState::new(expected_dep_count)),
        }
    }
}

impl Notifier for ServicesNotifier {
    fn notify(&self, value: &DepValue) -> bool {
        self.template.notify(value);
        let completed = self.state.lock().unwrap().tick();
        matches!(value, DepValue::HealthServiceList(_)) || completed
    }

    fn override_once(&self) {
        self.state.lock().unwrap().force_complete();
    }

    fn once_complete(&self) -> bool {
        self.state.lock().unwrap().once_complete
    }
}

// ── Consul KV ─────────────────────────────────────────────────────────────────

/// Triggers on KV-shaped values.
///
/// A single-key watch registers an existence probe first; when the
/// first KV observation is `KvExists(true)`, one more delivery (the
/// key's value) is still owed, so the expected count grows by one.
pub struct ConsulKvNotifier {
    template: Arc<dyn Template>,
    single_key: bool,
    state: Mutex<KvState>,
}

#[derive(Debug)]
struct KvState {
    once: OnceState,
    first_kv_seen: bool,
}

impl ConsulKvNotifier {
    pub fn new(template: Arc<dyn Template>, expected_dep_count: usize, single_key: bool) -> Self {
        Self {
            template,
            single_key,
            state: Mutex::new(KvState {
                once: OnceState::new(expected_dep_count),
                first_kv_seen: false,
            }),
        }
    }
}

impl Notifier for ConsulKvNotifier {
    fn notify(&self, value: &DepValue) -> bool {
        let is_kv = value.is_kv();
        let (completed, forward) = {
            let mut state = self.state.lock().unwrap();
            if is_kv && !state.first_kv_seen {
                state.first_kv_seen = true;
                if self.single_key && matches!(value, DepValue::KvExists(true)) {
                    state.once.expected += 1;
                    debug!(
                        expected = state.once.expected,
                        "Existing key observed; expecting its value next"
                    );
                }
            }
            let pre_once = !state.once.once_complete;
            (state.once.tick(), is_kv || pre_once)
        };
        if forward {
            self.template.notify(value);
        }
        is_kv || completed
    }

    fn override_once(&self) {
        self.state.lock().unwrap().once.force_complete();
    }

    fn once_complete(&self) -> bool {
        self.state.lock().unwrap().once.once_complete
    }
}

// ── Catalog services ──────────────────────────────────────────────────────────

/// Triggers when the sorted set of catalog service *names* changes;
/// pure tag churn is suppressed.
pub struct CatalogServicesNotifier {
    template: Arc<dyn Template>,
    state: Mutex<CatalogState>,
}

#[derive(Debug)]
struct CatalogState {
    once: OnceState,
    last_names: Vec<String>,
}

impl CatalogServicesNotifier {
    pub fn new(template: Arc<dyn Template>, expected_dep_count: usize) -> Self {
        Self::with_last_names(template, expected_dep_count, Vec::new())
    }

    /// Constructor seeding the known name set, for tasks re-created
    /// against a warm catalog.
    pub fn with_last_names(
        template: Arc<dyn Template>,
        expected_dep_count: usize,
        mut last_names: Vec<String>,
    ) -> Self {
        last_names.sort();
        Self {
            template,
            state: Mutex::new(CatalogState {
                once: OnceState::new(expected_dep_count),
                last_names,
            }),
        }
    }
}

impl Notifier for CatalogServicesNotifier {
    fn notify(&self, value: &DepValue) -> bool {
        match value {
            DepValue::CatalogServiceList(services) => {
                let mut names: Vec<String> =
                    services.iter().map(|s| s.name.clone()).collect();
                names.sort();
                let (changed, completed) = {
                    let mut state = self.state.lock().unwrap();
                    let changed = names != state.last_names;
                    state.last_names = names;
                    (changed, state.once.tick())
                };
                if !changed && !completed {
                    debug!("Catalog update changed tags only; suppressing trigger");
                }
                self.template.notify(value);
                changed || completed
            }
            other => {
                // Non-catalog values only participate in the once
                // counter. The completing delivery may well be one of
                // these; it still has to trigger.
                let (completed, pre_once) = {
                    let mut state = self.state.lock().unwrap();
                    let pre_once = !state.once.once_complete;
                    (state.once.tick(), pre_once)
                };
                if pre_once {
                    self.template.notify(other);
                }
                completed
            }
        }
    }

    fn override_once(&self) {
        self.state.lock().unwrap().once.force_complete();
    }

    fn once_complete(&self) -> bool {
        self.state.lock().unwrap().once.once_complete
    }
}

// ── Suppress ──────────────────────────────────────────────────────────────────

/// Never triggers after once-completion. Schedule-driven tasks use this
/// so template refreshes cannot cause ad-hoc runs; the cron tick is the
/// only trigger source. During once-mode the completing delivery still
/// returns true so the task converges once at startup.
pub struct SuppressNotifier {
    template: Arc<dyn Template>,
    state: Mutex<OnceState>,
}

impl SuppressNotifier {
    pub fn new(template: Arc<dyn Template>, expected_dep_count: usize) -> Self {
        Self {
            template,
            state: Mutex::new(OnceState::new(expected_dep_count)),
        }
    }
}

impl Notifier for SuppressNotifier {
    fn notify(&self, value: &DepValue) -> bool {
        self.template.notify(value);
        self.state.lock().unwrap().tick()
    }

    fn override_once(&self) {
        self.state.lock().unwrap().force_complete();
    }

    fn once_complete(&self) -> bool {
        self.state.lock().unwrap().once_complete
    }
}

// ── Once gate ─────────────────────────────────────────────────────────────────

/// Generic wrapper around a `(should_render, should_trigger)` decision.
///
/// Before once-completion any value renders and triggers; after, the
/// predicate alone decides.
pub struct OnceGateNotifier<F>
where
    F: Fn(&DepValue) -> (bool, bool) + Send + Sync,
{
    template: Arc<dyn Template>,
    decide: F,
    state: Mutex<OnceState>,
}

impl<F> OnceGateNotifier<F>
where
    F: Fn(&DepValue) -> (bool, bool) + Send + Sync,
{
    pub fn new(template: Arc<dyn Template>, expected_dep_count: usize, decide: F) -> Self {
        Self {
            template,
            decide,
            state: Mutex::new(OnceState::new(expected_dep_count)),
        }
    }
}

impl<F> Notifier for OnceGateNotifier<F>
where
    F: Fn(&DepValue) -> (bool, bool) + Send + Sync,
{
    fn notify(&self, value: &DepValue) -> bool {
        let pre_once = {
            let mut state = self.state.lock().unwrap();
            let pre_once = !state.once_complete;
            state.tick();
            pre_once
        };
        if pre_once {
            self.template.notify(value);
            return true;
        }
        let (render, trigger) = (self.decide)(value);
        if render {
            self.template.notify(value);
        }
        trigger
    }

    fn override_once(&self) {
        self.state.lock().unwrap().force_complete();
    }

    fn once_complete(&self) -> bool {
        self.state.lock().unwrap().once_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consul::ServiceEntry;
    use crate::watcher::CatalogServiceEntry;

    /// Template that records every forwarded value.
    #[derive(Default)]
    struct RecordingTemplate {
        received: Mutex<Vec<DepValue>>,
    }

    impl Template for RecordingTemplate {
        fn notify(&self, value: &DepValue) {
            self.received.lock().unwrap().push(value.clone());
        }
    }

    impl RecordingTemplate {
        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    fn health_list() -> DepValue {
        DepValue::HealthServiceList(vec![ServiceEntry::default()])
    }

    fn catalog(names: &[&str]) -> DepValue {
        DepValue::CatalogServiceList(
            names
                .iter()
                .map(|n| CatalogServiceEntry {
                    name: n.to_string(),
                    tags: Vec::new(),
                })
                .collect(),
        )
    }

    fn catalog_tagged(entries: Vec<(&str, Vec<&str>)>) -> DepValue {
        DepValue::CatalogServiceList(
            entries
                .into_iter()
                .map(|(n, tags)| CatalogServiceEntry {
                    name: n.to_string(),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                })
                .collect(),
        )
    }

    // ── Services ──

    #[test]
    fn services_triggers_on_health_lists_only_after_once() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ServicesNotifier::new(template.clone(), 1);

        assert!(notifier.notify(&health_list()));
        assert!(notifier.once_complete());

        assert!(notifier.notify(&health_list()));
        assert!(!notifier.notify(&DepValue::KvExists(true)));
        // Every update was forwarded regardless of trigger decisions.
        assert_eq!(template.count(), 3);
    }

    #[test]
    fn services_completing_tick_triggers_on_any_type() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ServicesNotifier::new(template, 2);

        assert!(!notifier.notify(&DepValue::KvExists(true)));
        // Second delivery completes once-mode, even though it is not a
        // health list.
        assert!(notifier.notify(&DepValue::KvValue("v".to_string())));
        assert!(notifier.once_complete());
    }

    #[test]
    fn services_override_completes_without_trigger() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ServicesNotifier::new(template, 5);
        notifier.override_once();
        assert!(notifier.once_complete());
        // Post-override, only health lists trigger.
        assert!(!notifier.notify(&DepValue::KvExists(true)));
        assert!(notifier.notify(&health_list()));
    }

    // ── Consul KV ──

    #[test]
    fn kv_existing_single_key_bumps_expected_count() {
        // A task watching one service plus one single-key KV path.
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ConsulKvNotifier::new(template, 2, true);

        assert!(!notifier.notify(&health_list()));
        assert!(!notifier.once_complete());

        // KvExists(true): triggers (kv type), bumps expected to 3.
        assert!(notifier.notify(&DepValue::KvExists(true)));
        assert!(!notifier.once_complete());

        // The value delivery completes once at count 3.
        assert!(notifier.notify(&DepValue::KvValue("v".to_string())));
        assert!(notifier.once_complete());
    }

    #[test]
    fn kv_absent_single_key_does_not_bump() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ConsulKvNotifier::new(template, 2, true);

        assert!(!notifier.notify(&health_list()));
        assert!(notifier.notify(&DepValue::KvExists(false)));
        assert!(notifier.once_complete());
    }

    #[test]
    fn kv_recurse_watch_never_bumps() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ConsulKvNotifier::new(template, 1, false);
        assert!(notifier.notify(&DepValue::KvExists(true)));
        assert!(notifier.once_complete());
    }

    #[test]
    fn kv_non_kv_values_suppressed_after_once() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ConsulKvNotifier::new(template.clone(), 1, false);
        assert!(notifier.notify(&DepValue::KvValue("v".to_string())));
        assert!(!notifier.notify(&health_list()));
        assert!(notifier.notify(&DepValue::KeyPairList(Vec::new())));
        // The post-once health list was not forwarded; KV values were.
        assert_eq!(template.count(), 2);
    }

    // ── Catalog services ──

    #[test]
    fn catalog_registration_change_triggers_and_completes_once() {
        // Two expected deliveries; the known name set starts {api, db}.
        let template = Arc::new(RecordingTemplate::default());
        let notifier = CatalogServicesNotifier::with_last_names(
            template,
            2,
            vec!["api".to_string(), "db".to_string()],
        );

        assert!(!notifier.notify(&health_list()));
        assert!(!notifier.once_complete());

        // Different name set: triggers; also the completing delivery.
        assert!(notifier.notify(&catalog(&["redis", "web"])));
        assert!(notifier.once_complete());

        // Same names again: suppressed.
        assert!(!notifier.notify(&catalog(&["web", "redis"])));
    }

    #[test]
    fn catalog_tag_only_change_suppressed() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = CatalogServicesNotifier::new(template, 1);

        assert!(notifier.notify(&catalog_tagged(vec![("api", vec!["v1"])])));
        assert!(notifier.once_complete());

        // Identical sorted names, different tags: no trigger.
        assert!(!notifier.notify(&catalog_tagged(vec![("api", vec!["v1", "canary"])])));
    }

    #[test]
    fn catalog_completion_by_trailing_services_list() {
        // The completing dependency is a services list, arriving after
        // the catalog value.
        let template = Arc::new(RecordingTemplate::default());
        let notifier = CatalogServicesNotifier::new(template, 2);

        assert!(notifier.notify(&catalog(&["api"])));
        assert!(notifier.notify(&health_list()));
        assert!(notifier.once_complete());

        // Post-once, non-catalog values no longer trigger.
        assert!(!notifier.notify(&health_list()));
    }

    // ── Suppress ──

    #[test]
    fn suppress_triggers_only_on_completing_tick() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = SuppressNotifier::new(template.clone(), 2);

        assert!(!notifier.notify(&health_list()));
        assert!(notifier.notify(&health_list()));
        assert!(notifier.once_complete());

        // Everything after completion is suppressed but still forwarded.
        assert!(!notifier.notify(&health_list()));
        assert!(!notifier.notify(&DepValue::KvExists(true)));
        assert_eq!(template.count(), 4);
    }

    // ── Once gate ──

    #[test]
    fn once_gate_pre_completion_always_renders_and_triggers() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = OnceGateNotifier::new(template.clone(), 2, |_| (false, false));

        assert!(notifier.notify(&DepValue::KvExists(true)));
        assert!(notifier.notify(&health_list()));
        assert!(notifier.once_complete());
        assert_eq!(template.count(), 2);

        // After completion the predicate rules.
        assert!(!notifier.notify(&health_list()));
        assert_eq!(template.count(), 2);
    }

    #[test]
    fn once_gate_predicate_controls_render_and_trigger_independently() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = OnceGateNotifier::new(template.clone(), 1, |value| match value {
            DepValue::HealthServiceList(_) => (true, false),
            DepValue::KvValue(_) => (true, true),
            _ => (false, false),
        });
        notifier.notify(&health_list()); // completes once

        assert!(!notifier.notify(&health_list()));
        assert!(notifier.notify(&DepValue::KvValue("v".to_string())));
        assert!(!notifier.notify(&DepValue::KvExists(true)));
        // once + render-only + render-and-trigger forwarded; KvExists not.
        assert_eq!(template.count(), 3);
    }

    #[test]
    fn once_completion_is_monotonic() {
        let template = Arc::new(RecordingTemplate::default());
        let notifier = ServicesNotifier::new(template, 1);
        notifier.notify(&health_list());
        assert!(notifier.once_complete());
        for _ in 0..10 {
            notifier.notify(&DepValue::KvExists(false));
            assert!(notifier.once_complete());
        }
    }
}
