//! Shared-field compatibility check for highly-available peers.
//!
//! Two daemon instances may serve the same task set in an HA pair only
//! if their configurations agree on every *shared* field. Instance-local
//! fields (`id`, `port`, `working_dir`) are excluded from the
//! comparison; everything else must match.
//!
//! Rust has no runtime reflection, so the per-field visitor is generated
//! at build time by `diff_fields!`; the observable contract is the same
//! as a reflective walk: every differing shared leaf is reported with a
//! dotted path. Type mismatches and null arguments are unrepresentable
//! here — `is_compatible` takes two `&Config`, so the type system
//! enforces what a reflective implementation would have to panic on.

use tracing::warn;

use crate::config::Config;

/// One shared field on which two configurations disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub path: String,
    pub base: String,
    pub candidate: String,
}

impl FieldDiff {
    fn new(path: String, base: String, candidate: String) -> Self {
        Self {
            path,
            base,
            candidate,
        }
    }
}

/// Compares `$base.$field` against `$cand.$field` for every listed
/// field, recording a [`FieldDiff`] per inequality.
macro_rules! diff_fields {
    ($diffs:expr, $path:expr, $base:expr, $cand:expr, { $($field:ident),* $(,)? }) => {
        $(
            if $base.$field != $cand.$field {
                $diffs.push(FieldDiff::new(
                    format!("{}.{}", $path, stringify!($field)),
                    format!("{:?}", $base.$field),
                    format!("{:?}", $cand.$field),
                ));
            }
        )*
    };
}

/// True iff `base` and `candidate` agree on every shared field.
///
/// Every inequality is logged with its dotted path before returning.
pub fn is_compatible(base: &Config, candidate: &Config) -> bool {
    let diffs = shared_field_diffs(base, candidate);
    for diff in &diffs {
        warn!(
            field = %diff.path,
            base = %diff.base,
            candidate = %diff.candidate,
            "Incompatible config: shared field differs between HA peers"
        );
    }
    diffs.is_empty()
}

/// The full list of differing shared leaves. `id`, `port` and
/// `working_dir` are instance-local and never compared.
pub fn shared_field_diffs(base: &Config, candidate: &Config) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();

    diff_fields!(diffs, "config", base, candidate, { ha_group });
    diff_fields!(diffs, "config.log", base.log, candidate.log, { level, json });
    diff_fields!(diffs, "config.tls", base.tls, candidate.tls, { enabled });
    diff_fields!(diffs, "config.consul", base.consul, candidate.consul, {
        address,
        token,
        datacenter,
        namespace,
        transport_timeout_secs,
        retries,
    });
    diff_fields!(
        diffs,
        "config.service_registration",
        base.service_registration,
        candidate.service_registration,
        { enabled, service_name, namespace, default_check, check_address }
    );
    diff_fields!(diffs, "config.driver", base.driver, candidate.driver, {
        exec_path,
        persist_log,
        log,
        dev_mode,
    });

    if base.tasks.len() != candidate.tasks.len() {
        diffs.push(FieldDiff::new(
            "config.tasks".to_string(),
            format!("{} tasks", base.tasks.len()),
            format!("{} tasks", candidate.tasks.len()),
        ));
        return diffs;
    }

    for (i, (a, b)) in base.tasks.iter().zip(candidate.tasks.iter()).enumerate() {
        let path = format!("config.tasks[{}]", i);
        // Condition and module-input variants compare as whole values.
        diff_fields!(diffs, &path, a, b, {
            name,
            description,
            enabled,
            module,
            version,
            condition,
            module_inputs,
            variable_files,
            providers,
            retries,
        });
        // working_dir is derived from the instance-local base dir; skipped.
    }

    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConditionConfig, ScheduleConditionConfig};

    #[test]
    fn identical_configs_are_compatible() {
        let base = Config::for_testing();
        let candidate = base.clone();
        assert!(shared_field_diffs(&base, &candidate).is_empty());
        assert!(is_compatible(&base, &candidate));
    }

    #[test]
    fn instance_local_fields_do_not_matter() {
        let base = Config::for_testing();
        let mut candidate = base.clone();
        candidate.id = "cts-other-host".to_string();
        candidate.port = 9999;
        candidate.working_dir = "/elsewhere".into();
        assert!(is_compatible(&base, &candidate));
    }

    #[test]
    fn shared_scalar_difference_flips_result() {
        let base = Config::for_testing();
        let mut candidate = base.clone();
        candidate.consul.address = "http://other:8500".to_string();
        let diffs = shared_field_diffs(&base, &candidate);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "config.consul.address");
        assert!(!is_compatible(&base, &candidate));
    }

    #[test]
    fn one_diff_per_differing_leaf() {
        let base = Config::for_testing();
        let mut candidate = base.clone();
        candidate.log.level = "debug".to_string();
        candidate.consul.datacenter = Some("dc2".to_string());
        candidate.tasks[0].module = "./modules/other".to_string();
        let diffs = shared_field_diffs(&base, &candidate);
        let paths: Vec<&str> = diffs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(diffs.len(), 3);
        assert!(paths.contains(&"config.log.level"));
        assert!(paths.contains(&"config.consul.datacenter"));
        assert!(paths.contains(&"config.tasks[0].module"));
    }

    #[test]
    fn task_count_mismatch_is_a_single_diff() {
        let base = Config::for_testing();
        let mut candidate = base.clone();
        candidate.tasks.clear();
        let diffs = shared_field_diffs(&base, &candidate);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "config.tasks");
    }

    #[test]
    fn condition_variant_change_detected() {
        let base = Config::for_testing();
        let mut candidate = base.clone();
        candidate.tasks[0].condition = ConditionConfig::Schedule(ScheduleConditionConfig {
            cron: "0 0 * * * * *".to_string(),
        });
        let diffs = shared_field_diffs(&base, &candidate);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "config.tasks[0].condition");
    }
}
