//! The `osiris.dm.gg/*` annotation surface.
//!
//! Annotation values may arrive wrapped in single quotes and padded with
//! whitespace (a common artifact of templated manifests); [`clean_value`]
//! strips both and is idempotent.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::types::{AppKind, WorkloadRef};

/// Label on workloads that opts them into zeroscaling.
pub const ENABLED: &str = "osiris.dm.gg/enabled";
/// On services: name of the deployment backing this service.
pub const DEPLOYMENT: &str = "osiris.dm.gg/deployment";
/// On services: name of the statefulset backing this service.
pub const STATEFULSET: &str = "osiris.dm.gg/statefulset";
/// On workloads: comma list of `<kind>:<namespace>/<name>` dependencies.
pub const DEPENDENCIES: &str = "osiris.dm.gg/dependencies";
/// On services: which port unsuffixed ingress hostnames map to.
pub const INGRESS_DEFAULT_PORT: &str = "osiris.dm.gg/ingressDefaultPort";
/// On workloads: seconds between zeroscaler decision ticks.
pub const METRICS_CHECK_INTERVAL: &str = "osiris.dm.gg/metricsCheckInterval";
/// On workloads: replica count restored by activation (default 1).
pub const MIN_REPLICAS: &str = "osiris.dm.gg/minReplicas";

fn ingress_hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^osiris\.dm\.gg/ingressHostname(?:-\d+)?$").unwrap())
}

fn load_balancer_hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^osiris\.dm\.gg/loadBalancerHostname(?:-\d+)?$").unwrap())
}

/// Whether `key` names an ingress hostname (`ingressHostname` or
/// `ingressHostname-<n>`).
pub fn is_ingress_hostname_key(key: &str) -> bool {
    ingress_hostname_re().is_match(key)
}

/// Whether `key` names a load-balancer hostname (`loadBalancerHostname`
/// or `loadBalancerHostname-<n>`).
pub fn is_load_balancer_hostname_key(key: &str) -> bool {
    load_balancer_hostname_re().is_match(key)
}

/// Trim whitespace, then strip one leading and one trailing single quote.
pub fn clean_value(raw: &str) -> &str {
    let value = raw.trim();
    let value = value.strip_prefix('\'').unwrap_or(value);
    value.strip_suffix('\'').unwrap_or(value)
}

/// Parse a `dependencies` annotation value into workload references.
///
/// Entries look like `deployment:ns/name` (kind is case-insensitive).
/// Malformed entries are logged and skipped so one typo cannot take the
/// whole list down.
pub fn parse_dependencies(raw: &str) -> Vec<WorkloadRef> {
    let mut deps = Vec::new();
    for entry in clean_value(raw).split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match parse_dependency(entry) {
            Some(dep) => deps.push(dep),
            None => warn!(dependency = entry, "skipping malformed dependency annotation"),
        }
    }
    deps
}

fn parse_dependency(entry: &str) -> Option<WorkloadRef> {
    let (kind, rest) = entry.split_once(':')?;
    let kind: AppKind = kind.parse().ok()?;
    let (namespace, name) = rest.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(WorkloadRef::new(namespace, kind, name))
}

/// Parse the `metricsCheckInterval` annotation (whole seconds).
pub fn parse_metrics_check_interval(raw: &str) -> Option<Duration> {
    let secs: u64 = clean_value(raw).parse().ok()?;
    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(secs))
}

/// Parse the `minReplicas` annotation.
pub fn parse_min_replicas(raw: &str) -> Option<i32> {
    let n: i32 = clean_value(raw).parse().ok()?;
    if n < 1 {
        return None;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_value_strips_quotes_and_whitespace() {
        assert_eq!(clean_value("  'my-host.example.com'  "), "my-host.example.com");
        assert_eq!(clean_value("plain"), "plain");
        assert_eq!(clean_value("'just-left"), "just-left");
        assert_eq!(clean_value("just-right'"), "just-right");
        assert_eq!(clean_value(""), "");
    }

    #[test]
    fn clean_value_is_idempotent() {
        for raw in ["  'abc'  ", "'abc'", "abc", "''", "  "] {
            let once = clean_value(raw);
            assert_eq!(clean_value(once), once);
        }
    }

    #[test]
    fn clean_value_strips_only_one_quote_per_side() {
        assert_eq!(clean_value("''double''"), "'double'");
    }

    #[test]
    fn hostname_key_families() {
        assert!(is_ingress_hostname_key("osiris.dm.gg/ingressHostname"));
        assert!(is_ingress_hostname_key("osiris.dm.gg/ingressHostname-2"));
        assert!(!is_ingress_hostname_key("osiris.dm.gg/ingressHostname-"));
        assert!(!is_ingress_hostname_key("osiris.dm.gg/loadBalancerHostname"));

        assert!(is_load_balancer_hostname_key("osiris.dm.gg/loadBalancerHostname"));
        assert!(is_load_balancer_hostname_key("osiris.dm.gg/loadBalancerHostname-10"));
        assert!(!is_load_balancer_hostname_key("osiris.dm.gg/loadBalancerHostnameX"));
    }

    #[test]
    fn parse_dependencies_happy_path() {
        let deps = parse_dependencies("deployment:ns/db,statefulset:other/cache");
        assert_eq!(
            deps,
            vec![
                WorkloadRef::new("ns", AppKind::Deployment, "db"),
                WorkloadRef::new("other", AppKind::StatefulSet, "cache"),
            ]
        );
    }

    #[test]
    fn parse_dependencies_kind_is_case_insensitive() {
        let deps = parse_dependencies("Deployment:ns/db");
        assert_eq!(deps, vec![WorkloadRef::new("ns", AppKind::Deployment, "db")]);
    }

    #[test]
    fn parse_dependencies_skips_malformed_entries() {
        let deps = parse_dependencies("deployment:ns/db,daemonset:ns/x,no-colon,deployment:nopath");
        assert_eq!(deps, vec![WorkloadRef::new("ns", AppKind::Deployment, "db")]);
    }

    #[test]
    fn parse_dependencies_handles_empty_and_quoted_values() {
        assert!(parse_dependencies("").is_empty());
        assert!(parse_dependencies("  ").is_empty());
        let deps = parse_dependencies("'deployment:ns/db'");
        assert_eq!(deps, vec![WorkloadRef::new("ns", AppKind::Deployment, "db")]);
    }

    #[test]
    fn parse_metrics_check_interval_values() {
        assert_eq!(
            parse_metrics_check_interval("30"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_metrics_check_interval("'60'"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(parse_metrics_check_interval("0"), None);
        assert_eq!(parse_metrics_check_interval("abc"), None);
    }

    #[test]
    fn parse_min_replicas_values() {
        assert_eq!(parse_min_replicas("2"), Some(2));
        assert_eq!(parse_min_replicas("'3'"), Some(3));
        assert_eq!(parse_min_replicas("0"), None);
        assert_eq!(parse_min_replicas("-1"), None);
        assert_eq!(parse_min_replicas("many"), None);
    }
}
