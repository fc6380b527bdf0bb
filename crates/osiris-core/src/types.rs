//! Domain types shared across the Osiris control planes.
//!
//! An [`App`] describes everything the activator needs to know about one
//! service port of an opted-in workload: where requests should be relayed
//! after activation and which workload (plus dependencies) to scale.

use std::fmt;
use std::str::FromStr;

use http::Uri;
use serde::{Deserialize, Serialize};

/// The kind of workload a service is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Deployment,
    StatefulSet,
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppKind::Deployment => f.write_str("deployment"),
            AppKind::StatefulSet => f.write_str("statefulset"),
        }
    }
}

impl FromStr for AppKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" => Ok(AppKind::Deployment),
            "statefulset" => Ok(AppKind::StatefulSet),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized workload kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workload kind {0:?}")]
pub struct UnknownKind(pub String);

/// Identity of a scalable workload. This is the key for activation
/// records and metrics collectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub kind: AppKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, kind: AppKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Everything the activator knows about one addressable service port.
///
/// Built by the host index from cluster state; `target_url` always points
/// at the service's cluster IP and the port used to form the index entry,
/// so forwarding after activation goes through the service layer rather
/// than a specific pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub namespace: String,
    pub service_name: String,
    pub name: String,
    pub kind: AppKind,
    pub dependencies: Vec<WorkloadRef>,
    pub target_url: Uri,
    /// Replica count to restore on activation.
    pub min_replicas: i32,
}

impl App {
    /// The workload this app scales.
    pub fn workload(&self) -> WorkloadRef {
        WorkloadRef::new(self.namespace.clone(), self.kind, self.name.clone())
    }
}

/// Counter snapshot reported by one proxy sidecar and consumed by the
/// zeroscaler's scraper. `proxy_id` is stable for the life of the sidecar
/// process, so counter resets across pod restarts show up as new keys
/// rather than as a decrease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    #[serde(rename = "proxyID")]
    pub proxy_id: String,
    #[serde(rename = "requestCount")]
    pub request_count: u64,
}
