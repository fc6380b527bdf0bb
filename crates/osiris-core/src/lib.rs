//! Shared building blocks for the Osiris control planes.
//!
//! This crate holds the vocabulary the proxy sidecar, zeroscaler, and
//! activator agree on:
//!
//! - **`types`** — application descriptors and workload identity keys
//! - **`annotations`** — the `osiris.dm.gg/*` annotation surface
//! - **`scale`** — JSON-patch replica mutation against the cluster API

pub mod annotations;
pub mod headers;
pub mod scale;
pub mod types;

pub use scale::{ScaleError, activate_replicas, set_replicas};
pub use types::{App, AppKind, ProxyStats, WorkloadRef};
