//! Osiris activator — wakes scaled-to-zero workloads on demand.
//!
//! The activator sits behind every host that can reach an opted-in
//! service. It keeps a host→app index rebuilt from cluster state; when a
//! request arrives for an app whose replicas are zero, it scales the app
//! (dependencies first), waits for a ready endpoint, and then forwards
//! the original request.
//!
//! # Components
//!
//! - **`index`** — host→app map derived from services and workloads
//! - **`watch`** — cluster caches feeding index rebuilds
//! - **`records`** — single-flight activation records
//! - **`activate`** — the scale-up / wait-for-ready task
//! - **`server`** — the cold-start HTTP listener

pub mod activate;
pub mod index;
pub mod records;
pub mod server;
pub mod watch;

pub use activate::{Activate, ActivateConfig, ActivationError, Activator};
pub use index::build_index;
pub use records::{ActivationRecord, ActivationState, ActivationTracker};
pub use server::{ActivatorServer, ServerConfig};
pub use watch::ClusterState;
