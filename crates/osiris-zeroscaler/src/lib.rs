//! Osiris zeroscaler — scales idle workloads down to zero replicas.
//!
//! For every workload labelled `osiris.dm.gg/enabled=true`, a metrics
//! collector watches the workload's pods, scrapes their proxy sidecars,
//! and patches `replicas` to 0 once the aggregate request counter stops
//! moving across two consecutive ticks.
//!
//! # Components
//!
//! - **`scraper`** — pulls one sidecar's `{proxyID, requestCount}`
//! - **`collector`** — per-workload decision loop
//! - **`controller`** — spawns/cancels collectors from workload watches

pub mod collector;
pub mod controller;
pub mod scraper;

pub use collector::{KubeScaler, MetricsCollector, WorkloadScaler};
pub use controller::{Controller, ControllerConfig};
pub use scraper::{HttpScraper, Scraper};
