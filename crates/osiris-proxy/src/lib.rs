//! Osiris traffic-measuring proxy sidecar.
//!
//! Runs next to an application container, reverse-proxying one port to
//! the app while counting the requests that represent real traffic.
//! The zeroscaler scrapes the counter through the stats endpoint.
//!
//! # Components
//!
//! - **`proxy`** — counting single-port reverse proxy
//! - **`stats`** — read-only `{proxyID, requestCount}` endpoint

pub mod proxy;
pub mod stats;

pub use proxy::{ProxyConfig, SinglePortProxy};
pub use stats::{stats_router, StatsState};
