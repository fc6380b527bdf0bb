//! Sidecar counter scraping.
//!
//! The scraper is stateless: one call, one pod, one counter snapshot.
//! Every failure mode (missing pod IP, connect error, non-2xx, bad
//! payload, timeout) collapses to `None`; the collector decides what a
//! missing sample means.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use osiris_core::ProxyStats;

/// Pulls a proxy counter snapshot from one pod.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, pod: &Pod) -> Option<ProxyStats>;
}

/// HTTP scraper hitting the sidecar's stats endpoint on the pod IP.
pub struct HttpScraper {
    stats_port: u16,
    timeout: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpScraper {
    pub fn new(stats_port: u16, timeout: Duration) -> Self {
        Self {
            stats_port,
            timeout,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, pod: &Pod) -> Option<ProxyStats> {
        let pod_name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
        let pod_ip = pod.status.as_ref()?.pod_ip.as_deref()?;
        let uri: http::Uri = format!("http://{}:{}/stats", pod_ip, self.stats_port)
            .parse()
            .ok()?;

        let response = match tokio::time::timeout(self.timeout, self.client.get(uri)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                debug!(pod = pod_name, error = %e, "scrape request failed");
                return None;
            }
            Err(_) => {
                debug!(pod = pod_name, "scrape timed out");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(pod = pod_name, status = %response.status(), "scrape got non-2xx");
            return None;
        }

        let body = response.into_body().collect().await.ok()?.to_bytes();
        match serde_json::from_slice::<ProxyStats>(&body) {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!(pod = pod_name, error = %e, "scrape payload did not parse");
                None
            }
        }
    }
}
