//! Per-workload metrics collection and the idle decision.
//!
//! A collector owns a snapshot of its workload's pods (fed by a pod
//! watcher) and a decision loop driven by a ticker. A tick scrapes every
//! pod concurrently, sums the counters per proxy ID, and scales the
//! workload to zero when the total is unchanged since the previous tick.
//!
//! A tick never decides on partial data: a failed scrape, or scrapes
//! that overran the aggregate deadline, skip the decision entirely. An
//! incomplete sample could undercount and mistake live traffic for
//! idleness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, error, info, warn};

use osiris_core::annotations;
use osiris_core::{set_replicas, AppKind, WorkloadRef};

use crate::scraper::Scraper;

/// Hard ceiling on one tick's scrape fan-out. Decisions are made fast
/// or not at all.
const AGGREGATE_SCRAPE_DEADLINE: Duration = Duration::from_secs(3);

/// Executes scale-to-zero against the cluster. Split from the collector
/// so the decision loop can be exercised without an API server.
#[async_trait]
pub trait WorkloadScaler: Send + Sync {
    /// The workload's currently declared dependencies.
    async fn dependencies(&self, target: &WorkloadRef) -> Vec<WorkloadRef>;

    /// Patch the workload's replicas to zero.
    async fn scale_to_zero(&self, target: &WorkloadRef) -> anyhow::Result<()>;
}

/// The real scaler: JSON patches and annotation reads via the API server.
pub struct KubeScaler {
    client: Client,
}

impl KubeScaler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadScaler for KubeScaler {
    async fn dependencies(&self, target: &WorkloadRef) -> Vec<WorkloadRef> {
        let workload_annotations = match target.kind {
            AppKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &target.namespace);
                match api.get(&target.name).await {
                    Ok(d) => d.metadata.annotations,
                    Err(e) => {
                        error!(workload = %target, error = %e, "error fetching workload for dependencies");
                        return Vec::new();
                    }
                }
            }
            AppKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &target.namespace);
                match api.get(&target.name).await {
                    Ok(s) => s.metadata.annotations,
                    Err(e) => {
                        error!(workload = %target, error = %e, "error fetching workload for dependencies");
                        return Vec::new();
                    }
                }
            }
        };
        workload_annotations
            .as_ref()
            .and_then(|a| a.get(annotations::DEPENDENCIES))
            .map(|raw| annotations::parse_dependencies(raw))
            .unwrap_or_default()
    }

    async fn scale_to_zero(&self, target: &WorkloadRef) -> anyhow::Result<()> {
        set_replicas(&self.client, target, 0).await?;
        Ok(())
    }
}

/// Idle-detection loop for one opted-in workload.
pub struct MetricsCollector {
    workload: WorkloadRef,
    interval: Duration,
    scraper: Arc<dyn Scraper>,
    scaler: Arc<dyn WorkloadScaler>,
    app_pods: Arc<Mutex<HashMap<String, Pod>>>,
    /// Latest counter per proxy ID. Persists across ticks so a pod that
    /// briefly disappears from the snapshot keeps contributing its last
    /// known count, and a restarted sidecar shows up as a new key
    /// instead of a decrease.
    request_counts_by_proxy: HashMap<String, u64>,
    last_total: u64,
}

impl MetricsCollector {
    pub fn new(
        workload: WorkloadRef,
        interval: Duration,
        scraper: Arc<dyn Scraper>,
        scaler: Arc<dyn WorkloadScaler>,
    ) -> Self {
        Self {
            workload,
            interval,
            scraper,
            scaler,
            app_pods: Arc::new(Mutex::new(HashMap::new())),
            request_counts_by_proxy: HashMap::new(),
            last_total: 0,
        }
    }

    /// Handle to the pod snapshot, for the pod watcher feeding this
    /// collector.
    pub fn pods_handle(&self) -> Arc<Mutex<HashMap<String, Pod>>> {
        self.app_pods.clone()
    }

    /// Run the decision loop until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(workload = %self.workload, interval_secs = self.interval.as_secs(), "metrics collection started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of tokio's interval fires immediately; skip it
        // so the first decision sees a full interval of traffic.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!(workload = %self.workload, "metrics collection stopped");
                    return;
                }
            }
        }
    }

    /// One decision tick, exposed for deterministic tests.
    pub async fn tick(&mut self) {
        let pods: Vec<Pod> = {
            let app_pods = self.app_pods.lock().expect("app pods lock");
            app_pods.values().cloned().collect()
        };

        let started = Instant::now();
        let mut must_not_decide = false;

        let results = join_all(pods.iter().map(|pod| self.scraper.scrape(pod))).await;
        for result in results {
            match result {
                Some(stats) => {
                    self.request_counts_by_proxy
                        .insert(stats.proxy_id, stats.request_count);
                }
                None => must_not_decide = true,
            }
        }
        if started.elapsed() > AGGREGATE_SCRAPE_DEADLINE {
            must_not_decide = true;
        }

        let total: u64 = self.request_counts_by_proxy.values().sum();
        debug!(
            workload = %self.workload,
            total,
            last_total = self.last_total,
            must_not_decide,
            "tick complete"
        );

        if !must_not_decide && total == self.last_total {
            self.scale_to_zero().await;
        }
        self.last_total = total;
    }

    /// Scale the workload, then its declared dependencies. The workload
    /// goes first so traffic to it ceases before its backends disappear;
    /// a failure anywhere is logged and does not stop the rest.
    async fn scale_to_zero(&self) {
        info!(workload = %self.workload, "no traffic since last tick, scaling to zero");
        if let Err(e) = self.scaler.scale_to_zero(&self.workload).await {
            error!(workload = %self.workload, error = %e, "error scaling workload to zero");
        }

        for dependency in self.scaler.dependencies(&self.workload).await {
            if let Err(e) = self.scaler.scale_to_zero(&dependency).await {
                error!(
                    workload = %self.workload,
                    dependency = %dependency,
                    error = %e,
                    "error scaling dependency to zero"
                );
            }
        }
    }
}

/// Maintain a collector's pod snapshot from a label-scoped pod watch.
pub async fn run_pod_watcher(
    client: Client,
    namespace: String,
    selector: String,
    app_pods: Arc<Mutex<HashMap<String, Pod>>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let api: Api<Pod> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().labels(&selector);
    let mut stream = watcher(api, config).boxed();

    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Applied(pod))) => {
                        if let Some(name) = pod.metadata.name.clone() {
                            app_pods.lock().expect("app pods lock").insert(name, pod);
                        }
                    }
                    Some(Ok(watcher::Event::Deleted(pod))) => {
                        if let Some(name) = pod.metadata.name.as_deref() {
                            app_pods.lock().expect("app pods lock").remove(name);
                        }
                    }
                    Some(Ok(watcher::Event::Restarted(pods))) => {
                        let mut fresh = HashMap::new();
                        for pod in pods {
                            if let Some(name) = pod.metadata.name.clone() {
                                fresh.insert(name, pod);
                            }
                        }
                        *app_pods.lock().expect("app pods lock") = fresh;
                    }
                    Some(Err(e)) => {
                        warn!(%namespace, %selector, error = %e, "pod watch error, will re-list");
                    }
                    None => return,
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use osiris_core::ProxyStats;

    fn workload() -> WorkloadRef {
        WorkloadRef::new("default", AppKind::Deployment, "app")
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Scraper that replays a script: one map of pod-name → result per
    /// tick.
    struct ScriptedScraper {
        script: StdMutex<VecDeque<HashMap<String, Option<ProxyStats>>>>,
        current: StdMutex<HashMap<String, Option<ProxyStats>>>,
    }

    impl ScriptedScraper {
        fn new(ticks: Vec<HashMap<String, Option<ProxyStats>>>) -> Self {
            Self {
                script: StdMutex::new(ticks.into()),
                current: StdMutex::new(HashMap::new()),
            }
        }

        fn advance(&self) {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            *self.current.lock().unwrap() = next;
        }
    }

    #[async_trait]
    impl Scraper for ScriptedScraper {
        async fn scrape(&self, pod: &Pod) -> Option<ProxyStats> {
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            self.current.lock().unwrap().get(name).cloned().flatten()
        }
    }

    /// Scaler that records every call in order.
    struct RecordingScaler {
        deps: Vec<WorkloadRef>,
        calls: StdMutex<Vec<WorkloadRef>>,
    }

    impl RecordingScaler {
        fn new(deps: Vec<WorkloadRef>) -> Arc<Self> {
            Arc::new(Self {
                deps,
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<WorkloadRef> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkloadScaler for RecordingScaler {
        async fn dependencies(&self, _target: &WorkloadRef) -> Vec<WorkloadRef> {
            self.deps.clone()
        }

        async fn scale_to_zero(&self, target: &WorkloadRef) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(target.clone());
            Ok(())
        }
    }

    fn stats(id: &str, count: u64) -> Option<ProxyStats> {
        Some(ProxyStats {
            proxy_id: id.to_string(),
            request_count: count,
        })
    }

    fn collector_with(
        scraper: Arc<ScriptedScraper>,
        scaler: Arc<RecordingScaler>,
        pods: &[&str],
    ) -> MetricsCollector {
        let collector = MetricsCollector::new(
            workload(),
            Duration::from_secs(60),
            scraper,
            scaler,
        );
        {
            let handle = collector.pods_handle();
            let mut map = handle.lock().unwrap();
            for name in pods {
                map.insert(name.to_string(), pod(name));
            }
        }
        collector
    }

    #[tokio::test]
    async fn unchanged_totals_across_two_clean_ticks_scale_to_zero() {
        let scraper = Arc::new(ScriptedScraper::new(vec![
            HashMap::from([
                ("pod-a".to_string(), stats("A", 17)),
                ("pod-b".to_string(), stats("B", 5)),
            ]),
            HashMap::from([
                ("pod-a".to_string(), stats("A", 17)),
                ("pod-b".to_string(), stats("B", 5)),
            ]),
        ]));
        let scaler = RecordingScaler::new(vec![]);
        let mut collector = collector_with(scraper.clone(), scaler.clone(), &["pod-a", "pod-b"]);

        scraper.advance();
        collector.tick().await;
        assert!(scaler.calls().is_empty(), "first tick only establishes the baseline");

        scraper.advance();
        collector.tick().await;
        assert_eq!(scaler.calls(), vec![workload()]);
    }

    #[tokio::test]
    async fn growing_totals_do_not_scale() {
        let scraper = Arc::new(ScriptedScraper::new(vec![
            HashMap::from([("pod-a".to_string(), stats("A", 10))]),
            HashMap::from([("pod-a".to_string(), stats("A", 11))]),
        ]));
        let scaler = RecordingScaler::new(vec![]);
        let mut collector = collector_with(scraper.clone(), scaler.clone(), &["pod-a"]);

        scraper.advance();
        collector.tick().await;
        scraper.advance();
        collector.tick().await;
        assert!(scaler.calls().is_empty());
    }

    #[tokio::test]
    async fn a_failed_scrape_skips_the_decision() {
        let scraper = Arc::new(ScriptedScraper::new(vec![
            HashMap::from([
                ("pod-a".to_string(), stats("A", 17)),
                ("pod-b".to_string(), stats("B", 5)),
            ]),
            // pod-b fails; observable counters are unchanged but the
            // tick must not decide.
            HashMap::from([
                ("pod-a".to_string(), stats("A", 17)),
                ("pod-b".to_string(), None),
            ]),
        ]));
        let scaler = RecordingScaler::new(vec![]);
        let mut collector = collector_with(scraper.clone(), scaler.clone(), &["pod-a", "pod-b"]);

        scraper.advance();
        collector.tick().await;
        scraper.advance();
        collector.tick().await;
        assert!(scaler.calls().is_empty());
    }

    #[tokio::test]
    async fn restarted_sidecar_counts_as_new_traffic() {
        // pod-a's sidecar restarts between ticks: same pod name, new
        // proxy ID, counter reset. The total grows (A stays at its last
        // known 17, A2 adds 3), so no scale happens.
        let scraper = Arc::new(ScriptedScraper::new(vec![
            HashMap::from([("pod-a".to_string(), stats("A", 17))]),
            HashMap::from([("pod-a".to_string(), stats("A2", 3))]),
        ]));
        let scaler = RecordingScaler::new(vec![]);
        let mut collector = collector_with(scraper.clone(), scaler.clone(), &["pod-a"]);

        scraper.advance();
        collector.tick().await;
        scraper.advance();
        collector.tick().await;
        assert!(scaler.calls().is_empty());
    }

    #[tokio::test]
    async fn dependencies_are_scaled_after_the_workload() {
        let db = WorkloadRef::new("ns", AppKind::Deployment, "db");
        let cache = WorkloadRef::new("ns", AppKind::StatefulSet, "cache");
        let scraper = Arc::new(ScriptedScraper::new(vec![
            HashMap::from([("pod-a".to_string(), stats("A", 4))]),
            HashMap::from([("pod-a".to_string(), stats("A", 4))]),
        ]));
        let scaler = RecordingScaler::new(vec![db.clone(), cache.clone()]);
        let mut collector = collector_with(scraper.clone(), scaler.clone(), &["pod-a"]);

        scraper.advance();
        collector.tick().await;
        scraper.advance();
        collector.tick().await;

        assert_eq!(scaler.calls(), vec![workload(), db, cache]);
    }

    #[tokio::test]
    async fn no_pods_means_idle_totals_of_zero() {
        // A workload with no pods scrapes nothing: totals stay at zero
        // and every tick scales (replicas are already zero; the patch is
        // idempotent).
        let scraper = Arc::new(ScriptedScraper::new(vec![HashMap::new(), HashMap::new()]));
        let scaler = RecordingScaler::new(vec![]);
        let mut collector = collector_with(scraper.clone(), scaler.clone(), &[]);

        scraper.advance();
        collector.tick().await;
        scraper.advance();
        collector.tick().await;
        assert_eq!(scaler.calls(), vec![workload(), workload()]);
    }
}
