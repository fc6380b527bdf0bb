//! Opt-in workload discovery.
//!
//! Watches Deployments and StatefulSets carrying the
//! `osiris.dm.gg/enabled=true` label and keeps exactly one metrics
//! collector alive per opted-in workload. Removing the label or deleting
//! the workload cancels its collector.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::watch;
use tracing::{info, warn};

use osiris_core::annotations;
use osiris_core::{AppKind, WorkloadRef};

use crate::collector::{run_pod_watcher, KubeScaler, MetricsCollector};
use crate::scraper::HttpScraper;

/// Zeroscaler tuning knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port the sidecar stats endpoints listen on.
    pub stats_port: u16,
    /// Default seconds between decision ticks; workloads may override
    /// via the `metricsCheckInterval` annotation.
    pub metrics_check_interval: Duration,
    /// Per-scrape request timeout.
    pub scrape_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stats_port: 8002,
            metrics_check_interval: Duration::from_secs(150),
            scrape_timeout: Duration::from_secs(3),
        }
    }
}

/// What the controller needs to know about one opted-in workload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OptedInWorkload {
    workload: WorkloadRef,
    /// Label selector for the workload's pods, `k=v` comma-joined.
    pod_selector: String,
    interval: Duration,
}

struct CollectorHandle {
    spec: OptedInWorkload,
    shutdown: watch::Sender<bool>,
}

/// Spawns and cancels metrics collectors as workloads opt in and out.
pub struct Controller {
    client: Client,
    config: ControllerConfig,
    collectors: HashMap<WorkloadRef, CollectorHandle>,
}

impl Controller {
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            collectors: HashMap::new(),
        }
    }

    /// Watch opted-in workloads until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let selector = format!("{}=true", annotations::ENABLED);
        let deployments: Api<Deployment> = Api::all(self.client.clone());
        let statefulsets: Api<StatefulSet> = Api::all(self.client.clone());

        let mut deployment_stream = watcher(
            deployments,
            watcher::Config::default().labels(&selector),
        )
        .boxed();
        let mut statefulset_stream = watcher(
            statefulsets,
            watcher::Config::default().labels(&selector),
        )
        .boxed();

        info!(%selector, "zeroscaler watching for opted-in workloads");

        loop {
            tokio::select! {
                event = deployment_stream.next() => {
                    match event {
                        Some(Ok(event)) => self.handle_deployment_event(event),
                        Some(Err(e)) => warn!(error = %e, "deployment watch error, will re-list"),
                        None => return,
                    }
                }
                event = statefulset_stream.next() => {
                    match event {
                        Some(Ok(event)) => self.handle_statefulset_event(event),
                        Some(Err(e)) => warn!(error = %e, "statefulset watch error, will re-list"),
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    info!("zeroscaler shutting down");
                    for (workload, handle) in self.collectors.drain() {
                        info!(%workload, "stopping collector");
                        let _ = handle.shutdown.send(true);
                    }
                    return;
                }
            }
        }
    }

    fn handle_deployment_event(&mut self, event: watcher::Event<Deployment>) {
        match event {
            watcher::Event::Applied(d) => {
                if let Some(spec) = self.opted_in_deployment(&d) {
                    self.ensure_collector(spec);
                }
            }
            watcher::Event::Deleted(d) => {
                let workload = WorkloadRef::new(
                    d.namespace().unwrap_or_default(),
                    AppKind::Deployment,
                    d.name_any(),
                );
                self.stop_collector(&workload);
            }
            watcher::Event::Restarted(ds) => {
                let fresh: Vec<OptedInWorkload> = ds
                    .iter()
                    .filter_map(|d| self.opted_in_deployment(d))
                    .collect();
                self.reconcile(AppKind::Deployment, fresh);
            }
        }
    }

    fn handle_statefulset_event(&mut self, event: watcher::Event<StatefulSet>) {
        match event {
            watcher::Event::Applied(s) => {
                if let Some(spec) = self.opted_in_statefulset(&s) {
                    self.ensure_collector(spec);
                }
            }
            watcher::Event::Deleted(s) => {
                let workload = WorkloadRef::new(
                    s.namespace().unwrap_or_default(),
                    AppKind::StatefulSet,
                    s.name_any(),
                );
                self.stop_collector(&workload);
            }
            watcher::Event::Restarted(ss) => {
                let fresh: Vec<OptedInWorkload> = ss
                    .iter()
                    .filter_map(|s| self.opted_in_statefulset(s))
                    .collect();
                self.reconcile(AppKind::StatefulSet, fresh);
            }
        }
    }

    /// Bring collectors of one kind in line with a fresh relist: stale
    /// ones stop, new ones start.
    fn reconcile(&mut self, kind: AppKind, fresh: Vec<OptedInWorkload>) {
        let fresh_keys: HashSet<WorkloadRef> =
            fresh.iter().map(|s| s.workload.clone()).collect();
        let stale: Vec<WorkloadRef> = self
            .collectors
            .keys()
            .filter(|w| w.kind == kind && !fresh_keys.contains(w))
            .cloned()
            .collect();
        for workload in stale {
            self.stop_collector(&workload);
        }
        for spec in fresh {
            self.ensure_collector(spec);
        }
    }

    fn opted_in_deployment(&self, deployment: &Deployment) -> Option<OptedInWorkload> {
        let workload = WorkloadRef::new(
            deployment.namespace().unwrap_or_default(),
            AppKind::Deployment,
            deployment.name_any(),
        );
        let match_labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.as_ref());
        self.opted_in(workload, match_labels, deployment.annotations())
    }

    fn opted_in_statefulset(&self, statefulset: &StatefulSet) -> Option<OptedInWorkload> {
        let workload = WorkloadRef::new(
            statefulset.namespace().unwrap_or_default(),
            AppKind::StatefulSet,
            statefulset.name_any(),
        );
        let match_labels = statefulset
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.as_ref());
        self.opted_in(workload, match_labels, statefulset.annotations())
    }

    fn opted_in(
        &self,
        workload: WorkloadRef,
        match_labels: Option<&BTreeMap<String, String>>,
        workload_annotations: &BTreeMap<String, String>,
    ) -> Option<OptedInWorkload> {
        let pod_selector = match match_labels {
            Some(labels) if !labels.is_empty() => selector_string(labels),
            _ => {
                warn!(%workload, "workload has no matchLabels pod selector, skipping");
                return None;
            }
        };
        let interval = workload_annotations
            .get(annotations::METRICS_CHECK_INTERVAL)
            .and_then(|raw| annotations::parse_metrics_check_interval(raw))
            .unwrap_or(self.config.metrics_check_interval);
        Some(OptedInWorkload {
            workload,
            pod_selector,
            interval,
        })
    }

    fn ensure_collector(&mut self, spec: OptedInWorkload) {
        if let Some(existing) = self.collectors.get(&spec.workload) {
            if existing.spec == spec {
                return;
            }
            // Selector or interval changed: restart with the new spec.
            let key = spec.workload.clone();
            self.stop_collector(&key);
        }

        info!(workload = %spec.workload, interval_secs = spec.interval.as_secs(), "starting metrics collection");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scraper = Arc::new(HttpScraper::new(
            self.config.stats_port,
            self.config.scrape_timeout,
        ));
        let scaler = Arc::new(KubeScaler::new(self.client.clone()));
        let collector = MetricsCollector::new(
            spec.workload.clone(),
            spec.interval,
            scraper,
            scaler,
        );

        tokio::spawn(run_pod_watcher(
            self.client.clone(),
            spec.workload.namespace.clone(),
            spec.pod_selector.clone(),
            collector.pods_handle(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(collector.run(shutdown_rx));

        self.collectors.insert(
            spec.workload.clone(),
            CollectorHandle {
                spec,
                shutdown: shutdown_tx,
            },
        );
    }

    fn stop_collector(&mut self, workload: &WorkloadRef) {
        if let Some(handle) = self.collectors.remove(workload) {
            info!(%workload, "stopping metrics collection");
            let _ = handle.shutdown.send(true);
        }
    }
}

/// Join match labels into the `k=v,k=v` form the pod watch expects.
/// BTreeMap iteration keeps the result deterministic.
fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
