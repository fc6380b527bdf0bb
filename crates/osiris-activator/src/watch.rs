//! Cluster caches behind the host index.
//!
//! Four watches (services, deployments, statefulsets, nodes) feed small
//! caches; every delta rebuilds the index from a consistent snapshot and
//! swaps the published map atomically. Readers always see either the old
//! complete index or the new complete index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use osiris_core::{App, AppKind, WorkloadRef};

use crate::index::{build_index, WorkloadAnnotations};

type HostIndex = Arc<HashMap<String, Arc<App>>>;

/// Shared cluster state and the published host index.
pub struct ClusterState {
    services: Mutex<BTreeMap<(String, String), Service>>,
    workloads: Mutex<WorkloadAnnotations>,
    node_addresses: Mutex<HashMap<String, BTreeSet<String>>>,
    index: RwLock<HostIndex>,
}

impl ClusterState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(BTreeMap::new()),
            workloads: Mutex::new(HashMap::new()),
            node_addresses: Mutex::new(HashMap::new()),
            index: RwLock::new(Arc::new(HashMap::new())),
        })
    }

    /// The current index snapshot.
    pub fn index(&self) -> HostIndex {
        self.index.read().expect("index lock").clone()
    }

    /// Resolve a request host to its app.
    pub fn lookup(&self, host: &str) -> Option<Arc<App>> {
        self.index().get(host).cloned()
    }

    /// Rebuild the index from the current caches and publish it.
    pub fn rebuild(&self) {
        let new_index = {
            let services = self.services.lock().expect("services lock");
            let workloads = self.workloads.lock().expect("workloads lock");
            let node_addresses = self.node_addresses.lock().expect("node addresses lock");
            let flattened: BTreeSet<String> = node_addresses
                .values()
                .flat_map(|addrs| addrs.iter().cloned())
                .collect();
            build_index(&services, &workloads, &flattened)
        };
        let entries = new_index.len();
        *self.index.write().expect("index lock") = Arc::new(new_index);
        debug!(entries, "host index rebuilt");
    }

    fn apply_service(&self, service: Service) {
        if let (Some(ns), Some(name)) = (
            service.metadata.namespace.clone(),
            service.metadata.name.clone(),
        ) {
            self.services
                .lock()
                .expect("services lock")
                .insert((ns, name), service);
        }
    }

    fn delete_service(&self, service: &Service) {
        if let (Some(ns), Some(name)) = (
            service.metadata.namespace.as_ref(),
            service.metadata.name.as_ref(),
        ) {
            self.services
                .lock()
                .expect("services lock")
                .remove(&(ns.clone(), name.clone()));
        }
    }

    fn restart_services(&self, services: Vec<Service>) {
        let mut fresh = BTreeMap::new();
        for service in services {
            if let (Some(ns), Some(name)) = (
                service.metadata.namespace.clone(),
                service.metadata.name.clone(),
            ) {
                fresh.insert((ns, name), service);
            }
        }
        *self.services.lock().expect("services lock") = fresh;
    }

    fn apply_workload(&self, workload: WorkloadRef, annotations: BTreeMap<String, String>) {
        self.workloads
            .lock()
            .expect("workloads lock")
            .insert(workload, annotations);
    }

    fn delete_workload(&self, workload: &WorkloadRef) {
        self.workloads.lock().expect("workloads lock").remove(workload);
    }

    fn restart_workloads(&self, kind: AppKind, fresh: Vec<(WorkloadRef, BTreeMap<String, String>)>) {
        let mut workloads = self.workloads.lock().expect("workloads lock");
        workloads.retain(|w, _| w.kind != kind);
        workloads.extend(fresh);
    }

    fn apply_node(&self, node: &Node) {
        let addresses: BTreeSet<String> = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .map(|addrs| addrs.iter().map(|a| a.address.clone()).collect())
            .unwrap_or_default();
        self.node_addresses
            .lock()
            .expect("node addresses lock")
            .insert(node.name_any(), addresses);
    }

    fn delete_node(&self, node: &Node) {
        self.node_addresses
            .lock()
            .expect("node addresses lock")
            .remove(&node.name_any());
    }

    fn restart_nodes(&self, nodes: Vec<Node>) {
        let mut fresh = HashMap::new();
        for node in nodes {
            let addresses: BTreeSet<String> = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .map(|addrs| addrs.iter().map(|a| a.address.clone()).collect())
                .unwrap_or_default();
            fresh.insert(node.name_any(), addresses);
        }
        *self.node_addresses.lock().expect("node addresses lock") = fresh;
    }
}

fn workload_entry<K: kube::Resource<DynamicType = ()>>(kind: AppKind, obj: &K) -> (WorkloadRef, BTreeMap<String, String>) {
    (
        WorkloadRef::new(obj.namespace().unwrap_or_default(), kind, obj.name_any()),
        obj.annotations().clone(),
    )
}

/// Run all four cluster watches until shutdown, rebuilding the index on
/// every delta.
pub async fn run_watchers(
    client: Client,
    state: Arc<ClusterState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let services: Api<Service> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);

    let mut service_stream = watcher(services, watcher::Config::default()).boxed();
    let mut deployment_stream = watcher(deployments, watcher::Config::default()).boxed();
    let mut statefulset_stream = watcher(statefulsets, watcher::Config::default()).boxed();
    let mut node_stream = watcher(nodes, watcher::Config::default()).boxed();

    info!("activator watching cluster state");

    loop {
        let changed = tokio::select! {
            event = service_stream.next() => match event {
                Some(Ok(watcher::Event::Applied(svc))) => {
                    state.apply_service(svc);
                    true
                }
                Some(Ok(watcher::Event::Deleted(svc))) => {
                    state.delete_service(&svc);
                    true
                }
                Some(Ok(watcher::Event::Restarted(svcs))) => {
                    state.restart_services(svcs);
                    true
                }
                Some(Err(e)) => {
                    warn!(error = %e, "service watch error, will re-list");
                    false
                }
                None => return,
            },
            event = deployment_stream.next() => match event {
                Some(Ok(watcher::Event::Applied(d))) => {
                    let (workload, annotations) = workload_entry(AppKind::Deployment, &d);
                    state.apply_workload(workload, annotations);
                    true
                }
                Some(Ok(watcher::Event::Deleted(d))) => {
                    let (workload, _) = workload_entry(AppKind::Deployment, &d);
                    state.delete_workload(&workload);
                    true
                }
                Some(Ok(watcher::Event::Restarted(ds))) => {
                    state.restart_workloads(
                        AppKind::Deployment,
                        ds.iter().map(|d| workload_entry(AppKind::Deployment, d)).collect(),
                    );
                    true
                }
                Some(Err(e)) => {
                    warn!(error = %e, "deployment watch error, will re-list");
                    false
                }
                None => return,
            },
            event = statefulset_stream.next() => match event {
                Some(Ok(watcher::Event::Applied(s))) => {
                    let (workload, annotations) = workload_entry(AppKind::StatefulSet, &s);
                    state.apply_workload(workload, annotations);
                    true
                }
                Some(Ok(watcher::Event::Deleted(s))) => {
                    let (workload, _) = workload_entry(AppKind::StatefulSet, &s);
                    state.delete_workload(&workload);
                    true
                }
                Some(Ok(watcher::Event::Restarted(ss))) => {
                    state.restart_workloads(
                        AppKind::StatefulSet,
                        ss.iter().map(|s| workload_entry(AppKind::StatefulSet, s)).collect(),
                    );
                    true
                }
                Some(Err(e)) => {
                    warn!(error = %e, "statefulset watch error, will re-list");
                    false
                }
                None => return,
            },
            event = node_stream.next() => match event {
                Some(Ok(watcher::Event::Applied(n))) => {
                    state.apply_node(&n);
                    true
                }
                Some(Ok(watcher::Event::Deleted(n))) => {
                    state.delete_node(&n);
                    true
                }
                Some(Ok(watcher::Event::Restarted(ns))) => {
                    state.restart_nodes(ns);
                    true
                }
                Some(Err(e)) => {
                    warn!(error = %e, "node watch error, will re-list");
                    false
                }
                None => return,
            },
            _ = shutdown.changed() => {
                info!("activator watches shutting down");
                return;
            }
        };

        if changed {
            state.rebuild();
        }
    }
}
