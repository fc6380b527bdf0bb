//! The activation protocol.
//!
//! Exactly one activation task runs per workload (guaranteed by the
//! record tracker). The task activates declared dependencies first,
//! patches the workload's replicas up from zero, waits for the service
//! to gain a ready endpoint, and broadcasts the outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use kube::Client;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use osiris_core::{activate_replicas, App, ScaleError, WorkloadRef};

use crate::records::{ActivationState, ActivationTracker};

/// Dependency recursion bound. Dependency annotations can form a cycle;
/// past this depth the activation fails instead of live-locking.
const MAX_DEPENDENCY_DEPTH: usize = 8;

/// Errors surfaced to requests waiting on an activation.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("activation did not complete in time")]
    Timeout,

    #[error("activation failed: {0}")]
    Failed(String),

    #[error("dependency chain exceeds depth {MAX_DEPENDENCY_DEPTH} (cycle?)")]
    DependencyDepthExceeded,

    #[error("activation was cancelled")]
    Cancelled,
}

/// Activation tuning knobs.
#[derive(Debug, Clone)]
pub struct ActivateConfig {
    /// How long a request waits for the workload to become ready.
    pub activation_timeout: Duration,
    /// How often endpoint readiness is polled.
    pub poll_interval: Duration,
}

impl Default for ActivateConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Something that can make an app ready to receive traffic. The server
/// depends on this seam rather than on the concrete [`Activator`].
#[async_trait]
pub trait Activate: Send + Sync {
    async fn ensure_active(&self, app: Arc<App>) -> Result<(), ActivationError>;
}

/// Drives activations against the cluster. Cheap to clone; clones share
/// the record tracker.
#[derive(Clone)]
pub struct Activator {
    client: Client,
    tracker: Arc<ActivationTracker>,
    config: ActivateConfig,
}

impl Activator {
    pub fn new(client: Client, tracker: Arc<ActivationTracker>, config: ActivateConfig) -> Self {
        Self {
            client,
            tracker,
            config,
        }
    }

    fn ensure_active_at(
        &self,
        app: Arc<App>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActivationError>> + Send>> {
        let this = self.clone();
        Box::pin(async move {
            if depth > MAX_DEPENDENCY_DEPTH {
                return Err(ActivationError::DependencyDepthExceeded);
            }

            let (record, created) = this.tracker.join(&app);
            if created {
                let task = this.clone();
                let task_app = app.clone();
                tokio::spawn(async move {
                    task.run_activation(task_app, depth).await;
                });
            }

            let mut state = record.subscribe();
            let outcome = tokio::time::timeout(
                this.config.activation_timeout,
                state.wait_for(|s| s.is_terminal()),
            )
            .await;
            match outcome {
                Ok(Ok(state)) => match &*state {
                    ActivationState::Ready => Ok(()),
                    ActivationState::Failed(cause) => {
                        Err(ActivationError::Failed(cause.clone()))
                    }
                    // wait_for only yields terminal states.
                    _ => Err(ActivationError::Cancelled),
                },
                // The record's sender side is gone; the task was torn down.
                Ok(Err(_)) => Err(ActivationError::Cancelled),
                Err(_) => Err(ActivationError::Timeout),
            }
        })
    }

    /// The activation task body. Runs once per record.
    async fn run_activation(self, app: Arc<App>, depth: usize) {
        let key = app.workload();
        info!(workload = %key, "activation starting");
        {
            let (record, _) = self.tracker.join(&app);
            record.set_state(ActivationState::Activating);
        }

        // Dependencies come up first, concurrently. Any failure fails
        // the whole activation.
        if !app.dependencies.is_empty() {
            let dep_results = join_all(app.dependencies.iter().map(|dep| {
                self.ensure_active_at(Arc::new(dependency_app(dep)), depth + 1)
            }))
            .await;
            for (dep, result) in app.dependencies.iter().zip(dep_results) {
                if let Err(e) = result {
                    warn!(workload = %key, dependency = %dep, error = %e, "dependency activation failed");
                    self.tracker
                        .finish_failed(&key, format!("dependency {dep} failed: {e}"));
                    return;
                }
            }
        }

        match activate_replicas(&self.client, &key, app.min_replicas).await {
            Ok(()) => {}
            // Someone (or a previous activation) already scaled it up;
            // readiness polling below covers the rest.
            Err(ScaleError::ReplicasNotZero(_)) => {
                debug!(workload = %key, "replicas already non-zero, skipping patch");
            }
            Err(e) => {
                warn!(workload = %key, error = %e, "replica patch failed");
                self.tracker
                    .finish_failed(&key, format!("replica patch failed: {e}"));
                return;
            }
        }

        match self.wait_for_ready_endpoint(&app).await {
            Ok(()) => {
                info!(workload = %key, "activation complete");
                self.tracker.finish_ready(&key);
            }
            Err(e) => {
                warn!(workload = %key, error = %e, "activation failed waiting for endpoints");
                self.tracker.finish_failed(&key, e.to_string());
            }
        }
    }

    /// Poll the service's endpoints until one address is ready or the
    /// activation deadline passes.
    async fn wait_for_ready_endpoint(&self, app: &App) -> Result<(), ActivationError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &app.namespace);
        let deadline = Instant::now() + self.config.activation_timeout;

        loop {
            match api.get_opt(&app.service_name).await {
                Ok(Some(endpoints)) if has_ready_address(&endpoints) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    debug!(service = %app.service_name, error = %e, "endpoints poll failed");
                }
            }
            if Instant::now() >= deadline {
                return Err(ActivationError::Failed(format!(
                    "service {} gained no ready endpoints within {:?}",
                    app.service_name, self.config.activation_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl Activate for Activator {
    async fn ensure_active(&self, app: Arc<App>) -> Result<(), ActivationError> {
        self.ensure_active_at(app, 0).await
    }
}

/// Whether any endpoint subset has a ready address.
fn has_ready_address(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .as_ref()
        .is_some_and(|subsets| {
            subsets
                .iter()
                .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
        })
}

/// A minimal app descriptor for a declared dependency. Dependencies are
/// only scaled and awaited, never forwarded to; by convention their
/// service shares the workload's name.
fn dependency_app(dep: &WorkloadRef) -> App {
    App {
        namespace: dep.namespace.clone(),
        service_name: dep.name.clone(),
        name: dep.name.clone(),
        kind: dep.kind,
        dependencies: vec![],
        target_url: format!("http://{}.{}", dep.name, dep.namespace)
            .parse()
            .unwrap_or_else(|_| http::Uri::from_static("http://localhost")),
        min_replicas: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    use osiris_core::AppKind;

    #[test]
    fn endpoints_with_a_ready_address_are_ready() {
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.1.0.5".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(has_ready_address(&endpoints));
    }

    #[test]
    fn endpoints_with_only_not_ready_addresses_are_not_ready() {
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: None,
                not_ready_addresses: Some(vec![EndpointAddress {
                    ip: "10.1.0.5".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(!has_ready_address(&endpoints));
    }

    #[test]
    fn empty_endpoints_are_not_ready() {
        assert!(!has_ready_address(&Endpoints::default()));
        let endpoints = Endpoints {
            subsets: Some(vec![]),
            ..Default::default()
        };
        assert!(!has_ready_address(&endpoints));
    }

    #[test]
    fn dependency_app_targets_the_like_named_service() {
        let dep = WorkloadRef::new("data", AppKind::StatefulSet, "db");
        let app = dependency_app(&dep);
        assert_eq!(app.service_name, "db");
        assert_eq!(app.namespace, "data");
        assert_eq!(app.kind, AppKind::StatefulSet);
        assert_eq!(app.min_replicas, 1);
        assert!(app.dependencies.is_empty());
        assert_eq!(app.workload(), dep);
    }
}
