//! Replica mutation against the `apps/v1` API.
//!
//! Both control planes change replica counts the same way: a JSON patch
//! against `/spec/replicas`. Activation additionally guards the patch
//! with a `test` op so a manual scale racing the activator is never
//! clobbered.

use json_patch::Patch as JsonPatch;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::types::{AppKind, WorkloadRef};

/// Errors from replica patch operations.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// The `test /spec/replicas == 0` guard failed: someone else already
    /// scaled the workload. Callers usually treat this as success.
    #[error("replicas of {0} were not zero")]
    ReplicasNotZero(WorkloadRef),

    #[error("building patch: {0}")]
    Patch(#[from] serde_json::Error),

    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Set a workload's replica count unconditionally.
pub async fn set_replicas(
    client: &Client,
    target: &WorkloadRef,
    replicas: i32,
) -> Result<(), ScaleError> {
    let patch: JsonPatch = serde_json::from_value(json!([
        {"op": "replace", "path": "/spec/replicas", "value": replicas},
    ]))?;
    apply_patch(client, target, patch).await?;
    info!(workload = %target, replicas, "patched replica count");
    Ok(())
}

/// Scale a workload up from zero.
///
/// The patch tests that current replicas are 0 before replacing, so an
/// operator who already scaled the workload by hand wins the race. A
/// failed guard is reported as [`ScaleError::ReplicasNotZero`].
pub async fn activate_replicas(
    client: &Client,
    target: &WorkloadRef,
    replicas: i32,
) -> Result<(), ScaleError> {
    let patch: JsonPatch = serde_json::from_value(json!([
        {"op": "test", "path": "/spec/replicas", "value": 0},
        {"op": "replace", "path": "/spec/replicas", "value": replicas},
    ]))?;
    match apply_patch(client, target, patch).await {
        Ok(()) => {
            info!(workload = %target, replicas, "activated workload");
            Ok(())
        }
        // The API server reports a failed JSON-patch test as a conflict
        // (409) or an unprocessable patch (422), depending on version.
        Err(kube::Error::Api(resp)) if resp.code == 409 || resp.code == 422 => {
            Err(ScaleError::ReplicasNotZero(target.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn apply_patch(
    client: &Client,
    target: &WorkloadRef,
    patch: JsonPatch,
) -> Result<(), kube::Error> {
    let params = PatchParams::default();
    match target.kind {
        AppKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &target.namespace);
            api.patch(&target.name, &params, &Patch::Json::<()>(patch))
                .await?;
        }
        AppKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), &target.namespace);
            api.patch(&target.name, &params, &Patch::Json::<()>(patch))
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_patch_shape() {
        let patch: JsonPatch = serde_json::from_value(json!([
            {"op": "replace", "path": "/spec/replicas", "value": 0},
        ]))
        .unwrap();
        let rendered = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            rendered,
            json!([{"op": "replace", "path": "/spec/replicas", "value": 0}])
        );
    }

    #[test]
    fn activation_patch_carries_the_zero_guard() {
        let patch: JsonPatch = serde_json::from_value(json!([
            {"op": "test", "path": "/spec/replicas", "value": 0},
            {"op": "replace", "path": "/spec/replicas", "value": 1},
        ]))
        .unwrap();
        let rendered = serde_json::to_value(&patch).unwrap();
        assert_eq!(rendered[0]["op"], "test");
        assert_eq!(rendered[1]["op"], "replace");
        assert_eq!(rendered[1]["value"], 1);
    }
}
