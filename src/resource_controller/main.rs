use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use std::sync::Arc;
use tracing::*;

use super::{NBResource, RESOURCE_MANAGER_NAME};
use crate::Result;

crate::controller_scaffold! {
    controller_ty: super::NBResource,
    reporter: "nbresource-controller",
    run_fn: run_resources,
    reconcile_fn: reconcile_resource,
    error_policy_fn: resource_error_policy,
    error_requeue_secs: 5 * 60,
    api_builder: |client: kube::Client| kube::Api::<NBResource>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    controller_builder: |controller: kube::runtime::controller::Controller<NBResource>, client: kube::Client| {
        // Owned NBGroups becoming Ready un-blocks group materialization
        controller.owns(
            kube::Api::<crate::group_controller::NBGroup>::all(client),
            kube::runtime::watcher::Config::default(),
        )
    },
    preflight: |api: kube::Api<NBResource>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("NBResource CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
            std::process::exit(1);
        }
    }
}

async fn reconcile_resource(resource: Arc<NBResource>, ctx: Arc<Context>) -> Result<Action> {
    let ns = resource.namespace().unwrap();
    info!("Reconciling NBResource \"{}\" in {}", resource.name_any(), ns);

    if resource.metadata.deletion_timestamp.is_some() {
        if resource.finalizers().is_empty() {
            return Ok(Action::await_change());
        }
        let previous = resource.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let outcome = resource.handle_delete(&ctx, &mut status).await;
        if !status.equal(&previous) {
            let api: Api<NBResource> = Api::namespaced(ctx.client.clone(), &ns);
            // Best-effort: the object may vanish once finalizers drop
            let _ = api
                .patch_status(
                    &resource.name_any(),
                    &PatchParams::apply(RESOURCE_MANAGER_NAME),
                    &Patch::Merge(json!({ "status": status })),
                )
                .await;
        }
        return outcome;
    }

    resource.reconcile(&ctx).await
}
