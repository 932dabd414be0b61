use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use std::sync::Arc;
use tracing::*;

use super::{NBRoutingPeer, ROUTING_PEER_MANAGER_NAME};
use crate::Result;

crate::controller_scaffold! {
    controller_ty: super::NBRoutingPeer,
    reporter: "nbroutingpeer-controller",
    run_fn: run_routing_peers,
    reconcile_fn: reconcile_routing_peer,
    error_policy_fn: routing_peer_error_policy,
    error_requeue_secs: 5 * 60,
    api_builder: |client: kube::Client| kube::Api::<NBRoutingPeer>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    controller_builder: |controller: kube::runtime::controller::Controller<NBRoutingPeer>, client: kube::Client| {
        controller
            .owns(
                kube::Api::<k8s_openapi::api::apps::v1::Deployment>::all(client.clone()),
                kube::runtime::watcher::Config::default(),
            )
            .owns(
                kube::Api::<k8s_openapi::api::core::v1::Secret>::all(client.clone()),
                kube::runtime::watcher::Config::default(),
            )
            .owns(
                kube::Api::<crate::group_controller::NBGroup>::all(client),
                kube::runtime::watcher::Config::default(),
            )
    },
    preflight: |api: kube::Api<NBRoutingPeer>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("NBRoutingPeer CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
            std::process::exit(1);
        }
    }
}

async fn reconcile_routing_peer(nbrp: Arc<NBRoutingPeer>, ctx: Arc<Context>) -> Result<Action> {
    let ns = nbrp.namespace().unwrap();
    info!("Reconciling NBRoutingPeer \"{}\" in {}", nbrp.name_any(), ns);

    if nbrp.metadata.deletion_timestamp.is_some() {
        if nbrp.finalizers().is_empty() {
            return Ok(Action::await_change());
        }
        let previous = nbrp.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let outcome = nbrp.handle_delete(&ctx, &mut status).await;
        if !status.equal(&previous) {
            let api: Api<NBRoutingPeer> = Api::namespaced(ctx.client.clone(), &ns);
            // Best-effort: the object may vanish once finalizers drop
            let _ = api
                .patch_status(
                    &nbrp.name_any(),
                    &PatchParams::apply(ROUTING_PEER_MANAGER_NAME),
                    &Patch::Merge(json!({ "status": status })),
                )
                .await;
        }
        return outcome;
    }

    nbrp.reconcile(&ctx).await
}
