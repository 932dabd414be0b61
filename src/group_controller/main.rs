use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use std::sync::Arc;
use tracing::*;

use super::{NBGroup, GROUP_MANAGER_NAME};
use crate::{Error, Result};

crate::controller_scaffold! {
    controller_ty: super::NBGroup,
    reporter: "nbgroup-controller",
    run_fn: run_groups,
    reconcile_fn: reconcile_group,
    error_policy_fn: group_error_policy,
    error_requeue_secs: 5 * 60,
    api_builder: |client: kube::Client| kube::Api::<NBGroup>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    preflight: |api: kube::Api<NBGroup>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("NBGroup CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
            std::process::exit(1);
        }
    }
}

async fn reconcile_group(group: Arc<NBGroup>, ctx: Arc<Context>) -> Result<Action> {
    let ns = group.namespace().unwrap();
    info!("Reconciling NBGroup \"{}\" in {}", group.name_any(), ns);

    let deleting = group.metadata.deletion_timestamp.is_some();
    if deleting && group.finalizers().is_empty() {
        return Ok(Action::await_change());
    }

    let previous = group.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    let outcome = if deleting {
        group.handle_delete(&ctx, &mut status).await
    } else {
        group.sync_remote(&ctx, &mut status).await
    };

    if !status.equal(&previous) {
        let api: Api<NBGroup> = Api::namespaced(ctx.client.clone(), &ns);
        let patch = Patch::Merge(json!({ "status": status }));
        let result = api
            .patch_status(&group.name_any(), &PatchParams::apply(GROUP_MANAGER_NAME), &patch)
            .await;
        match result {
            Ok(_) => {}
            // The object disappears underneath us once finalizers drop
            Err(e) if deleting => debug!("skipping status write on deleting NBGroup: {e}"),
            Err(e) => return Err(Error::KubeError(e)),
        }
    }

    outcome
}
