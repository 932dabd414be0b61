use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
    },
};
use std::sync::Arc;
use tracing::*;

use super::{NBPolicy, POLICY_CLEANUP_FINALIZER};
use crate::{Error, Result};

crate::controller_scaffold! {
    controller_ty: super::NBPolicy,
    reporter: "nbpolicy-controller",
    run_fn: run_policies,
    reconcile_fn: reconcile_policy,
    error_policy_fn: policy_error_policy,
    error_requeue_secs: 5 * 60,
    api_builder: |client: kube::Client| kube::Api::<NBPolicy>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    preflight: |api: kube::Api<NBPolicy>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("NBPolicy CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
            std::process::exit(1);
        }
    }
}

async fn reconcile_policy(policy: Arc<NBPolicy>, ctx: Arc<Context>) -> Result<Action> {
    // Cluster-scoped resource
    let api: Api<NBPolicy> = Api::all(ctx.client.clone());

    info!("Reconciling NBPolicy \"{}\"", policy.name_any());
    finalizer(
        &api,
        POLICY_CLEANUP_FINALIZER,
        policy,
        async |event| match event {
            Finalizer::Apply(policy) => policy.reconcile(&ctx).await,
            Finalizer::Cleanup(policy) => policy.cleanup(&ctx).await,
        },
    )
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}
