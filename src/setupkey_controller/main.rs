use kube::{api::ResourceExt, runtime::controller::Action};
use std::sync::Arc;
use tracing::*;

use super::NBSetupKey;
use crate::Result;

crate::controller_scaffold! {
    controller_ty: super::NBSetupKey,
    reporter: "nbsetupkey-controller",
    run_fn: run_setup_keys,
    reconcile_fn: reconcile_setup_key,
    error_policy_fn: setup_key_error_policy,
    error_requeue_secs: 60,
    api_builder: |client: kube::Client| kube::Api::<NBSetupKey>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    controller_builder: |controller: kube::runtime::controller::Controller<NBSetupKey>, client: kube::Client| {
        // Changes to a referenced Secret re-validate the right NBSetupKey
        controller.watches(
            kube::Api::<k8s_openapi::api::core::v1::Secret>::all(client),
            kube::runtime::watcher::Config::default(),
            |secret: k8s_openapi::api::core::v1::Secret| {
                let namespace = secret.metadata.namespace.unwrap_or_default();
                let name = secret.metadata.name.unwrap_or_default();
                super::setup_key_for_secret(&namespace, &name).map(|(ns, sk)| {
                    kube::runtime::reflector::ObjectRef::<NBSetupKey>::new(&sk).within(&ns)
                })
            },
        )
    },
    preflight: |api: kube::Api<NBSetupKey>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("NBSetupKey CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
            std::process::exit(1);
        }
    }
}

async fn reconcile_setup_key(setup_key: Arc<NBSetupKey>, ctx: Arc<Context>) -> Result<Action> {
    let ns = setup_key.namespace().unwrap();
    info!("Reconciling NBSetupKey \"{}\" in {}", setup_key.name_any(), ns);
    setup_key.reconcile(&ctx).await
}
