use k8s_openapi::api::core::v1::Service;
use kube::{api::ResourceExt, runtime::controller::Action};
use std::sync::Arc;
use tracing::*;

use super::{expose_service, hide_service, EXPOSE_ANNOTATION};
use crate::Result;

crate::controller_scaffold! {
    controller_ty: Service,
    reporter: "service-controller",
    run_fn: run_services,
    reconcile_fn: reconcile_service,
    error_policy_fn: service_error_policy,
    error_requeue_secs: 60,
    api_builder: |client: kube::Client| kube::Api::<Service>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic()
}

async fn reconcile_service(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    let ns = svc.namespace().unwrap();
    info!("Reconciling Service \"{}\" in {}", svc.name_any(), ns);

    let should_expose = svc.annotations().contains_key(EXPOSE_ANNOTATION)
        && svc.metadata.deletion_timestamp.is_none();

    if should_expose {
        expose_service(&svc, &ctx).await
    } else {
        hide_service(&svc, &ctx).await
    }
}
