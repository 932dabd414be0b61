use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ResourceRequirements, Secret, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    runtime::controller::Action,
    CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use tracing::*;

use super::{create_owned_deployment, deployment_drifted, SETUP_KEY_SECRET_KEY};
use crate::conditions::{conditions_equal, Conditions, NBCondition};
use crate::events_helper::emit_info;
use crate::group_controller::{NBGroup, NBGroupSpec, GROUP_CLEANUP_FINALIZER};
use crate::mesh::{
    CreateSetupKeyRequest, NetworkRequest, NetworkRouter, NetworkRouterRequest,
    MANAGED_DESCRIPTION, SETUP_KEY_TYPE_REUSABLE,
};
use crate::resource_controller::NBResource;
use crate::util::{without, DEFAULT_REQUEUE};
use crate::{Error, Result};
use operator_derive::Conditions;

use super::Context;

pub static ROUTING_PEER_MANAGER_NAME: &str = "nbroutingpeer-controller";
pub static ROUTING_PEER_CLEANUP_FINALIZER: &str = "netbird.io/routing-peer-cleanup";

/// Fixed metric for operator-managed routers; high so user-managed routes win.
pub static ROUTER_METRIC: u32 = 9999;

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "netbird.io",
    version = "v1",
    kind = "NBRoutingPeer",
    derive = "Default",
    namespaced,
    shortname = "nbrp",
    doc = "NBRoutingPeer runs the data-plane client pods bridging a network into the cluster",
    printcolumn = r#"{"name":"Network ID","jsonPath":".status.networkID","type":"string"}"#,
    printcolumn = r#"{"name":"Router ID","jsonPath":".status.routerID","type":"string"}"#,
    printcolumn = r#"{"name":"Ready","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","type":"string"}"#,
    status = "NBRoutingPeerStatus"
)]
pub struct NBRoutingPeerSpec {
    /// Data-plane replicas; defaults to 3
    pub replicas: Option<i32>,
    pub resources: Option<ResourceRequirements>,
    pub labels: Option<BTreeMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Conditions)]
#[serde(rename_all = "camelCase")]
pub struct NBRoutingPeerStatus {
    #[serde(rename = "networkID")]
    pub network_id: Option<String>,
    #[serde(rename = "setupKeyID")]
    pub setup_key_id: Option<String>,
    #[serde(rename = "routerID")]
    pub router_id: Option<String>,
    pub conditions: Option<Vec<NBCondition>>,
}

impl NBRoutingPeerStatus {
    pub fn equal(&self, other: &Self) -> bool {
        self.network_id == other.network_id
            && self.setup_key_id == other.setup_key_id
            && self.router_id == other.router_id
            && conditions_equal(&self.conditions, &other.conditions)
    }
}

/// Outcome of a phase that may need to wait for a dependent object.
enum Phase<T> {
    Ready(T),
    Wait(Duration),
}

/// Settings drift for the singleton network router.
pub(crate) fn router_drifted(router: &NetworkRouter, group_id: &str) -> bool {
    !router.enabled
        || !router.masquerade
        || router.metric != ROUTER_METRIC
        || router
            .peer_groups
            .as_ref()
            .map(|groups| groups.len() != 1 || groups[0] != group_id)
            .unwrap_or(true)
}

impl NBRoutingPeer {
    pub async fn reconcile(&self, ctx: &Context) -> Result<Action> {
        let previous = self.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let outcome = self.sync(ctx, &mut status).await;

        if !status.equal(&previous) {
            let api: Api<NBRoutingPeer> =
                Api::namespaced(ctx.client.clone(), &self.namespace().unwrap());
            api.patch_status(
                &self.name_any(),
                &PatchParams::apply(ROUTING_PEER_MANAGER_NAME),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map_err(Error::KubeError)?;
        }

        outcome
    }

    async fn sync(&self, ctx: &Context, status: &mut NBRoutingPeerStatus) -> Result<Action> {
        debug!("NBRoutingPeer: checking network");
        self.handle_network(ctx, status).await?;

        debug!("NBRoutingPeer: checking group");
        let group = match self.handle_group(ctx, status).await? {
            Phase::Ready(group) => group,
            Phase::Wait(delay) => return Ok(Action::requeue(delay)),
        };

        debug!("NBRoutingPeer: checking setup key");
        if let Phase::Wait(delay) = self.handle_setup_key(ctx, &group, status).await? {
            return Ok(Action::requeue(delay));
        }

        debug!("NBRoutingPeer: checking network router");
        self.handle_router(ctx, &group, status).await?;

        debug!("NBRoutingPeer: checking deployment");
        self.handle_deployment(ctx, status).await?;

        status.set_ready(true, "Ready", None);
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }

    /// Phase A: adopt the network by name or create it.
    async fn handle_network(&self, ctx: &Context, status: &mut NBRoutingPeerStatus) -> Result<()> {
        if status.network_id.is_some() {
            return Ok(());
        }
        let network_name = ctx.settings.network_name(&self.namespace().unwrap());

        let networks = ctx.mesh.networks_list().await.map_err(|e| {
            status.set_ready(false, "APIError", Some(&format!("error listing networks: {e}")));
            Error::MeshError(e)
        })?;

        if let Some(network) = networks.iter().find(|n| n.name == network_name) {
            info!("network \"{}\" already exists, adopting {}", network_name, network.id);
            status.network_id = Some(network.id.clone());
            return Ok(());
        }

        info!("creating network \"{}\"", network_name);
        let network = ctx
            .mesh
            .networks_create(NetworkRequest {
                name: network_name,
                description: Some(MANAGED_DESCRIPTION.to_string()),
            })
            .await
            .map_err(|e| {
                status.set_ready(
                    false,
                    "APIError",
                    Some(&format!("error creating network: {e}")),
                );
                Error::MeshError(e)
            })?;
        status.network_id = Some(network.id);
        Ok(())
    }

    /// Phase B: ensure the peer group CR exists and is bound remotely.
    async fn handle_group(
        &self,
        ctx: &Context,
        status: &mut NBRoutingPeerStatus,
    ) -> Result<Phase<NBGroup>> {
        let ns = self.namespace().unwrap();
        let api: Api<NBGroup> = Api::namespaced(ctx.client.clone(), &ns);

        let existing = api.get_opt(&self.name_any()).await.map_err(|e| {
            status.set_ready(
                false,
                "internalError",
                Some(&format!("error getting NBGroup: {e}")),
            );
            Error::KubeError(e)
        })?;

        let Some(group) = existing else {
            let group = NBGroup {
                metadata: ObjectMeta {
                    name: Some(self.name_any()),
                    namespace: Some(ns),
                    owner_references: Some(vec![self.owner_reference()]),
                    finalizers: Some(vec![
                        GROUP_CLEANUP_FINALIZER.to_string(),
                        ROUTING_PEER_CLEANUP_FINALIZER.to_string(),
                    ]),
                    ..ObjectMeta::default()
                },
                spec: NBGroupSpec {
                    name: ctx.settings.network_name(&self.namespace().unwrap()),
                },
                status: None,
            };
            api.create(&PostParams::default(), &group)
                .await
                .map_err(|e| {
                    status.set_ready(
                        false,
                        "internalError",
                        Some(&format!("error creating NBGroup: {e}")),
                    );
                    Error::KubeError(e)
                })?;
            // Give the group controller a moment to bind the new group
            return Ok(Phase::Wait(Duration::from_secs(5)));
        };

        if group.status.as_ref().and_then(|s| s.group_id.as_ref()).is_none() {
            return Ok(Phase::Wait(Duration::from_secs(10)));
        }

        Ok(Phase::Ready(group))
    }

    /// Phase C: provision the setup key and the Secret feeding the
    /// data-plane pods; regenerate when either half goes missing.
    async fn handle_setup_key(
        &self,
        ctx: &Context,
        group: &NBGroup,
        status: &mut NBRoutingPeerStatus,
    ) -> Result<Phase<()>> {
        let ns = self.namespace().unwrap();
        let api_secret: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
        let group_id = group
            .status
            .as_ref()
            .and_then(|s| s.group_id.clone())
            .ok_or_else(|| Error::OtherError("NBGroup has no group ID".to_string()))?;

        let Some(setup_key_id) = status.setup_key_id.clone() else {
            let setup_key = ctx
                .mesh
                .setup_keys_create(CreateSetupKeyRequest {
                    name: ctx.settings.network_name(&ns),
                    type_: SETUP_KEY_TYPE_REUSABLE.to_string(),
                    auto_groups: vec![group_id],
                    ephemeral: Some(true),
                })
                .await
                .map_err(|e| {
                    status.set_ready(
                        false,
                        "APIError",
                        Some(&format!("error creating setup key: {e}")),
                    );
                    Error::MeshError(e)
                })?;
            status.setup_key_id = Some(setup_key.id.clone());

            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(self.name_any()),
                    namespace: Some(ns),
                    owner_references: Some(vec![self.owner_reference()]),
                    ..ObjectMeta::default()
                },
                string_data: Some(BTreeMap::from([(
                    SETUP_KEY_SECRET_KEY.to_string(),
                    setup_key.key,
                )])),
                ..Secret::default()
            };
            match api_secret.create(&PostParams::default(), &secret).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    api_secret
                        .patch(
                            &self.name_any(),
                            &PatchParams::apply(ROUTING_PEER_MANAGER_NAME),
                            &Patch::Merge(json!({"stringData": secret.string_data})),
                        )
                        .await
                        .map_err(Error::KubeError)?;
                }
                Err(e) => {
                    status.set_ready(
                        false,
                        "internalError",
                        Some(&format!("error creating secret: {e}")),
                    );
                    return Err(Error::KubeError(e));
                }
            }
            return Ok(Phase::Ready(()));
        };

        // Verify the remote key is still alive and not revoked
        match ctx.mesh.setup_keys_get(&setup_key_id).await {
            Ok(setup_key) if setup_key.revoked => {
                info!("setup key {} revoked, regenerating", setup_key_id);
                ctx.mesh
                    .setup_keys_delete(&setup_key_id)
                    .await
                    .map_err(|e| {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("error deleting setup key: {e}")),
                        );
                        Error::MeshError(e)
                    })?;
                status.setup_key_id = None;
                return Ok(Phase::Wait(Duration::ZERO));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                status.setup_key_id = None;
                return Ok(Phase::Wait(Duration::ZERO));
            }
            Err(e) => {
                status.set_ready(
                    false,
                    "APIError",
                    Some(&format!("error getting setup key: {e}")),
                );
                return Err(Error::MeshError(e));
            }
        }

        // And that the Secret still carries the key material
        let secret = api_secret.get_opt(&self.name_any()).await.map_err(|e| {
            status.set_ready(
                false,
                "internalError",
                Some(&format!("error getting secret: {e}")),
            );
            Error::KubeError(e)
        })?;
        let secret_valid = secret
            .as_ref()
            .and_then(|s| s.data.as_ref())
            .map(|d| d.contains_key(SETUP_KEY_SECRET_KEY))
            .unwrap_or(false);
        if !secret_valid {
            // Key material is unrecoverable; revoke and start over
            ctx.mesh
                .setup_keys_delete(&setup_key_id)
                .await
                .map_err(|e| {
                    status.set_ready(
                        false,
                        "APIError",
                        Some(&format!("error deleting setup key: {e}")),
                    );
                    Error::MeshError(e)
                })?;
            status.setup_key_id = None;
            status.set_ready(false, "Gone", Some("generated secret was deleted"));
            return Ok(Phase::Wait(Duration::ZERO));
        }

        Ok(Phase::Ready(()))
    }

    /// Phase D: one router per network, masquerading, fixed metric.
    async fn handle_router(
        &self,
        ctx: &Context,
        group: &NBGroup,
        status: &mut NBRoutingPeerStatus,
    ) -> Result<()> {
        let network_id = status
            .network_id
            .clone()
            .ok_or_else(|| Error::OtherError("network ID missing in status".to_string()))?;
        let group_id = group
            .status
            .as_ref()
            .and_then(|s| s.group_id.clone())
            .ok_or_else(|| Error::OtherError("NBGroup has no group ID".to_string()))?;

        let routers = ctx
            .mesh
            .network_routers_list(&network_id)
            .await
            .map_err(|e| {
                status.set_ready(
                    false,
                    "APIError",
                    Some(&format!("error listing network routers: {e}")),
                );
                Error::MeshError(e)
            })?;

        let request = NetworkRouterRequest {
            enabled: true,
            masquerade: true,
            metric: ROUTER_METRIC,
            peer_groups: Some(vec![group_id.clone()]),
        };

        if status.router_id.is_none() || routers.is_empty() {
            if let Some(router) = routers.first() {
                // Router exists but was never recorded
                status.router_id = Some(router.id.clone());
            } else {
                let router = ctx
                    .mesh
                    .network_router_create(&network_id, request)
                    .await
                    .map_err(|e| {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("error creating network router: {e}")),
                        );
                        Error::MeshError(e)
                    })?;
                status.router_id = Some(router.id);
            }
        } else if router_drifted(&routers[0], &group_id) {
            ctx.mesh
                .network_router_update(&network_id, &routers[0].id, request)
                .await
                .map_err(|e| {
                    status.set_ready(
                        false,
                        "APIError",
                        Some(&format!("error updating network router: {e}")),
                    );
                    Error::MeshError(e)
                })?;
        }

        Ok(())
    }

    /// Phase E: create or patch the data-plane Deployment.
    async fn handle_deployment(&self, ctx: &Context, status: &mut NBRoutingPeerStatus) -> Result<()> {
        let ns = self.namespace().unwrap();
        let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);

        let desired = create_owned_deployment(
            self,
            &ctx.settings.client_image,
            &ctx.settings.management_url,
        );

        let existing = api.get_opt(&self.name_any()).await.map_err(|e| {
            status.set_ready(
                false,
                "internalError",
                Some(&format!("error getting Deployment: {e}")),
            );
            Error::KubeError(e)
        })?;

        match existing {
            None => {
                info!("creating routing peer Deployment {}/{}", ns, self.name_any());
                api.create(&PostParams::default(), &desired)
                    .await
                    .map_err(|e| {
                        status.set_ready(
                            false,
                            "internalError",
                            Some(&format!("error creating Deployment: {e}")),
                        );
                        Error::KubeError(e)
                    })?;
                emit_info(
                    &ctx.recorder,
                    self,
                    "DeploymentCreated",
                    "Created",
                    Some(format!("Created `{}` Deployment for routing peers", self.name_any())),
                )
                .await;
            }
            Some(existing) if deployment_drifted(&existing, &desired) => {
                info!("patching routing peer Deployment {}/{}", ns, self.name_any());
                api.patch(
                    &self.name_any(),
                    &PatchParams::apply(ROUTING_PEER_MANAGER_NAME),
                    &Patch::Strategic(&desired),
                )
                .await
                .map_err(|e| {
                    status.set_ready(
                        false,
                        "internalError",
                        Some(&format!("error updating Deployment: {e}")),
                    );
                    Error::KubeError(e)
                })?;
            }
            Some(_) => {}
        }

        Ok(())
    }

    pub(crate) fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: NBRoutingPeer::api_version(&()).to_string(),
            kind: NBRoutingPeer::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.uid().unwrap_or_default(),
            block_owner_deletion: Some(true),
            ..OwnerReference::default()
        }
    }

    /// Teardown: workload first, then remote credentials and router, then
    /// every resource on the network, and the network itself only when no
    /// resource remains.
    pub async fn handle_delete(&self, ctx: &Context, status: &mut NBRoutingPeerStatus) -> Result<Action> {
        let ns = self.namespace().unwrap();

        let api_deploy: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);
        if api_deploy
            .get_opt(&self.name_any())
            .await
            .map_err(Error::KubeError)?
            .is_some()
        {
            api_deploy
                .delete(&self.name_any(), &DeleteParams::default())
                .await
                .map_err(Error::KubeError)?;
        }

        if let Some(setup_key_id) = status.setup_key_id.clone() {
            info!("deleting setup key {}", setup_key_id);
            match ctx.mesh.setup_keys_delete(&setup_key_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(Error::MeshError(e)),
            }
            status.setup_key_id = None;
        }

        if let (Some(network_id), Some(router_id)) =
            (status.network_id.clone(), status.router_id.clone())
        {
            match ctx.mesh.network_router_delete(&network_id, &router_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(Error::MeshError(e)),
            }
            status.router_id = None;
        }

        if let Some(network_id) = status.network_id.clone() {
            let api_resources: Api<NBResource> = Api::all(ctx.client.clone());
            let resources = api_resources
                .list(&ListParams::default())
                .await
                .map_err(Error::KubeError)?;
            let on_network: Vec<&NBResource> = resources
                .items
                .iter()
                .filter(|r| r.spec.network_id == network_id)
                .collect();

            for resource in &on_network {
                let resource_ns = resource.namespace().unwrap();
                info!("deleting NBResource {}/{}", resource_ns, resource.name_any());
                let api: Api<NBResource> = Api::namespaced(ctx.client.clone(), &resource_ns);
                api.delete(&resource.name_any(), &DeleteParams::default())
                    .await
                    .map_err(Error::KubeError)?;
            }

            if on_network.is_empty() {
                info!("deleting network {}", network_id);
                match ctx.mesh.networks_delete(&network_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(Error::MeshError(e)),
                }
                status.network_id = None;
            }
        }

        let api_group: Api<NBGroup> = Api::namespaced(ctx.client.clone(), &ns);
        if let Some(group) = api_group
            .get_opt(&self.name_any())
            .await
            .map_err(Error::KubeError)?
        {
            let finalizers = without(
                group.finalizers(),
                &ROUTING_PEER_CLEANUP_FINALIZER.to_string(),
            );
            if finalizers.len() != group.finalizers().len() {
                info!(
                    "releasing routing-peer-cleanup on NBGroup {}/{}",
                    ns,
                    group.name_any()
                );
                api_group
                    .patch(
                        &group.name_any(),
                        &PatchParams::apply(ROUTING_PEER_MANAGER_NAME),
                        &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
                    )
                    .await
                    .map_err(Error::KubeError)?;
            }
        }

        if status.network_id.is_some() {
            // Resources still draining; come back for the network
            return Ok(Action::requeue(Duration::from_secs(5)));
        }

        if !self.finalizers().is_empty() {
            info!("removing finalizers from NBRoutingPeer {}/{}", ns, self.name_any());
            let api: Api<NBRoutingPeer> = Api::namespaced(ctx.client.clone(), &ns);
            api.patch(
                &self.name_any(),
                &PatchParams::apply(ROUTING_PEER_MANAGER_NAME),
                &Patch::Merge(json!({"metadata": {"finalizers": Vec::<String>::new()}})),
            )
            .await
            .map_err(Error::KubeError)?;
        }

        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(enabled: bool, masquerade: bool, metric: u32, groups: Vec<&str>) -> NetworkRouter {
        NetworkRouter {
            id: "r1".into(),
            enabled,
            masquerade,
            metric,
            peer_groups: Some(groups.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn router_in_sync_is_left_alone() {
        assert!(!router_drifted(&router(true, true, 9999, vec!["gid"]), "gid"));
    }

    #[test]
    fn router_drift_covers_every_owned_setting() {
        assert!(router_drifted(&router(false, true, 9999, vec!["gid"]), "gid"));
        assert!(router_drifted(&router(true, false, 9999, vec!["gid"]), "gid"));
        assert!(router_drifted(&router(true, true, 100, vec!["gid"]), "gid"));
        assert!(router_drifted(&router(true, true, 9999, vec!["other"]), "gid"));
        assert!(router_drifted(&router(true, true, 9999, vec!["gid", "extra"]), "gid"));
        let mut no_groups = router(true, true, 9999, vec![]);
        no_groups.peer_groups = None;
        assert!(router_drifted(&no_groups, "gid"));
    }

    #[test]
    fn status_comparator_tracks_all_ids() {
        let mut a = NBRoutingPeerStatus::default();
        let b = NBRoutingPeerStatus::default();
        assert!(a.equal(&b));
        a.network_id = Some("n".into());
        assert!(!a.equal(&b));
    }
}
