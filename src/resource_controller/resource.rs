use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    runtime::controller::Action,
    CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use tracing::*;

use super::Context;
use crate::conditions::{conditions_equal, Conditions, NBCondition};
use crate::group_controller::{NBGroup, NBGroupSpec, GROUP_CLEANUP_FINALIZER};
use crate::mesh::{MeshApi, NetworkResource, NetworkResourceRequest, MANAGED_DESCRIPTION};
use crate::util::{equivalent, rfc1123_label, split_csv, without, DEFAULT_REQUEUE};
use crate::{Error, Result};
use operator_derive::Conditions;

pub static RESOURCE_MANAGER_NAME: &str = "nbresource-controller";
pub static RESOURCE_CLEANUP_FINALIZER: &str = "netbird.io/resource-cleanup";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "netbird.io",
    version = "v1",
    kind = "NBResource",
    namespaced,
    shortname = "nbrsc",
    doc = "NBResource mirrors a network resource on the NetBird management API",
    printcolumn = r#"{"name":"Address","jsonPath":".spec.address","type":"string"}"#,
    printcolumn = r#"{"name":"Resource ID","jsonPath":".status.networkResourceID","type":"string"}"#,
    printcolumn = r#"{"name":"Ready","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","type":"string"}"#,
    status = "NBResourceStatus"
)]
pub struct NBResourceSpec {
    /// Resource name on the management API
    pub name: String,
    /// Network the resource lives in. Immutable once set.
    #[serde(rename = "networkID")]
    pub network_id: String,
    /// In-cluster address reachable through the routing peers
    pub address: String,
    /// Free-form group names; each materializes as an owned NBGroup
    pub groups: Vec<String>,
    /// Comma-separated logical policy names this resource feeds into
    #[serde(default)]
    pub policy_name: String,
    #[serde(default)]
    pub tcp_ports: Vec<i32>,
    #[serde(default)]
    pub udp_ports: Vec<i32>,
    /// Source groups applied to policies generated for this resource
    #[serde(default)]
    pub policy_source_groups: Vec<String>,
    /// Friendly display names for generated policies, keyed by logical name
    pub policy_friendly_name: Option<BTreeMap<String, String>>,
}

impl NBResourceSpec {
    pub fn equal(&self, other: &Self) -> bool {
        self.name == other.name
            && self.network_id == other.network_id
            && self.address == other.address
            && equivalent(&self.groups, &other.groups)
            && self.policy_name == other.policy_name
            && equivalent(&self.tcp_ports, &other.tcp_ports)
            && equivalent(&self.udp_ports, &other.udp_ports)
            && equivalent(&self.policy_source_groups, &other.policy_source_groups)
            && self.policy_friendly_name == other.policy_friendly_name
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Conditions)]
#[serde(rename_all = "camelCase")]
pub struct NBResourceStatus {
    #[serde(rename = "networkResourceID")]
    pub network_resource_id: Option<String>,
    /// Last-applied policy memberships, comma-separated actual CR names
    pub policy_name: Option<String>,
    #[serde(default)]
    pub tcp_ports: Vec<i32>,
    #[serde(default)]
    pub udp_ports: Vec<i32>,
    /// Resolved group IDs backing `spec.groups`
    #[serde(default)]
    pub groups: Vec<String>,
    /// Logical policy name to the NBPolicy CR it resolved to
    pub policy_name_mapping: Option<BTreeMap<String, String>>,
    pub conditions: Option<Vec<NBCondition>>,
}

impl NBResourceStatus {
    pub fn equal(&self, other: &Self) -> bool {
        self.network_resource_id == other.network_resource_id
            && self.policy_name == other.policy_name
            && equivalent(&self.tcp_ports, &other.tcp_ports)
            && equivalent(&self.udp_ports, &other.udp_ports)
            && equivalent(&self.groups, &other.groups)
            && self.policy_name_mapping == other.policy_name_mapping
            && conditions_equal(&self.conditions, &other.conditions)
    }
}

/// Remote drift check for an existing network resource.
pub(crate) fn resource_drifted(
    remote: &NetworkResource,
    spec: &NBResourceSpec,
    group_ids: &[String],
) -> bool {
    let remote_groups: Vec<String> = remote.groups.iter().map(|g| g.id.clone()).collect();
    remote.address != spec.address
        || !remote.enabled
        || !equivalent(&remote_groups, group_ids)
        || remote.description.as_deref() != Some(MANAGED_DESCRIPTION)
        || remote.name != spec.name
}

impl NBResource {
    pub async fn reconcile(&self, ctx: &Context) -> Result<Action> {
        let previous = self.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let outcome = self.sync(ctx, &mut status).await;

        if !status.equal(&previous) {
            let api: Api<NBResource> =
                Api::namespaced(ctx.client.clone(), &self.namespace().unwrap());
            api.patch_status(
                &self.name_any(),
                &PatchParams::apply(RESOURCE_MANAGER_NAME),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map_err(Error::KubeError)?;
        }

        outcome
    }

    async fn sync(&self, ctx: &Context, status: &mut NBResourceStatus) -> Result<Action> {
        let group_ids = match self.handle_groups(ctx, status).await? {
            Some(ids) => ids,
            // Owned groups not bound yet; poll for the group controller
            None => return Ok(Action::requeue(Duration::from_secs(5))),
        };

        if self
            .sync_network_resource(ctx.mesh.as_ref(), &group_ids, status)
            .await?
            .is_none()
        {
            return Ok(Action::requeue(Duration::ZERO));
        }

        self.handle_policy_membership(ctx, &group_ids, status)
            .await?;

        status.set_ready(true, "Ready", None);
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }

    /// Ensure one NBGroup CR per `spec.groups` entry, owned by this
    /// resource. Returns None until every group reports a remote id.
    async fn handle_groups(
        &self,
        ctx: &Context,
        status: &mut NBResourceStatus,
    ) -> Result<Option<Vec<String>>> {
        let ns = self.namespace().unwrap();
        let api: Api<NBGroup> = Api::namespaced(ctx.client.clone(), &ns);

        let mut group_ids = Vec::new();
        for group_name in &self.spec.groups {
            let label = rfc1123_label(group_name);
            let existing = api.get_opt(&label).await.map_err(|e| {
                status.set_ready(
                    false,
                    "internalError",
                    Some(&format!("Error occurred handling groups: {e}")),
                );
                Error::KubeError(e)
            })?;

            match existing {
                None => {
                    info!("creating NBGroup {}/{} for \"{}\"", ns, label, group_name);
                    let group = self.owned_group(&label, group_name);
                    api.create(&PostParams::default(), &group)
                        .await
                        .map_err(|e| {
                            status.set_ready(
                                false,
                                "internalError",
                                Some(&format!("Error occurred handling groups: {e}")),
                            );
                            Error::KubeError(e)
                        })?;
                }
                Some(group) => {
                    let owned = group
                        .owner_references()
                        .iter()
                        .any(|o| Some(o.uid.clone()) == self.uid());
                    if !owned {
                        let mut owners = group.owner_references().to_vec();
                        owners.push(self.owner_reference());
                        api.patch(
                            &label,
                            &PatchParams::apply(RESOURCE_MANAGER_NAME),
                            &Patch::Merge(json!({"metadata": {"ownerReferences": owners}})),
                        )
                        .await
                        .map_err(Error::KubeError)?;
                    }
                    if let Some(id) = group.status.as_ref().and_then(|s| s.group_id.clone()) {
                        group_ids.push(id);
                    }
                }
            }
        }

        if group_ids.len() != self.spec.groups.len() {
            return Ok(None);
        }
        Ok(Some(group_ids))
    }

    /// Drive the remote network resource: adopt the recorded id, heal drift,
    /// recreate after out-of-band deletion.
    pub(crate) async fn sync_network_resource(
        &self,
        mesh: &dyn MeshApi,
        group_ids: &[String],
        status: &mut NBResourceStatus,
    ) -> Result<Option<NetworkResource>> {
        if let Some(id) = status.network_resource_id.clone() {
            match mesh.network_resource_get(&self.spec.network_id, &id).await {
                Ok(remote) => {
                    if resource_drifted(&remote, &self.spec, group_ids) {
                        let updated = mesh
                            .network_resource_update(
                                &self.spec.network_id,
                                &id,
                                self.resource_request(group_ids),
                            )
                            .await
                            .map_err(|e| {
                                status.set_ready(
                                    false,
                                    "APIError",
                                    Some(&format!("error updating resource: {e}")),
                                );
                                Error::MeshError(e)
                            })?;
                        return Ok(Some(updated));
                    }
                    return Ok(Some(remote));
                }
                Err(e) if e.is_not_found() => {
                    info!("network resource {} deleted out-of-band", id);
                    status.network_resource_id = None;
                    status.set_ready(
                        false,
                        "Gone",
                        Some("Network resource was deleted from the management API"),
                    );
                    return Ok(None);
                }
                Err(e) => {
                    status.set_ready(
                        false,
                        "APIError",
                        Some(&format!("error getting network resource: {e}")),
                    );
                    return Err(Error::MeshError(e));
                }
            }
        }

        let created = mesh
            .network_resource_create(&self.spec.network_id, self.resource_request(group_ids))
            .await
            .map_err(|e| {
                status.set_ready(
                    false,
                    "APIError",
                    Some(&format!("error creating resource: {e}")),
                );
                Error::MeshError(e)
            })?;
        status.network_resource_id = Some(created.id.clone());
        Ok(Some(created))
    }

    fn resource_request(&self, group_ids: &[String]) -> NetworkResourceRequest {
        NetworkResourceRequest {
            name: self.spec.name.clone(),
            description: Some(MANAGED_DESCRIPTION.to_string()),
            address: self.spec.address.clone(),
            enabled: true,
            groups: group_ids.to_vec(),
        }
    }

    pub(crate) fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: NBResource::api_version(&()).to_string(),
            kind: NBResource::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.uid().unwrap_or_default(),
            block_owner_deletion: Some(true),
            ..OwnerReference::default()
        }
    }

    fn owned_group(&self, label: &str, group_name: &str) -> NBGroup {
        NBGroup {
            metadata: ObjectMeta {
                name: Some(label.to_string()),
                namespace: self.namespace(),
                owner_references: Some(vec![self.owner_reference()]),
                finalizers: Some(vec![
                    GROUP_CLEANUP_FINALIZER.to_string(),
                    RESOURCE_CLEANUP_FINALIZER.to_string(),
                ]),
                ..ObjectMeta::default()
            },
            spec: NBGroupSpec {
                name: group_name.to_string(),
            },
            status: None,
        }
    }

    /// Teardown: withdraw policy memberships, delete the remote resource,
    /// release owned groups, then clear our own finalizers.
    pub async fn handle_delete(&self, ctx: &Context, status: &mut NBResourceStatus) -> Result<Action> {
        let ns = self.namespace().unwrap();
        let nn = format!("{}/{}", ns, self.name_any());

        // Withdraw using the previous membership value before clearing it
        if let Some(names) = status.policy_name.clone() {
            for actual in split_csv(&names) {
                self.withdraw_from_policy(ctx, &actual, &nn).await?;
            }
            status.policy_name = None;
        }

        if let Some(id) = status.network_resource_id.clone() {
            match ctx
                .mesh
                .network_resource_delete(&self.spec.network_id, &id)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    status.set_ready(
                        false,
                        "APIError",
                        Some(&format!("error deleting resource: {e}")),
                    );
                    return Err(Error::MeshError(e));
                }
            }
            status.network_resource_id = None;
        }

        // Release resource-cleanup on groups we are the primary owner of;
        // group-cleanup then takes care of the remote side.
        let api_groups: Api<NBGroup> = Api::namespaced(ctx.client.clone(), &ns);
        let groups = api_groups
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        for group in groups.items {
            let primary_owner = group
                .owner_references()
                .first()
                .map(|o| Some(o.uid.clone()) == self.uid())
                .unwrap_or(false);
            if !primary_owner {
                continue;
            }
            let finalizers = without(
                group.finalizers(),
                &RESOURCE_CLEANUP_FINALIZER.to_string(),
            );
            if finalizers.len() != group.finalizers().len() {
                api_groups
                    .patch(
                        &group.name_any(),
                        &PatchParams::apply(RESOURCE_MANAGER_NAME),
                        &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
                    )
                    .await
                    .map_err(Error::KubeError)?;
            }
        }

        let api: Api<NBResource> = Api::namespaced(ctx.client.clone(), &ns);
        api.patch(
            &self.name_any(),
            &PatchParams::apply(RESOURCE_MANAGER_NAME),
            &Patch::Merge(json!({"metadata": {"finalizers": Vec::<String>::new()}})),
        )
        .await
        .map_err(Error::KubeError)?;

        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::mock::MockMesh;
    use crate::mesh::GroupMinimum;

    fn test_resource() -> NBResource {
        let mut resource = NBResource::new(
            "test",
            NBResourceSpec {
                name: "default-test".into(),
                network_id: "net-1".into(),
                address: "test.default.svc.cluster.local".into(),
                groups: vec!["Test Group".into()],
                policy_name: String::new(),
                tcp_ports: vec![443],
                udp_ports: vec![],
                policy_source_groups: vec![],
                policy_friendly_name: None,
            },
        );
        resource.metadata.namespace = Some("default".into());
        resource.metadata.uid = Some("uid-1".into());
        resource
    }

    fn remote(id: &str, spec: &NBResourceSpec, groups: &[&str]) -> NetworkResource {
        NetworkResource {
            id: id.into(),
            name: spec.name.clone(),
            description: Some(MANAGED_DESCRIPTION.into()),
            address: spec.address.clone(),
            enabled: true,
            groups: groups
                .iter()
                .map(|g| GroupMinimum {
                    id: (*g).into(),
                    name: (*g).into(),
                })
                .collect(),
        }
    }

    #[test]
    fn owned_group_carries_finalizers_and_owner() {
        let resource = test_resource();
        let group = resource.owned_group("test-group", "Test Group");
        assert_eq!(group.metadata.name.as_deref(), Some("test-group"));
        assert_eq!(group.spec.name, "Test Group");
        let finalizers = group.metadata.finalizers.unwrap();
        assert!(finalizers.contains(&GROUP_CLEANUP_FINALIZER.to_string()));
        assert!(finalizers.contains(&RESOURCE_CLEANUP_FINALIZER.to_string()));
        let owner = &group.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn drift_detection_covers_owned_fields() {
        let resource = test_resource();
        let ids = vec!["gid".to_string()];
        let synced = remote("r1", &resource.spec, &["gid"]);
        assert!(!resource_drifted(&synced, &resource.spec, &ids));

        let mut moved = synced.clone();
        moved.address = "elsewhere".into();
        assert!(resource_drifted(&moved, &resource.spec, &ids));

        let mut disabled = synced.clone();
        disabled.enabled = false;
        assert!(resource_drifted(&disabled, &resource.spec, &ids));

        assert!(resource_drifted(&synced, &resource.spec, &["other".to_string()]));
    }

    #[tokio::test]
    async fn create_records_id_and_body() {
        let mesh = MockMesh::default();
        let resource = test_resource();
        let mut status = NBResourceStatus::default();

        let remote = resource
            .sync_network_resource(&mesh, &["gid".into()], &mut status)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.network_resource_id.as_deref(), Some(remote.id.as_str()));
        mesh.with_state(|s| {
            let (network, req) = &s.created_resources[0];
            assert_eq!(network, "net-1");
            assert_eq!(req.name, "default-test");
            assert_eq!(req.address, "test.default.svc.cluster.local");
            assert!(req.enabled);
            assert_eq!(req.groups, vec!["gid"]);
            assert_eq!(req.description.as_deref(), Some(MANAGED_DESCRIPTION));
        });
    }

    #[tokio::test]
    async fn lost_remote_clears_id_for_recreate() {
        let mesh = MockMesh::default();
        let resource = test_resource();
        let mut status = NBResourceStatus {
            network_resource_id: Some("vanished".into()),
            ..Default::default()
        };

        let outcome = resource
            .sync_network_resource(&mesh, &["gid".into()], &mut status)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(status.network_resource_id, None);
        let cond = status.conditions.as_ref().unwrap().first().unwrap();
        assert_eq!(cond.reason.as_deref(), Some("Gone"));
    }

    #[tokio::test]
    async fn drifted_remote_is_updated_in_place() {
        let mesh = MockMesh::default();
        let resource = test_resource();
        let mut stale = remote("r1", &resource.spec, &["old-group"]);
        stale.enabled = false;
        mesh.seed_resource(stale);
        let mut status = NBResourceStatus {
            network_resource_id: Some("r1".into()),
            ..Default::default()
        };

        resource
            .sync_network_resource(&mesh, &["gid".into()], &mut status)
            .await
            .unwrap()
            .unwrap();
        mesh.with_state(|s| {
            assert_eq!(s.updated_resources.len(), 1);
            let (_, req) = &s.updated_resources[0];
            assert!(req.enabled);
            assert_eq!(req.groups, vec!["gid"]);
        });
    }

    #[test]
    fn spec_comparator_is_order_insensitive_on_sets() {
        let a = test_resource().spec;
        let mut b = a.clone();
        b.groups = a.groups.iter().rev().cloned().collect();
        assert!(a.equal(&b));
        b.policy_name = "other".into();
        assert!(!a.equal(&b));
    }
}
