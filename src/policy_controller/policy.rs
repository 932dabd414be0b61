use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
    CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use tracing::*;

use super::Context;
use crate::conditions::{conditions_equal, Conditions, NBCondition};
use crate::mesh::{
    group_names_to_ids, MeshApi, PolicyRequest, PolicyRuleUpdate, POLICY_ACTION_ACCEPT,
};
use crate::resource_controller::NBResource;
use crate::util::{equivalent, split_csv, DEFAULT_REQUEUE};
use crate::{Error, Result};
use operator_derive::Conditions;

pub static POLICY_MANAGER_NAME: &str = "nbpolicy-controller";
pub static POLICY_CLEANUP_FINALIZER: &str = "netbird.io/cleanup";

pub static PROTOCOL_TCP: &str = "tcp";
pub static PROTOCOL_UDP: &str = "udp";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "netbird.io",
    version = "v1",
    kind = "NBPolicy",
    shortname = "nbpol",
    doc = "NBPolicy aggregates exposed cluster services into NetBird access policies",
    printcolumn = r#"{"name":"TCP Policy","jsonPath":".status.tcpPolicyID","type":"string"}"#,
    printcolumn = r#"{"name":"UDP Policy","jsonPath":".status.udpPolicyID","type":"string"}"#,
    printcolumn = r#"{"name":"Ready","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","type":"string"}"#,
    status = "NBPolicyStatus"
)]
pub struct NBPolicySpec {
    /// Policy name prefix on the management API; per-protocol policies are
    /// named "<name> TCP" and "<name> UDP"
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Group names allowed as sources
    #[serde(default)]
    pub source_groups: Vec<String>,
    /// Group names always added to destinations, on top of member resources
    #[serde(default)]
    pub destination_groups: Vec<String>,
    /// Restrict managed protocols; both tcp and udp when empty
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Ports added to every member resource's ports
    #[serde(default)]
    pub ports: Vec<i32>,
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
}

fn default_bidirectional() -> bool {
    true
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Conditions)]
#[serde(rename_all = "camelCase")]
pub struct NBPolicyStatus {
    #[serde(rename = "tcpPolicyID")]
    pub tcp_policy_id: Option<String>,
    #[serde(rename = "udpPolicyID")]
    pub udp_policy_id: Option<String>,
    pub last_updated_at: Option<Time>,
    /// Namespaced names of NBResources currently feeding this policy
    #[serde(default)]
    pub managed_service_list: Vec<String>,
    pub conditions: Option<Vec<NBCondition>>,
}

impl NBPolicyStatus {
    pub fn equal(&self, other: &Self) -> bool {
        self.tcp_policy_id == other.tcp_policy_id
            && self.udp_policy_id == other.udp_policy_id
            && self.last_updated_at == other.last_updated_at
            && equivalent(&self.managed_service_list, &other.managed_service_list)
            && conditions_equal(&self.conditions, &other.conditions)
    }
}

/// Aggregated member-resource input for one reconcile pass.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct RuleInputs {
    pub tcp_ports: BTreeSet<i32>,
    pub udp_ports: BTreeSet<i32>,
    /// Resolved destination group IDs, spec groups first, member groups after
    pub destinations: Vec<String>,
}

/// Fold member resources into per-protocol port sets and destination IDs.
/// `resolved_dest_ids` are the name-resolved `spec.destinationGroups`.
pub(crate) fn collect_rule_inputs(
    policy: &NBPolicy,
    resources: &[NBResource],
    resolved_dest_ids: Vec<String>,
) -> RuleInputs {
    let mut inputs = RuleInputs {
        destinations: Vec::new(),
        ..Default::default()
    };
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for id in resolved_dest_ids {
        if seen.insert(id.clone()) {
            inputs.destinations.push(id);
        }
    }

    let policy_name = policy.name_any();
    for resource in resources {
        let Some(status) = &resource.status else {
            continue;
        };
        let member = status
            .policy_name
            .as_deref()
            .map(|names| split_csv(names).contains(&policy_name))
            .unwrap_or(false);
        if !member {
            continue;
        }
        for id in &status.groups {
            if seen.insert(id.clone()) {
                inputs.destinations.push(id.clone());
            }
        }
        inputs.tcp_ports.extend(resource.spec.tcp_ports.iter().copied());
        inputs.udp_ports.extend(resource.spec.udp_ports.iter().copied());
    }

    inputs
}

/// Per-protocol request body. Port lists are set-unions submitted as sorted
/// strings so reconciles are deterministic.
pub(crate) fn policy_request(
    policy: &NBPolicy,
    protocol: &str,
    sources: &[String],
    destinations: &[String],
    ports: &[String],
) -> PolicyRequest {
    let name = format!("{} {}", policy.spec.name, protocol.to_uppercase());
    let description = Some(policy.spec.description.clone());
    PolicyRequest {
        name: name.clone(),
        description: description.clone(),
        enabled: true,
        rules: vec![PolicyRuleUpdate {
            name,
            description,
            enabled: true,
            action: POLICY_ACTION_ACCEPT.to_string(),
            protocol: protocol.to_string(),
            bidirectional: policy.spec.bidirectional,
            sources: sources.to_vec(),
            destinations: destinations.to_vec(),
            ports: ports.to_vec(),
        }],
    }
}

fn string_ports(proto_ports: &BTreeSet<i32>, spec_ports: &[i32]) -> Vec<String> {
    let mut all: BTreeSet<i32> = proto_ports.clone();
    all.extend(spec_ports.iter().copied());
    all.into_iter().map(|p| p.to_string()).collect()
}

impl NBPolicy {
    pub async fn reconcile(&self, ctx: &Context) -> Result<Action> {
        let previous = self.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let outcome = self.sync(ctx, &mut status).await;

        if !status.equal(&previous) {
            let api: Api<NBPolicy> = Api::all(ctx.client.clone());
            api.patch_status(
                &self.name_any(),
                &PatchParams::apply(POLICY_MANAGER_NAME),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map_err(Error::KubeError)?;
        }

        outcome
    }

    async fn sync(&self, ctx: &Context, status: &mut NBPolicyStatus) -> Result<Action> {
        let resources = self.prune_managed_services(ctx, status).await?;

        let resolved_dests = group_names_to_ids(ctx.mesh.as_ref(), &self.spec.destination_groups)
            .await
            .map_err(|e| {
                status.set_ready(false, "APIError", Some(&format!("error resolving groups: {e}")));
                Error::MeshError(e)
            })?;
        let inputs = collect_rule_inputs(self, &resources, resolved_dests);

        let sources = group_names_to_ids(ctx.mesh.as_ref(), &self.spec.source_groups)
            .await
            .map_err(|e| {
                status.set_ready(false, "APIError", Some(&format!("error resolving groups: {e}")));
                Error::MeshError(e)
            })?;

        let mut requeue = false;
        for protocol in [PROTOCOL_TCP, PROTOCOL_UDP] {
            let proto_ports = match protocol {
                p if p == PROTOCOL_TCP => &inputs.tcp_ports,
                _ => &inputs.udp_ports,
            };
            requeue |= self
                .sync_protocol(
                    ctx.mesh.as_ref(),
                    status,
                    protocol,
                    &sources,
                    &inputs.destinations,
                    proto_ports,
                )
                .await?;
        }

        if requeue {
            return Ok(Action::requeue(Duration::ZERO));
        }

        status.set_ready(true, "Ready", None);
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }

    /// Drop managed-service entries whose NBResource is gone or deleting,
    /// returning the surviving resources.
    async fn prune_managed_services(
        &self,
        ctx: &Context,
        status: &mut NBPolicyStatus,
    ) -> Result<Vec<NBResource>> {
        let mut kept = Vec::new();
        let mut resources = Vec::new();
        for entry in status.managed_service_list.clone().iter() {
            let Some((namespace, name)) = entry.split_once('/') else {
                warn!("malformed managed service entry: {entry}");
                continue;
            };
            let api: Api<NBResource> = Api::namespaced(ctx.client.clone(), namespace);
            let resource = api.get_opt(name).await.map_err(|e| {
                status.set_ready(
                    false,
                    "internalError",
                    Some(&format!("Error getting NBResource: {e}")),
                );
                Error::KubeError(e)
            })?;
            if let Some(resource) = resource {
                if resource.metadata.deletion_timestamp.is_none() {
                    kept.push(entry.clone());
                    resources.push(resource);
                }
            }
        }
        status.managed_service_list = kept;
        Ok(resources)
    }

    /// Create, update or delete the remote policy for one protocol.
    /// Returns whether an immediate requeue is needed (lost remote policy).
    pub(crate) async fn sync_protocol(
        &self,
        mesh: &dyn MeshApi,
        status: &mut NBPolicyStatus,
        protocol: &str,
        sources: &[String],
        destinations: &[String],
        proto_ports: &BTreeSet<i32>,
    ) -> Result<bool> {
        let mut policy_id = match protocol {
            p if p == PROTOCOL_TCP => status.tcp_policy_id.clone(),
            _ => status.udp_policy_id.clone(),
        };
        let mut requeue = false;

        let restricted = !self.spec.protocols.is_empty()
            && !self.spec.protocols.iter().any(|p| p == protocol);
        let ports = string_ports(proto_ports, &self.spec.ports);

        if restricted {
            if let Some(id) = &policy_id {
                info!("deleting {protocol} policy, protocol is restricted");
                match mesh.policies_delete(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("Error deleting policy: {e}")),
                        );
                        return Err(Error::MeshError(e));
                    }
                }
                policy_id = None;
            }
        } else if ports.is_empty() || destinations.is_empty() || sources.is_empty() {
            if let Some(id) = &policy_id {
                // Configuration no longer sufficient to keep a policy alive
                info!("deleting {protocol} policy, inputs are empty");
                match mesh.policies_delete(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("Error deleting policy: {e}")),
                        );
                        return Err(Error::MeshError(e));
                    }
                }
                policy_id = None;
            }
        } else {
            let request = policy_request(self, protocol, sources, destinations, &ports);
            match &policy_id {
                None => {
                    info!("creating {protocol} policy \"{}\"", request.name);
                    let created = mesh.policies_create(request).await.map_err(|e| {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("Error creating policy: {e}")),
                        );
                        Error::MeshError(e)
                    })?;
                    policy_id = created.id;
                }
                Some(id) => match mesh.policies_update(id, request).await {
                    Ok(updated) => {
                        if updated.id.is_some() {
                            policy_id = updated.id;
                        }
                    }
                    Err(e) if e.is_not_found() => {
                        info!("{protocol} policy deleted upstream, recreating");
                        status.set_ready(
                            false,
                            "Gone",
                            Some("Policy deleted from the management API"),
                        );
                        policy_id = None;
                        requeue = true;
                    }
                    Err(e) => {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("Error updating policy: {e}")),
                        );
                        return Err(Error::MeshError(e));
                    }
                },
            }
        }

        match protocol {
            p if p == PROTOCOL_TCP => status.tcp_policy_id = policy_id,
            _ => status.udp_policy_id = policy_id,
        }
        Ok(requeue)
    }

    /// Remove the remote per-protocol policies; tolerates objects already
    /// deleted upstream.
    pub async fn cleanup(&self, ctx: &Context) -> Result<Action> {
        let previous = self.status.clone().unwrap_or_default();
        let mut status = previous.clone();

        for id in [status.tcp_policy_id.clone(), status.udp_policy_id.clone()]
            .into_iter()
            .flatten()
        {
            match ctx.mesh.policies_delete(&id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(Error::MeshError(e)),
            }
        }
        status.tcp_policy_id = None;
        status.udp_policy_id = None;

        if !status.equal(&previous) {
            let api: Api<NBPolicy> = Api::all(ctx.client.clone());
            // Object is on its way out; a missed write is harmless
            let _ = api
                .patch_status(
                    &self.name_any(),
                    &PatchParams::apply(POLICY_MANAGER_NAME),
                    &Patch::Merge(json!({ "status": status })),
                )
                .await;
        }

        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::mock::MockMesh;
    use crate::resource_controller::{NBResourceSpec, NBResourceStatus};

    fn member_resource(name: &str, policy: &str, tcp: Vec<i32>, groups: Vec<&str>) -> NBResource {
        let mut resource = NBResource::new(
            name,
            NBResourceSpec {
                name: name.into(),
                network_id: "net".into(),
                address: format!("{name}.default.svc.cluster.local"),
                groups: vec![name.into()],
                policy_name: policy.into(),
                tcp_ports: tcp,
                udp_ports: vec![],
                policy_source_groups: vec![],
                policy_friendly_name: None,
            },
        );
        resource.metadata.namespace = Some("default".into());
        resource.status = Some(NBResourceStatus {
            policy_name: Some(policy.into()),
            groups: groups.into_iter().map(String::from).collect(),
            ..Default::default()
        });
        resource
    }

    fn test_policy(name: &str, sources: Vec<&str>) -> NBPolicy {
        NBPolicy::new(
            name,
            NBPolicySpec {
                name: "Test".into(),
                description: String::new(),
                source_groups: sources.into_iter().map(String::from).collect(),
                destination_groups: vec![],
                protocols: vec![],
                ports: vec![],
                bidirectional: true,
            },
        )
    }

    #[test]
    fn rule_inputs_union_member_ports_and_groups() {
        let policy = test_policy("test-resource", vec!["All"]);
        let resources = vec![
            member_resource("test", "test-resource", vec![443, 80], vec!["test"]),
            member_resource("other", "test-resource", vec![443], vec!["test", "extra"]),
            member_resource("stranger", "unrelated", vec![9999], vec!["nope"]),
        ];
        let inputs = collect_rule_inputs(&policy, &resources, vec!["dest".into()]);
        assert_eq!(
            inputs.tcp_ports.iter().copied().collect::<Vec<_>>(),
            vec![80, 443]
        );
        assert!(inputs.udp_ports.is_empty());
        assert_eq!(inputs.destinations, vec!["dest", "test", "extra"]);
    }

    #[test]
    fn rule_inputs_honour_csv_membership() {
        let policy = test_policy("test-resource", vec![]);
        let resources = vec![member_resource(
            "multi",
            "first,test-resource,third",
            vec![8080],
            vec!["grp"],
        )];
        let inputs = collect_rule_inputs(&policy, &resources, vec![]);
        assert_eq!(inputs.tcp_ports.iter().copied().collect::<Vec<_>>(), vec![8080]);
        assert_eq!(inputs.destinations, vec!["grp"]);
    }

    #[tokio::test]
    async fn tcp_policy_created_with_aggregated_body() {
        // Group "All" resolves to id "meow"; member contributes port 443 and
        // destination group id "test".
        let mesh = MockMesh::default();
        mesh.seed_group("meow", "All");

        let policy = test_policy("test-resource", vec!["All"]);
        let mut status = NBPolicyStatus::default();
        let resources = vec![member_resource("test", "test-resource", vec![443], vec!["test"])];

        let sources = group_names_to_ids(&mesh, &policy.spec.source_groups)
            .await
            .unwrap();
        let inputs = collect_rule_inputs(&policy, &resources, vec![]);
        let requeue = policy
            .sync_protocol(
                &mesh,
                &mut status,
                PROTOCOL_TCP,
                &sources,
                &inputs.destinations,
                &inputs.tcp_ports,
            )
            .await
            .unwrap();

        assert!(!requeue);
        assert_eq!(status.tcp_policy_id.as_deref(), Some("policy-1"));
        mesh.with_state(|s| {
            assert_eq!(s.created_policies.len(), 1);
            let (_, req) = &s.created_policies[0];
            assert_eq!(req.name, "Test TCP");
            assert!(req.enabled);
            let rule = &req.rules[0];
            assert_eq!(rule.sources, vec!["meow"]);
            assert_eq!(rule.destinations, vec!["test"]);
            assert_eq!(rule.ports, vec!["443"]);
            assert_eq!(rule.action, "accept");
            assert!(rule.bidirectional);
        });
    }

    #[tokio::test]
    async fn restricted_protocol_deletes_tracked_policy() {
        let mesh = MockMesh::default();
        let mut policy = test_policy("test-resource", vec![]);
        policy.spec.protocols = vec!["udp".into()];
        let mut status = NBPolicyStatus {
            tcp_policy_id: Some("policyid".into()),
            ..Default::default()
        };

        let requeue = policy
            .sync_protocol(
                &mesh,
                &mut status,
                PROTOCOL_TCP,
                &["src".into()],
                &["dst".into()],
                &BTreeSet::from([443]),
            )
            .await
            .unwrap();

        assert!(!requeue);
        assert_eq!(status.tcp_policy_id, None);
        mesh.with_state(|s| assert_eq!(s.deleted_policies, vec!["policyid"]));
    }

    #[tokio::test]
    async fn empty_inputs_delete_tracked_policy_and_skip_otherwise() {
        let mesh = MockMesh::default();
        let policy = test_policy("test-resource", vec![]);

        // Tracked policy with no remaining sources gets deleted
        let mut status = NBPolicyStatus {
            udp_policy_id: Some("udp-id".into()),
            ..Default::default()
        };
        policy
            .sync_protocol(&mesh, &mut status, PROTOCOL_UDP, &[], &["d".into()], &BTreeSet::from([53]))
            .await
            .unwrap();
        assert_eq!(status.udp_policy_id, None);
        mesh.with_state(|s| assert_eq!(s.deleted_policies, vec!["udp-id"]));

        // Nothing tracked and nothing to do: no calls at all
        let mut status = NBPolicyStatus::default();
        policy
            .sync_protocol(&mesh, &mut status, PROTOCOL_UDP, &[], &[], &BTreeSet::new())
            .await
            .unwrap();
        mesh.with_state(|s| {
            assert_eq!(s.created_policies.len(), 0);
            assert_eq!(s.deleted_policies.len(), 1);
        });
    }

    #[tokio::test]
    async fn lost_remote_policy_clears_id_and_requeues() {
        let mesh = MockMesh::default();
        mesh.fail_with("policies_update", "policy not found");
        let policy = test_policy("test-resource", vec![]);
        let mut status = NBPolicyStatus {
            tcp_policy_id: Some("stale".into()),
            ..Default::default()
        };

        let requeue = policy
            .sync_protocol(
                &mesh,
                &mut status,
                PROTOCOL_TCP,
                &["s".into()],
                &["d".into()],
                &BTreeSet::from([443]),
            )
            .await
            .unwrap();

        assert!(requeue);
        assert_eq!(status.tcp_policy_id, None);
        let cond = status.conditions.as_ref().unwrap().first().unwrap();
        assert_eq!(cond.reason.as_deref(), Some("Gone"));
    }

    #[test]
    fn spec_ports_are_merged_and_sorted() {
        assert_eq!(
            string_ports(&BTreeSet::from([443, 80]), &[8080, 443]),
            vec!["80", "443", "8080"]
        );
    }
}
