use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, ResourceExt},
    runtime::controller::Action,
};
use serde_json::json;
use tracing::*;

use super::Context;
use crate::config::Settings;
use crate::resource_controller::{NBResource, NBResourceSpec};
use crate::routingpeer_controller::{NBRoutingPeer, NBRoutingPeerSpec};
use crate::util::{split_csv, DEFAULT_REQUEUE};
use crate::{Error, Result};

pub static SERVICE_MANAGER_NAME: &str = "service-controller";
pub static SERVICE_CLEANUP_FINALIZER: &str = "netbird.io/cleanup";

/// Service annotation that activates projection.
pub static EXPOSE_ANNOTATION: &str = "netbird.io/expose";
pub static GROUPS_ANNOTATION: &str = "netbird.io/groups";
pub static RESOURCE_NAME_ANNOTATION: &str = "netbird.io/resource-name";
pub static POLICY_ANNOTATION: &str = "netbird.io/policy";
pub static POLICY_PORTS_ANNOTATION: &str = "netbird.io/policy-ports";
pub static POLICY_PROTOCOL_ANNOTATION: &str = "netbird.io/policy-protocol";
pub static POLICY_SOURCE_GROUPS_ANNOTATION: &str = "netbird.io/policy-source-groups";
pub static POLICY_NAME_ANNOTATION: &str = "netbird.io/policy-name";

/// Name of the routing peer the projector provisions on first use.
pub static DEFAULT_ROUTING_PEER_NAME: &str = "router";

/// Compute the NBResource spec projected from a Service and its
/// annotations. Pure; all cluster state comes in as arguments.
pub(crate) fn project_spec(
    svc: &Service,
    settings: &Settings,
    network_id: &str,
) -> Result<NBResourceSpec> {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let annotations = svc.annotations();

    let groups = match annotations.get(GROUPS_ANNOTATION) {
        Some(value) => split_csv(value),
        None => vec![format!("{}-{}-{}", settings.cluster_name, namespace, name)],
    };
    let resource_name = annotations
        .get(RESOURCE_NAME_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| format!("{}-{}", namespace, name));

    let mut spec = NBResourceSpec {
        name: resource_name,
        network_id: network_id.to_string(),
        address: format!("{}.{}.{}", name, namespace, settings.cluster_dns),
        groups,
        policy_name: String::new(),
        tcp_ports: vec![],
        udp_ports: vec![],
        policy_source_groups: vec![],
        policy_friendly_name: None,
    };

    if let Some(policy) = annotations.get(POLICY_ANNOTATION) {
        spec.policy_name = policy.clone();

        let filter_protocol = annotations.get(POLICY_PROTOCOL_ANNOTATION);
        let mut filter_ports: Vec<i32> = Vec::new();
        if let Some(value) = annotations.get(POLICY_PORTS_ANNOTATION) {
            for part in split_csv(value) {
                let port = part.parse::<i32>().map_err(|e| {
                    Error::ValidationError(format!("invalid policy port \"{part}\": {e}"))
                })?;
                filter_ports.push(port);
            }
        }

        for port in svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .into_iter()
            .flatten()
        {
            let bucket = match port.protocol.as_deref() {
                Some("TCP") => &mut spec.tcp_ports,
                Some("UDP") => &mut spec.udp_ports,
                other => {
                    debug!("unsupported service port protocol {:?}", other);
                    continue;
                }
            };
            if !filter_ports.is_empty() && !filter_ports.contains(&port.port) {
                continue;
            }
            if let Some(protocol) = filter_protocol {
                let matches = match port.protocol.as_deref() {
                    Some("TCP") => protocol == "tcp",
                    Some("UDP") => protocol == "udp",
                    _ => false,
                };
                if !matches {
                    continue;
                }
            }
            if !bucket.contains(&port.port) {
                bucket.push(port.port);
            }
        }

        if let Some(value) = annotations.get(POLICY_SOURCE_GROUPS_ANNOTATION) {
            spec.policy_source_groups = split_csv(value);
        }
        if let Some(value) = annotations.get(POLICY_NAME_ANNOTATION) {
            let mut friendly = BTreeMap::new();
            for pair in split_csv(value) {
                if let Some((logical, name)) = pair.split_once(':') {
                    friendly.insert(logical.trim().to_string(), name.trim().to_string());
                }
            }
            if !friendly.is_empty() {
                spec.policy_friendly_name = Some(friendly);
            }
        }
    }

    Ok(spec)
}

/// Create or update the NBResource projected from an exposed Service,
/// provisioning the default routing peer on first use.
pub async fn expose_service(svc: &Service, ctx: &Context) -> Result<Action> {
    let namespace = svc.namespace().unwrap();
    let name = svc.name_any();

    if !svc
        .finalizers()
        .iter()
        .any(|f| f == SERVICE_CLEANUP_FINALIZER)
    {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
        let mut finalizers = svc.finalizers().to_vec();
        finalizers.push(SERVICE_CLEANUP_FINALIZER.to_string());
        api.patch(
            &name,
            &PatchParams::apply(SERVICE_MANAGER_NAME),
            &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
        )
        .await
        .map_err(Error::KubeError)?;
    }

    let router_namespace = ctx.settings.router_namespace(&namespace).to_string();
    let api_rp: Api<NBRoutingPeer> = Api::namespaced(ctx.client.clone(), &router_namespace);
    let routing_peer = api_rp
        .get_opt(DEFAULT_ROUTING_PEER_NAME)
        .await
        .map_err(Error::KubeError)?;

    let Some(routing_peer) = routing_peer else {
        info!(
            "creating default NBRoutingPeer {}/{}",
            router_namespace, DEFAULT_ROUTING_PEER_NAME
        );
        let peer = NBRoutingPeer {
            metadata: ObjectMeta {
                name: Some(DEFAULT_ROUTING_PEER_NAME.to_string()),
                namespace: Some(router_namespace),
                finalizers: Some(vec![SERVICE_CLEANUP_FINALIZER.to_string()]),
                ..ObjectMeta::default()
            },
            spec: NBRoutingPeerSpec::default(),
            status: None,
        };
        api_rp
            .create(&PostParams::default(), &peer)
            .await
            .map_err(Error::KubeError)?;
        // Network is not up yet; poll until the routing peer binds it
        return Ok(Action::requeue(Duration::from_secs(5)));
    };

    let Some(network_id) = routing_peer.status.as_ref().and_then(|s| s.network_id.clone())
    else {
        info!("network not available yet for {}/{}", namespace, name);
        return Ok(Action::requeue(Duration::from_secs(5)));
    };

    let spec = project_spec(svc, &ctx.settings, &network_id)?;

    let api_resource: Api<NBResource> = Api::namespaced(ctx.client.clone(), &namespace);
    let existing = api_resource
        .get_opt(&name)
        .await
        .map_err(Error::KubeError)?;

    match existing {
        None => {
            info!("creating NBResource {}/{}", namespace, name);
            let resource = NBResource {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace),
                    finalizers: Some(vec![SERVICE_CLEANUP_FINALIZER.to_string()]),
                    ..ObjectMeta::default()
                },
                spec,
                status: None,
            };
            api_resource
                .create(&PostParams::default(), &resource)
                .await
                .map_err(Error::KubeError)?;
        }
        Some(existing) if !existing.spec.equal(&spec) => {
            info!("updating NBResource {}/{}", namespace, name);
            api_resource
                .patch(
                    &name,
                    &PatchParams::apply(SERVICE_MANAGER_NAME),
                    &Patch::Merge(json!({ "spec": spec })),
                )
                .await
                .map_err(Error::KubeError)?;
        }
        Some(_) => {}
    }

    Ok(Action::requeue(DEFAULT_REQUEUE))
}

/// Remove the projected NBResource and release the Service finalizer.
pub async fn hide_service(svc: &Service, ctx: &Context) -> Result<Action> {
    let namespace = svc.namespace().unwrap();
    let name = svc.name_any();

    let api_resource: Api<NBResource> = Api::namespaced(ctx.client.clone(), &namespace);
    if api_resource
        .get_opt(&name)
        .await
        .map_err(Error::KubeError)?
        .is_some()
    {
        info!("deleting NBResource {}/{}", namespace, name);
        api_resource
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(Error::KubeError)?;
    }

    if svc
        .finalizers()
        .iter()
        .any(|f| f == SERVICE_CLEANUP_FINALIZER)
    {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
        let finalizers: Vec<String> = svc
            .finalizers()
            .iter()
            .filter(|f| *f != SERVICE_CLEANUP_FINALIZER)
            .cloned()
            .collect();
        api.patch(
            &name,
            &PatchParams::apply(SERVICE_MANAGER_NAME),
            &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
        )
        .await
        .map_err(Error::KubeError)?;
    }

    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn service_with(annotations: &[(&str, &str)], ports: Vec<(i32, &str)>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("test-resource".into()),
                namespace: Some("default".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(port, protocol)| ServicePort {
                            port,
                            protocol: Some(protocol.to_string()),
                            ..ServicePort::default()
                        })
                        .collect(),
                ),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn default_projection_without_policy() {
        let svc = service_with(
            &[(EXPOSE_ANNOTATION, "true")],
            vec![(80, "TCP"), (443, "TCP"), (80, "UDP"), (443, "UDP")],
        );
        let spec = project_spec(&svc, &Settings::default(), "net-1").unwrap();

        assert_eq!(spec.name, "default-test-resource");
        assert_eq!(spec.address, "test-resource.default.svc.cluster.local");
        assert_eq!(spec.network_id, "net-1");
        assert_eq!(spec.groups, vec!["kubernetes-default-test-resource"]);
        assert!(spec.tcp_ports.is_empty());
        assert!(spec.udp_ports.is_empty());
        assert_eq!(spec.policy_name, "");
    }

    #[test]
    fn policy_annotation_collects_service_ports() {
        let svc = service_with(
            &[(EXPOSE_ANNOTATION, "true"), (POLICY_ANNOTATION, "web")],
            vec![(80, "TCP"), (443, "TCP"), (53, "UDP")],
        );
        let spec = project_spec(&svc, &Settings::default(), "net-1").unwrap();

        assert_eq!(spec.policy_name, "web");
        assert_eq!(spec.tcp_ports, vec![80, 443]);
        assert_eq!(spec.udp_ports, vec![53]);
    }

    #[test]
    fn port_and_protocol_filters_intersect() {
        let svc = service_with(
            &[
                (EXPOSE_ANNOTATION, "true"),
                (POLICY_ANNOTATION, "web"),
                (POLICY_PORTS_ANNOTATION, "443"),
                (POLICY_PROTOCOL_ANNOTATION, "tcp"),
            ],
            vec![(80, "TCP"), (443, "TCP"), (443, "UDP")],
        );
        let spec = project_spec(&svc, &Settings::default(), "net-1").unwrap();

        assert_eq!(spec.tcp_ports, vec![443]);
        assert!(spec.udp_ports.is_empty());
    }

    #[test]
    fn group_and_name_overrides_win() {
        let svc = service_with(
            &[
                (EXPOSE_ANNOTATION, "true"),
                (GROUPS_ANNOTATION, "one, two"),
                (RESOURCE_NAME_ANNOTATION, "custom"),
            ],
            vec![],
        );
        let spec = project_spec(&svc, &Settings::default(), "net-1").unwrap();

        assert_eq!(spec.name, "custom");
        assert_eq!(spec.groups, vec!["one", "two"]);
    }

    #[test]
    fn policy_name_annotation_builds_friendly_map() {
        let svc = service_with(
            &[
                (EXPOSE_ANNOTATION, "true"),
                (POLICY_ANNOTATION, "internal,extra"),
                (POLICY_NAME_ANNOTATION, "internal:Internal Access,bogus"),
                (POLICY_SOURCE_GROUPS_ANNOTATION, "All"),
            ],
            vec![],
        );
        let spec = project_spec(&svc, &Settings::default(), "net-1").unwrap();

        assert_eq!(spec.policy_name, "internal,extra");
        assert_eq!(spec.policy_source_groups, vec!["All"]);
        let friendly = spec.policy_friendly_name.unwrap();
        assert_eq!(friendly.get("internal").map(String::as_str), Some("Internal Access"));
        assert_eq!(friendly.len(), 1);
    }

    #[test]
    fn invalid_policy_port_is_rejected() {
        let svc = service_with(
            &[
                (EXPOSE_ANNOTATION, "true"),
                (POLICY_ANNOTATION, "web"),
                (POLICY_PORTS_ANNOTATION, "https"),
            ],
            vec![(443, "TCP")],
        );
        assert!(project_spec(&svc, &Settings::default(), "net-1").is_err());
    }
}
