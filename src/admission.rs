//! Admission control: validators guarding destructive deletes and the Pod
//! defaulter injecting the netbird sidecar.

use json_patch::{jsonptr::PointerBuf, AddOperation, Patch as JsonPatch, PatchOperation};
use k8s_openapi::api::core::v1::{Capabilities, Container, EnvVar, EnvVarSource, Pod, Secret, SecurityContext, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, ResourceExt},
    core::{
        admission::{AdmissionRequest, AdmissionResponse, Operation},
        DynamicObject,
    },
    Client,
};
use tracing::*;
use uuid::Uuid;

use crate::group_controller::NBGroup;
use crate::resource_controller::NBResource;
use crate::routingpeer_controller::NBRoutingPeer;
use crate::service_controller::EXPOSE_ANNOTATION;
use crate::setupkey_controller::{NBSetupKey, EXTRA_DNS_LABELS_ANNOTATION, SETUP_KEY_ANNOTATION};

/// NBGroup deletion is blocked while any owner NBResource or NBRoutingPeer
/// is alive; the finalizer chain would otherwise leave dangling remote state.
pub async fn validate_group_delete(
    client: &Client,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    if req.operation != Operation::Delete {
        return res;
    }
    let Some(group) = parse_old::<NBGroup>(req) else {
        return res.deny("expected an NBGroup object");
    };
    let namespace = group.namespace().unwrap_or_default();

    for owner in group.owner_references() {
        if owner.kind == "NBResource" {
            let api: Api<NBResource> = Api::namespaced(client.clone(), &namespace);
            match api.get_opt(&owner.name).await {
                Ok(Some(resource)) if resource.metadata.deletion_timestamp.is_none() => {
                    return res.deny(format!(
                        "group attached to NBResource {}/{}",
                        namespace, owner.name
                    ));
                }
                Ok(_) => {}
                Err(e) => return res.deny(e.to_string()),
            }
        }
        if owner.kind == "NBRoutingPeer" {
            let api: Api<NBRoutingPeer> = Api::namespaced(client.clone(), &namespace);
            match api.get_opt(&owner.name).await {
                Ok(Some(peer)) if peer.metadata.deletion_timestamp.is_none() => {
                    return res.deny(format!(
                        "group attached to NBRoutingPeer {}/{}",
                        namespace, owner.name
                    ));
                }
                Ok(_) => {}
                Err(e) => return res.deny(e.to_string()),
            }
        }
    }

    res
}

/// NBResource deletion is blocked while the same-named Service still asks
/// for exposure; the projector would immediately recreate the resource.
pub async fn validate_resource_delete(
    client: &Client,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    if req.operation != Operation::Delete {
        return res;
    }
    let Some(resource) = parse_old::<NBResource>(req) else {
        return res.deny("expected an NBResource object");
    };
    let namespace = resource.namespace().unwrap_or_default();

    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);
    match api.get_opt(&resource.name_any()).await {
        Ok(Some(svc)) => {
            if svc.annotations().contains_key(EXPOSE_ANNOTATION)
                && svc.metadata.deletion_timestamp.is_none()
            {
                return res.deny(format!(
                    "service {}/{} still has {} annotation",
                    namespace,
                    svc.name_any(),
                    EXPOSE_ANNOTATION
                ));
            }
            res
        }
        Ok(None) => res,
        Err(e) => res.deny(e.to_string()),
    }
}

/// NBRoutingPeer deletion cascades into every NBResource on its network;
/// dry-run each deletion so any blocked resource blocks the peer too.
pub async fn validate_routing_peer_delete(
    client: &Client,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    if req.operation != Operation::Delete {
        return res;
    }
    let Some(peer) = parse_old::<NBRoutingPeer>(req) else {
        return res.deny("expected an NBRoutingPeer object");
    };
    let Some(network_id) = peer.status.as_ref().and_then(|s| s.network_id.clone()) else {
        return res;
    };

    let api_all: Api<NBResource> = Api::all(client.clone());
    let resources = match api_all.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => return res.deny(e.to_string()),
    };

    let dry_run = DeleteParams {
        dry_run: true,
        ..DeleteParams::default()
    };
    for resource in resources
        .items
        .iter()
        .filter(|r| r.spec.network_id == network_id)
    {
        let namespace = resource.namespace().unwrap_or_default();
        let api: Api<NBResource> = Api::namespaced(client.clone(), &namespace);
        if let Err(e) = api.delete(&resource.name_any(), &dry_run).await {
            return res.deny(format!("{}/{}: {}", namespace, resource.name_any(), e));
        }
    }

    res
}

/// NBSetupKey create/update: the secret reference must be complete; missing
/// or malformed key material is a warning rather than a hard failure.
pub async fn validate_setup_key(
    client: &Client,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    match &req.operation {
        Operation::Create | Operation::Update => {}
        Operation::Delete => return validate_setup_key_delete(client, req).await,
        _ => return res,
    }
    let Some(setup_key) = parse_new::<NBSetupKey>(req) else {
        return res.deny("expected an NBSetupKey object");
    };
    let namespace = setup_key.namespace().unwrap_or_default();

    if setup_key.spec.secret_key_ref.name.is_empty() {
        return res.deny("spec.secretKeyRef.name is required");
    }
    if setup_key.spec.secret_key_ref.key.is_empty() {
        return res.deny("spec.secretKeyRef.key is required");
    }

    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = match api.get_opt(&setup_key.spec.secret_key_ref.name).await {
        Ok(secret) => secret,
        Err(e) => return res.deny(e.to_string()),
    };

    if let Some(warning) = setup_key_warning(&setup_key, secret.as_ref()) {
        return with_warning(res, warning);
    }

    res
}

async fn validate_setup_key_delete(
    client: &Client,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    let Some(setup_key) = parse_old::<NBSetupKey>(req) else {
        return res.deny("expected an NBSetupKey object");
    };
    let namespace = setup_key.namespace().unwrap_or_default();

    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pods = match api.list(&ListParams::default()).await {
        Ok(pods) => pods,
        Err(e) => return res.deny(e.to_string()),
    };

    let blocked = pods_using_setup_key(&pods.items, &setup_key.name_any());
    if !blocked.is_empty() {
        return res.deny(format!(
            "NBSetupKey is in-use by {} pods: {}",
            blocked.len(),
            blocked.join(",")
        ));
    }

    res
}

/// Pod defaulter: a non-empty `netbird.io/setup-key` annotation appends the
/// netbird sidecar wired to the referenced secret.
pub async fn mutate_pod(
    client: &Client,
    req: &AdmissionRequest<DynamicObject>,
    management_url: &str,
    client_image: &str,
) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    let Some(pod) = parse_new::<Pod>(req) else {
        return res;
    };

    let setup_key_name = pod
        .annotations()
        .get(SETUP_KEY_ANNOTATION)
        .filter(|v| !v.is_empty());
    let Some(setup_key_name) = setup_key_name else {
        return res;
    };
    let namespace = req.namespace.clone().unwrap_or_default();

    let api: Api<NBSetupKey> = Api::namespaced(client.clone(), &namespace);
    let setup_key = match api.get(setup_key_name).await {
        Ok(sk) => sk,
        Err(e) => return res.deny(e.to_string()),
    };
    if !setup_key.is_ready() {
        return res.deny("NBSetupKey is not ready");
    }

    let extra_dns = pod
        .annotations()
        .get(EXTRA_DNS_LABELS_ANNOTATION)
        .filter(|v| !v.is_empty())
        .cloned();
    let sidecar = build_sidecar(&setup_key, management_url, client_image, extra_dns.as_deref());

    let mut patches = Vec::new();
    if pod.spec.as_ref().map(|s| s.containers.is_empty()).unwrap_or(true) {
        patches.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "containers"]),
            value: serde_json::json!([]),
        }));
    }
    patches.push(PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["spec", "containers", "-"]),
        value: serde_json::json!(sidecar),
    }));
    if let Some(volumes) = &setup_key.spec.volumes {
        if pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .is_none()
        {
            patches.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "volumes"]),
                value: serde_json::json!([]),
            }));
        }
        for volume in volumes {
            patches.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "volumes", "-"]),
                value: serde_json::json!(volume),
            }));
        }
    }

    match res.with_patch(JsonPatch(patches)) {
        Ok(res) => {
            info!("injected netbird sidecar into pod {}", pod.name_any());
            res
        }
        Err(e) => AdmissionResponse::invalid(e.to_string()),
    }
}

/// The injected client container. The management URL prefers the
/// NBSetupKey's override.
pub fn build_sidecar(
    setup_key: &NBSetupKey,
    management_url: &str,
    client_image: &str,
    extra_dns_labels: Option<&str>,
) -> Container {
    let management_url = if setup_key.spec.management_url.is_empty() {
        management_url
    } else {
        setup_key.spec.management_url.as_str()
    };

    let mut args = vec![
        "--setup-key-file".to_string(),
        "/etc/nbkey".to_string(),
        "-m".to_string(),
        management_url.to_string(),
    ];
    if let Some(extra) = extra_dns_labels {
        args.push("--extra-dns-labels".to_string());
        args.push(extra.to_string());
    }

    Container {
        name: "netbird".to_string(),
        image: Some(client_image.to_string()),
        args: Some(args),
        env: Some(vec![
            EnvVar {
                name: "NB_SETUP_KEY".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(setup_key.spec.secret_key_ref.clone()),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
            EnvVar {
                name: "NB_MANAGEMENT_URL".to_string(),
                value: Some(management_url.to_string()),
                ..EnvVar::default()
            },
        ]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Capabilities::default()
            }),
            ..SecurityContext::default()
        }),
        volume_mounts: setup_key.spec.volume_mounts.clone(),
        ..Container::default()
    }
}

/// Names of pods bound to the named NBSetupKey via annotation.
pub fn pods_using_setup_key(pods: &[Pod], setup_key_name: &str) -> Vec<String> {
    pods.iter()
        .filter(|p| {
            p.annotations()
                .get(SETUP_KEY_ANNOTATION)
                .map(|v| v == setup_key_name)
                .unwrap_or(false)
        })
        .map(|p| p.name_any())
        .collect()
}

/// Warning text for a setup key whose secret material is absent or not a
/// UUID. `None` means the reference checks out.
pub fn setup_key_warning(setup_key: &NBSetupKey, secret: Option<&Secret>) -> Option<String> {
    let namespace = setup_key.namespace().unwrap_or_default();
    let secret_name = &setup_key.spec.secret_key_ref.name;
    let key = &setup_key.spec.secret_key_ref.key;

    let Some(secret) = secret else {
        return Some(format!("secret {namespace}/{secret_name} not found"));
    };
    let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) else {
        return Some(format!(
            "key {key} in secret {namespace}/{secret_name} not found"
        ));
    };
    let valid = std::str::from_utf8(&value.0)
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .is_some();
    if !valid {
        return Some(format!(
            "setupkey {key} in secret {namespace}/{secret_name} is not a valid setup key"
        ));
    }
    None
}

fn with_warning(mut res: AdmissionResponse, warning: String) -> AdmissionResponse {
    warn!("{warning}");
    res.warnings = Some(vec![warning]);
    res
}

fn parse_new<K>(req: &AdmissionRequest<DynamicObject>) -> Option<K>
where
    K: kube::Resource + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    req.object.clone().and_then(|obj| obj.try_parse::<K>().ok())
}

fn parse_old<K>(req: &AdmissionRequest<DynamicObject>) -> Option<K>
where
    K: kube::Resource + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    req.old_object
        .clone()
        .and_then(|obj| obj.try_parse::<K>().ok())
}
