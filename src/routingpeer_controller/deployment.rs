use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use super::NBRoutingPeer;

pub static ROUTER_LABEL_KEY: &str = "app.kubernetes.io/name";
pub static ROUTER_LABEL_VALUE: &str = "netbird-router";
pub static SETUP_KEY_SECRET_KEY: &str = "setupKey";
pub static DEFAULT_REPLICAS: i32 = 3;

/// Build the data-plane Deployment owned by a routing peer. The client
/// joins the overlay with the setup key provisioned into the peer's Secret.
pub fn create_owned_deployment(
    nbrp: &NBRoutingPeer,
    client_image: &str,
    management_url: &str,
) -> Deployment {
    let selector_labels =
        BTreeMap::from([(ROUTER_LABEL_KEY.to_string(), ROUTER_LABEL_VALUE.to_string())]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(nbrp.name_any()),
            namespace: nbrp.namespace(),
            owner_references: Some(vec![nbrp.owner_reference()]),
            labels: nbrp.spec.labels.clone(),
            annotations: nbrp.spec.annotations.clone(),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(nbrp.spec.replicas.unwrap_or(DEFAULT_REPLICAS)),
            selector: LabelSelector {
                match_labels: Some(selector_labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    node_selector: nbrp.spec.node_selector.clone(),
                    tolerations: nbrp.spec.tolerations.clone(),
                    containers: vec![Container {
                        name: "netbird".to_string(),
                        image: Some(client_image.to_string()),
                        env: Some(vec![
                            EnvVar {
                                name: "NB_SETUP_KEY".to_string(),
                                value_from: Some(EnvVarSource {
                                    secret_key_ref: Some(SecretKeySelector {
                                        name: nbrp.name_any(),
                                        key: SETUP_KEY_SECRET_KEY.to_string(),
                                        ..SecretKeySelector::default()
                                    }),
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
                        resources: nbrp.spec.resources.clone(),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Default::default()
    }
}

/// Whether the live Deployment diverges from the desired one on any field
/// the operator owns. Patching is skipped when the diff is empty so the
/// watch on owned Deployments does not loop.
pub fn deployment_drifted(existing: &Deployment, desired: &Deployment) -> bool {
    let e_spec = existing.spec.as_ref();
    let d_spec = desired.spec.as_ref();

    if e_spec.and_then(|s| s.replicas) != d_spec.and_then(|s| s.replicas) {
        return true;
    }
    if e_spec.map(|s| &s.selector) != d_spec.map(|s| &s.selector) {
        return true;
    }
    if e_spec.and_then(|s| s.template.metadata.as_ref().and_then(|m| m.labels.as_ref()))
        != d_spec.and_then(|s| s.template.metadata.as_ref().and_then(|m| m.labels.as_ref()))
    {
        return true;
    }

    let e_pod = e_spec.and_then(|s| s.template.spec.as_ref());
    let d_pod = d_spec.and_then(|s| s.template.spec.as_ref());
    if e_pod.and_then(|p| p.node_selector.as_ref()) != d_pod.and_then(|p| p.node_selector.as_ref())
    {
        return true;
    }
    if e_pod.and_then(|p| p.tolerations.as_ref()) != d_pod.and_then(|p| p.tolerations.as_ref()) {
        return true;
    }

    let e_containers = e_pod.map(|p| &p.containers);
    let d_containers = d_pod.map(|p| &p.containers);
    match (e_containers, d_containers) {
        (Some(e), Some(d)) => {
            if e.len() != d.len() {
                return true;
            }
            for (ec, dc) in e.iter().zip(d.iter()) {
                if ec.name != dc.name
                    || ec.image != dc.image
                    || ec.env != dc.env
                    || ec.security_context != dc.security_context
                    || ec.resources != dc.resources
                {
                    return true;
                }
            }
        }
        _ => return true,
    }

    // Labels are owned wholesale; annotations are only overlaid
    if desired.metadata.labels != existing.metadata.labels {
        return true;
    }
    if let Some(want) = desired.metadata.annotations.as_ref() {
        let have = existing.metadata.annotations.clone().unwrap_or_default();
        if want.iter().any(|(k, v)| have.get(k) != Some(v)) {
            return true;
        }
    }

    false
}
