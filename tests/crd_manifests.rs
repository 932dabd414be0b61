use kube::CustomResourceExt;
use operator::{
    group_controller::NBGroup, policy_controller::NBPolicy, resource_controller::NBResource,
    routingpeer_controller::NBRoutingPeer, setupkey_controller::NBSetupKey,
};

#[test]
fn crds_generate_with_expected_names() {
    assert_eq!(NBGroup::crd().metadata.name.as_deref(), Some("nbgroups.netbird.io"));
    assert_eq!(
        NBResource::crd().metadata.name.as_deref(),
        Some("nbresources.netbird.io")
    );
    assert_eq!(
        NBPolicy::crd().metadata.name.as_deref(),
        Some("nbpolicies.netbird.io")
    );
    assert_eq!(
        NBRoutingPeer::crd().metadata.name.as_deref(),
        Some("nbroutingpeers.netbird.io")
    );
    assert_eq!(
        NBSetupKey::crd().metadata.name.as_deref(),
        Some("nbsetupkeys.netbird.io")
    );
}

#[test]
fn policy_is_cluster_scoped_and_the_rest_namespaced() {
    assert_eq!(NBPolicy::crd().spec.scope, "Cluster");
    for scope in [
        NBGroup::crd().spec.scope,
        NBResource::crd().spec.scope,
        NBRoutingPeer::crd().spec.scope,
        NBSetupKey::crd().spec.scope,
    ] {
        assert_eq!(scope, "Namespaced");
    }
}

#[test]
fn crds_serialize_to_yaml() {
    for yaml in [
        serde_yaml::to_string(&NBGroup::crd()).unwrap(),
        serde_yaml::to_string(&NBPolicy::crd()).unwrap(),
        serde_yaml::to_string(&NBSetupKey::crd()).unwrap(),
    ] {
        assert!(yaml.contains("netbird.io"));
        assert!(yaml.contains("status"));
    }
}
