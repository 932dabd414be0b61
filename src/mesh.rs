use async_trait::async_trait;
use thiserror::Error;

mod http;
pub mod types;
pub use http::MeshClient;
pub use types::*;

#[cfg(test)]
pub(crate) mod mock;

/// Error returned by the management API gateway.
///
/// The management service reports failures as plain-text bodies; the only
/// structure callers may rely on is the substring classification below.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Error body returned by the management API
    #[error("{0}")]
    Api(String),

    /// Transport-level failure before any API answer
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl MeshError {
    /// Object does not (or no longer does) exist upstream. Idempotent
    /// success on delete, drift trigger on get.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::Api(msg) if msg.contains("not found"))
    }

    /// Group is still referenced by another upstream object; local state
    /// must be preserved.
    pub fn is_linked(&self) -> bool {
        matches!(self, MeshError::Api(msg) if msg.contains("linked"))
    }
}

/// Typed operations the reconcilers need from the management API.
///
/// One trait rather than per-family handles so the controllers can share a
/// single `Arc<dyn MeshApi>` and tests can swap in a scripted double.
#[async_trait]
pub trait MeshApi: Send + Sync {
    async fn groups_list(&self) -> Result<Vec<Group>, MeshError>;
    async fn groups_create(&self, req: GroupRequest) -> Result<Group, MeshError>;
    async fn groups_delete(&self, id: &str) -> Result<(), MeshError>;

    async fn policies_create(&self, req: PolicyRequest) -> Result<Policy, MeshError>;
    async fn policies_update(&self, id: &str, req: PolicyRequest) -> Result<Policy, MeshError>;
    async fn policies_delete(&self, id: &str) -> Result<(), MeshError>;

    async fn networks_list(&self) -> Result<Vec<Network>, MeshError>;
    async fn networks_create(&self, req: NetworkRequest) -> Result<Network, MeshError>;
    async fn networks_delete(&self, id: &str) -> Result<(), MeshError>;

    async fn network_resource_get(
        &self,
        network_id: &str,
        id: &str,
    ) -> Result<NetworkResource, MeshError>;
    async fn network_resource_create(
        &self,
        network_id: &str,
        req: NetworkResourceRequest,
    ) -> Result<NetworkResource, MeshError>;
    async fn network_resource_update(
        &self,
        network_id: &str,
        id: &str,
        req: NetworkResourceRequest,
    ) -> Result<NetworkResource, MeshError>;
    async fn network_resource_delete(&self, network_id: &str, id: &str) -> Result<(), MeshError>;

    async fn network_routers_list(&self, network_id: &str) -> Result<Vec<NetworkRouter>, MeshError>;
    async fn network_router_create(
        &self,
        network_id: &str,
        req: NetworkRouterRequest,
    ) -> Result<NetworkRouter, MeshError>;
    async fn network_router_update(
        &self,
        network_id: &str,
        id: &str,
        req: NetworkRouterRequest,
    ) -> Result<NetworkRouter, MeshError>;
    async fn network_router_delete(&self, network_id: &str, id: &str) -> Result<(), MeshError>;

    async fn setup_keys_create(&self, req: CreateSetupKeyRequest) -> Result<SetupKey, MeshError>;
    async fn setup_keys_get(&self, id: &str) -> Result<SetupKey, MeshError>;
    async fn setup_keys_delete(&self, id: &str) -> Result<(), MeshError>;
}

/// Resolve group names to IDs through the remote group list. Names without
/// a match resolve to an empty string, preserving input order.
pub async fn group_names_to_ids(
    mesh: &dyn MeshApi,
    names: &[String],
) -> Result<Vec<String>, MeshError> {
    let groups = mesh.groups_list().await?;
    Ok(names
        .iter()
        .map(|n| {
            groups
                .iter()
                .find(|g| &g.name == n)
                .map(|g| g.id.clone())
                .unwrap_or_default()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_substring_based() {
        let gone = MeshError::Api("resource not found in account".into());
        assert!(gone.is_not_found());
        assert!(!gone.is_linked());

        let linked = MeshError::Api("group is linked to resource xyz".into());
        assert!(linked.is_linked());
        assert!(!linked.is_not_found());

        let other = MeshError::Api("internal server error".into());
        assert!(!other.is_not_found());
        assert!(!other.is_linked());
    }

    #[tokio::test]
    async fn group_names_resolve_in_order_with_gaps() {
        let mesh = mock::MockMesh::default();
        mesh.seed_group("Test", "All");
        mesh.seed_group("meow", "engineering");

        let ids = group_names_to_ids(
            &mesh,
            &["engineering".into(), "missing".into(), "All".into()],
        )
        .await
        .unwrap();
        assert_eq!(ids, vec!["meow".to_string(), String::new(), "Test".into()]);
    }
}
