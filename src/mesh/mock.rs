//! Scripted in-memory management API used by reconciler unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::*;
use super::{MeshApi, MeshError};

#[derive(Default)]
pub struct MockState {
    pub groups: Vec<Group>,
    pub created_groups: Vec<GroupRequest>,
    pub deleted_groups: Vec<String>,

    pub created_policies: Vec<(String, PolicyRequest)>,
    pub updated_policies: Vec<(String, PolicyRequest)>,
    pub deleted_policies: Vec<String>,

    pub networks: Vec<Network>,
    pub deleted_networks: Vec<String>,

    pub resources: HashMap<String, NetworkResource>,
    pub created_resources: Vec<(String, NetworkResourceRequest)>,
    pub updated_resources: Vec<(String, NetworkResourceRequest)>,
    pub deleted_resources: Vec<String>,

    pub routers: Vec<NetworkRouter>,
    pub created_routers: Vec<(String, NetworkRouterRequest)>,
    pub updated_routers: Vec<(String, NetworkRouterRequest)>,
    pub deleted_routers: Vec<String>,

    pub setup_keys: HashMap<String, SetupKey>,
    pub created_setup_keys: Vec<CreateSetupKeyRequest>,
    pub deleted_setup_keys: Vec<String>,

    errors: HashMap<&'static str, String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MockMesh {
    state: Mutex<MockState>,
}

impl MockMesh {
    pub fn seed_group(&self, id: &str, name: &str) {
        self.state.lock().unwrap().groups.push(Group {
            id: id.into(),
            name: name.into(),
        });
    }

    pub fn seed_network(&self, id: &str, name: &str) {
        self.state.lock().unwrap().networks.push(Network {
            id: id.into(),
            name: name.into(),
        });
    }

    pub fn seed_resource(&self, resource: NetworkResource) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(resource.id.clone(), resource);
    }

    pub fn seed_router(&self, router: NetworkRouter) {
        self.state.lock().unwrap().routers.push(router);
    }

    pub fn seed_setup_key(&self, key: SetupKey) {
        self.state.lock().unwrap().setup_keys.insert(key.id.clone(), key);
    }

    /// Make the named operation fail with an API error body.
    pub fn fail_with(&self, op: &'static str, msg: &str) {
        self.state.lock().unwrap().errors.insert(op, msg.into());
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&MockState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    fn check(state: &MockState, op: &'static str) -> Result<(), MeshError> {
        match state.errors.get(op) {
            Some(msg) => Err(MeshError::Api(msg.clone())),
            None => Ok(()),
        }
    }

    fn next_id(state: &mut MockState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

#[async_trait]
impl MeshApi for MockMesh {
    async fn groups_list(&self) -> Result<Vec<Group>, MeshError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "groups_list")?;
        Ok(state.groups.clone())
    }

    async fn groups_create(&self, req: GroupRequest) -> Result<Group, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "groups_create")?;
        let group = Group {
            id: Self::next_id(&mut state, "group"),
            name: req.name.clone(),
        };
        state.created_groups.push(req);
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn groups_delete(&self, id: &str) -> Result<(), MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "groups_delete")?;
        state.groups.retain(|g| g.id != id);
        state.deleted_groups.push(id.into());
        Ok(())
    }

    async fn policies_create(&self, req: PolicyRequest) -> Result<Policy, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "policies_create")?;
        let id = Self::next_id(&mut state, "policy");
        let policy = Policy {
            id: Some(id.clone()),
            name: req.name.clone(),
        };
        state.created_policies.push((id, req));
        Ok(policy)
    }

    async fn policies_update(&self, id: &str, req: PolicyRequest) -> Result<Policy, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "policies_update")?;
        let policy = Policy {
            id: Some(id.into()),
            name: req.name.clone(),
        };
        state.updated_policies.push((id.into(), req));
        Ok(policy)
    }

    async fn policies_delete(&self, id: &str) -> Result<(), MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "policies_delete")?;
        state.deleted_policies.push(id.into());
        Ok(())
    }

    async fn networks_list(&self) -> Result<Vec<Network>, MeshError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "networks_list")?;
        Ok(state.networks.clone())
    }

    async fn networks_create(&self, req: NetworkRequest) -> Result<Network, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "networks_create")?;
        let network = Network {
            id: Self::next_id(&mut state, "network"),
            name: req.name,
        };
        state.networks.push(network.clone());
        Ok(network)
    }

    async fn networks_delete(&self, id: &str) -> Result<(), MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "networks_delete")?;
        state.networks.retain(|n| n.id != id);
        state.deleted_networks.push(id.into());
        Ok(())
    }

    async fn network_resource_get(
        &self,
        _network_id: &str,
        id: &str,
    ) -> Result<NetworkResource, MeshError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "network_resource_get")?;
        state
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| MeshError::Api("resource not found".into()))
    }

    async fn network_resource_create(
        &self,
        network_id: &str,
        req: NetworkResourceRequest,
    ) -> Result<NetworkResource, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "network_resource_create")?;
        let resource = NetworkResource {
            id: Self::next_id(&mut state, "resource"),
            name: req.name.clone(),
            description: req.description.clone(),
            address: req.address.clone(),
            enabled: req.enabled,
            groups: req
                .groups
                .iter()
                .map(|id| GroupMinimum {
                    id: id.clone(),
                    name: id.clone(),
                })
                .collect(),
        };
        state.resources.insert(resource.id.clone(), resource.clone());
        state.created_resources.push((network_id.into(), req));
        Ok(resource)
    }

    async fn network_resource_update(
        &self,
        network_id: &str,
        id: &str,
        req: NetworkResourceRequest,
    ) -> Result<NetworkResource, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "network_resource_update")?;
        let resource = NetworkResource {
            id: id.into(),
            name: req.name.clone(),
            description: req.description.clone(),
            address: req.address.clone(),
            enabled: req.enabled,
            groups: req
                .groups
                .iter()
                .map(|gid| GroupMinimum {
                    id: gid.clone(),
                    name: gid.clone(),
                })
                .collect(),
        };
        state.resources.insert(id.into(), resource.clone());
        state.updated_resources.push((network_id.into(), req));
        Ok(resource)
    }

    async fn network_resource_delete(&self, _network_id: &str, id: &str) -> Result<(), MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "network_resource_delete")?;
        state.resources.remove(id);
        state.deleted_resources.push(id.into());
        Ok(())
    }

    async fn network_routers_list(
        &self,
        _network_id: &str,
    ) -> Result<Vec<NetworkRouter>, MeshError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "network_routers_list")?;
        Ok(state.routers.clone())
    }

    async fn network_router_create(
        &self,
        network_id: &str,
        req: NetworkRouterRequest,
    ) -> Result<NetworkRouter, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "network_router_create")?;
        let router = NetworkRouter {
            id: Self::next_id(&mut state, "router"),
            enabled: req.enabled,
            masquerade: req.masquerade,
            metric: req.metric,
            peer_groups: req.peer_groups.clone(),
        };
        state.routers.push(router.clone());
        state.created_routers.push((network_id.into(), req));
        Ok(router)
    }

    async fn network_router_update(
        &self,
        network_id: &str,
        id: &str,
        req: NetworkRouterRequest,
    ) -> Result<NetworkRouter, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "network_router_update")?;
        let router = NetworkRouter {
            id: id.into(),
            enabled: req.enabled,
            masquerade: req.masquerade,
            metric: req.metric,
            peer_groups: req.peer_groups.clone(),
        };
        if let Some(existing) = state.routers.iter_mut().find(|r| r.id == id) {
            *existing = router.clone();
        }
        state.updated_routers.push((network_id.into(), req));
        Ok(router)
    }

    async fn network_router_delete(&self, _network_id: &str, id: &str) -> Result<(), MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "network_router_delete")?;
        state.routers.retain(|r| r.id != id);
        state.deleted_routers.push(id.into());
        Ok(())
    }

    async fn setup_keys_create(&self, req: CreateSetupKeyRequest) -> Result<SetupKey, MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "setup_keys_create")?;
        let id = Self::next_id(&mut state, "setupkey");
        let key = SetupKey {
            id: id.clone(),
            key: format!("raw-{id}"),
            name: req.name.clone(),
            revoked: false,
        };
        state.setup_keys.insert(id, key.clone());
        state.created_setup_keys.push(req);
        Ok(key)
    }

    async fn setup_keys_get(&self, id: &str) -> Result<SetupKey, MeshError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "setup_keys_get")?;
        state
            .setup_keys
            .get(id)
            .cloned()
            .ok_or_else(|| MeshError::Api("setup key not found".into()))
    }

    async fn setup_keys_delete(&self, id: &str) -> Result<(), MeshError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "setup_keys_delete")?;
        state.setup_keys.remove(id);
        state.deleted_setup_keys.push(id.into());
        Ok(())
    }
}
