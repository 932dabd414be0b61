use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::*;

use super::types::*;
use super::{MeshApi, MeshError};

/// Bearer-token HTTP client for the management API.
pub struct MeshClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl MeshClient {
    pub fn new(management_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{}/api", management_url.trim_end_matches('/')),
            token: api_key.to_string(),
        }
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, MeshError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("management API request: {} {}", method, url);
        let mut req = self
            .http
            .request(method, &url)
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        // Error bodies are plain strings; callers classify by substring.
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let msg = if body.is_empty() && status == StatusCode::NOT_FOUND {
            "not found".to_string()
        } else {
            body
        };
        Err(MeshError::Api(msg))
    }

    async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, MeshError> {
        let resp = self.send(method, path, body).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn request_no_content(
        &self,
        method: Method,
        path: &str,
    ) -> Result<(), MeshError> {
        self.send(method, path, None::<&()>).await?;
        Ok(())
    }
}

#[async_trait]
impl MeshApi for MeshClient {
    async fn groups_list(&self) -> Result<Vec<Group>, MeshError> {
        self.request(Method::GET, "/groups", None::<&()>).await
    }

    async fn groups_create(&self, req: GroupRequest) -> Result<Group, MeshError> {
        self.request(Method::POST, "/groups", Some(&req)).await
    }

    async fn groups_delete(&self, id: &str) -> Result<(), MeshError> {
        self.request_no_content(Method::DELETE, &format!("/groups/{id}"))
            .await
    }

    async fn policies_create(&self, req: PolicyRequest) -> Result<Policy, MeshError> {
        self.request(Method::POST, "/policies", Some(&req)).await
    }

    async fn policies_update(&self, id: &str, req: PolicyRequest) -> Result<Policy, MeshError> {
        self.request(Method::PUT, &format!("/policies/{id}"), Some(&req))
            .await
    }

    async fn policies_delete(&self, id: &str) -> Result<(), MeshError> {
        self.request_no_content(Method::DELETE, &format!("/policies/{id}"))
            .await
    }

    async fn networks_list(&self) -> Result<Vec<Network>, MeshError> {
        self.request(Method::GET, "/networks", None::<&()>).await
    }

    async fn networks_create(&self, req: NetworkRequest) -> Result<Network, MeshError> {
        self.request(Method::POST, "/networks", Some(&req)).await
    }

    async fn networks_delete(&self, id: &str) -> Result<(), MeshError> {
        self.request_no_content(Method::DELETE, &format!("/networks/{id}"))
            .await
    }

    async fn network_resource_get(
        &self,
        network_id: &str,
        id: &str,
    ) -> Result<NetworkResource, MeshError> {
        self.request(
            Method::GET,
            &format!("/networks/{network_id}/resources/{id}"),
            None::<&()>,
        )
        .await
    }

    async fn network_resource_create(
        &self,
        network_id: &str,
        req: NetworkResourceRequest,
    ) -> Result<NetworkResource, MeshError> {
        self.request(
            Method::POST,
            &format!("/networks/{network_id}/resources"),
            Some(&req),
        )
        .await
    }

    async fn network_resource_update(
        &self,
        network_id: &str,
        id: &str,
        req: NetworkResourceRequest,
    ) -> Result<NetworkResource, MeshError> {
        self.request(
            Method::PUT,
            &format!("/networks/{network_id}/resources/{id}"),
            Some(&req),
        )
        .await
    }

    async fn network_resource_delete(&self, network_id: &str, id: &str) -> Result<(), MeshError> {
        self.request_no_content(
            Method::DELETE,
            &format!("/networks/{network_id}/resources/{id}"),
        )
        .await
    }

    async fn network_routers_list(&self, network_id: &str) -> Result<Vec<NetworkRouter>, MeshError> {
        self.request(
            Method::GET,
            &format!("/networks/{network_id}/routers"),
            None::<&()>,
        )
        .await
    }

    async fn network_router_create(
        &self,
        network_id: &str,
        req: NetworkRouterRequest,
    ) -> Result<NetworkRouter, MeshError> {
        self.request(
            Method::POST,
            &format!("/networks/{network_id}/routers"),
            Some(&req),
        )
        .await
    }

    async fn network_router_update(
        &self,
        network_id: &str,
        id: &str,
        req: NetworkRouterRequest,
    ) -> Result<NetworkRouter, MeshError> {
        self.request(
            Method::PUT,
            &format!("/networks/{network_id}/routers/{id}"),
            Some(&req),
        )
        .await
    }

    async fn network_router_delete(&self, network_id: &str, id: &str) -> Result<(), MeshError> {
        self.request_no_content(
            Method::DELETE,
            &format!("/networks/{network_id}/routers/{id}"),
        )
        .await
    }

    async fn setup_keys_create(&self, req: CreateSetupKeyRequest) -> Result<SetupKey, MeshError> {
        self.request(Method::POST, "/setup-keys", Some(&req)).await
    }

    async fn setup_keys_get(&self, id: &str) -> Result<SetupKey, MeshError> {
        self.request(Method::GET, &format!("/setup-keys/{id}"), None::<&()>)
            .await
    }

    async fn setup_keys_delete(&self, id: &str) -> Result<(), MeshError> {
        self.request_no_content(Method::DELETE, &format!("/setup-keys/{id}"))
            .await
    }
}
