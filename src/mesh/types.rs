//! Wire types for the management API. Field names follow the JSON the
//! service speaks (snake_case); only the fields the operator touches are
//! modelled.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

pub static POLICY_ACTION_ACCEPT: &str = "accept";
pub static SETUP_KEY_TYPE_REUSABLE: &str = "reusable";
/// Description stamped on every remote object the operator manages.
pub static MANAGED_DESCRIPTION: &str = "Created by kubernetes-operator";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Group {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GroupRequest {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Policy {
    pub id: Option<String>,
    pub name: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PolicyRequest {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rules: Vec<PolicyRuleUpdate>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PolicyRuleUpdate {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub action: String,
    pub protocol: String,
    pub bidirectional: bool,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub ports: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Network {
    pub id: String,
    pub name: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NetworkRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GroupMinimum {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NetworkResource {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub address: String,
    pub enabled: bool,
    pub groups: Vec<GroupMinimum>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NetworkResourceRequest {
    pub name: String,
    pub description: Option<String>,
    pub address: String,
    pub enabled: bool,
    pub groups: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NetworkRouter {
    pub id: String,
    pub enabled: bool,
    pub masquerade: bool,
    pub metric: u32,
    pub peer_groups: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NetworkRouterRequest {
    pub enabled: bool,
    pub masquerade: bool,
    pub metric: u32,
    pub peer_groups: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SetupKey {
    pub id: String,
    /// Raw key material; only present on create responses
    #[serde(default)]
    pub key: String,
    pub name: String,
    pub revoked: bool,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CreateSetupKeyRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub auto_groups: Vec<String>,
    pub ephemeral: Option<bool>,
}
