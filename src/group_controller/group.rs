use std::time::Duration;

use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
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
use crate::events_helper::{emit_info, emit_warn};
use crate::mesh::{Group, GroupRequest};
use crate::util::{without, DEFAULT_REQUEUE};
use crate::{Error, Result};
use operator_derive::Conditions;

pub static GROUP_MANAGER_NAME: &str = "nbgroup-controller";
pub static GROUP_CLEANUP_FINALIZER: &str = "netbird.io/group-cleanup";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "netbird.io",
    version = "v1",
    kind = "NBGroup",
    namespaced,
    shortname = "nbgrp",
    doc = "NBGroup mirrors a peer group on the NetBird management API",
    printcolumn = r#"{"name":"Group ID","jsonPath":".status.groupID","type":"string"}"#,
    printcolumn = r#"{"name":"Ready","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","type":"string"}"#,
    status = "NBGroupStatus"
)]
pub struct NBGroupSpec {
    /// Group name on the management API. Immutable once set.
    pub name: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Conditions)]
#[serde(rename_all = "camelCase")]
pub struct NBGroupStatus {
    /// Remote handle of the group; shared between all CRs naming this group
    #[serde(rename = "groupID")]
    pub group_id: Option<String>,
    pub conditions: Option<Vec<NBCondition>>,
}

impl NBGroupStatus {
    pub fn equal(&self, other: &Self) -> bool {
        self.group_id == other.group_id && conditions_equal(&self.conditions, &other.conditions)
    }
}

/// What the remote group list means for a CR with the given status id.
#[derive(Debug, PartialEq)]
pub(crate) enum RemoteGroupState {
    /// No remote group and no recorded id: create one
    Create,
    /// A group with our name already exists: take its id
    Adopt(String),
    /// Recorded id no longer listed: remote deletion out-of-band
    Gone,
    /// Listed under a different id: remote delete+recreate, follow the new id
    Rebind(String),
    InSync,
}

pub(crate) fn classify_remote(status_id: Option<&str>, remote: Option<&Group>) -> RemoteGroupState {
    match (status_id, remote) {
        (None, None) => RemoteGroupState::Create,
        (None, Some(g)) => RemoteGroupState::Adopt(g.id.clone()),
        (Some(_), None) => RemoteGroupState::Gone,
        (Some(id), Some(g)) if id != g.id => RemoteGroupState::Rebind(g.id.clone()),
        _ => RemoteGroupState::InSync,
    }
}

impl NBGroup {
    /// Drive the remote group to match this CR, adopting same-named groups
    /// instead of duplicating them.
    pub async fn sync_remote(&self, ctx: &Context, status: &mut NBGroupStatus) -> Result<Action> {
        let groups = ctx.mesh.groups_list().await.map_err(|e| {
            status.set_ready(false, "APIError", Some(&format!("error listing groups: {e}")));
            Error::MeshError(e)
        })?;
        let remote = groups.iter().find(|g| g.name == self.spec.name);

        match classify_remote(status.group_id.as_deref(), remote) {
            RemoteGroupState::Create => {
                info!("Creating group \"{}\" on the management API", self.spec.name);
                let group = ctx
                    .mesh
                    .groups_create(GroupRequest {
                        name: self.spec.name.clone(),
                    })
                    .await
                    .map_err(|e| {
                        status.set_ready(
                            false,
                            "APIError",
                            Some(&format!("error creating group: {e}")),
                        );
                        Error::MeshError(e)
                    })?;
                emit_info(
                    &ctx.recorder,
                    self,
                    "GroupCreated",
                    "Created",
                    Some(format!("Created group `{}` ({})", self.spec.name, group.id)),
                )
                .await;
                status.group_id = Some(group.id);
                status.set_ready(true, "Ready", None);
            }
            RemoteGroupState::Adopt(id) => {
                info!("Adopting group \"{}\" with id {}", self.spec.name, id);
                status.group_id = Some(id);
                status.set_ready(true, "Ready", None);
            }
            RemoteGroupState::Gone => {
                info!("Group \"{}\" was deleted out-of-band", self.spec.name);
                status.group_id = None;
                status.set_ready(
                    false,
                    "GroupGone",
                    Some("Group was deleted from the management API"),
                );
                return Ok(Action::requeue(Duration::ZERO));
            }
            RemoteGroupState::Rebind(id) => {
                // Either delete+recreate upstream or a naming conflict;
                // either way the listed id wins.
                status.group_id = Some(id);
                status.set_ready(true, "Ready", None);
            }
            RemoteGroupState::InSync => {
                status.set_ready(true, "Ready", None);
            }
        }

        Ok(Action::requeue(DEFAULT_REQUEUE))
    }

    /// Teardown half of the `group-cleanup` finalizer. A `linked` answer
    /// means the remote group is still referenced; the finalizer is only
    /// released locally when a sibling CR tracks the same remote id.
    pub async fn handle_delete(&self, ctx: &Context, status: &mut NBGroupStatus) -> Result<Action> {
        let Some(group_id) = status.group_id.clone() else {
            self.drop_cleanup_finalizer(ctx).await?;
            return Ok(Action::await_change());
        };

        match ctx.mesh.groups_delete(&group_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_linked() => {
                info!("group {} still linked on the management API", group_id);
                let api: Api<NBGroup> = Api::all(ctx.client.clone());
                let groups = api
                    .list(&ListParams::default())
                    .await
                    .map_err(Error::KubeError)?;
                let shared_elsewhere = groups.items.iter().any(|g| {
                    g.uid() != self.uid()
                        && g.status.as_ref().and_then(|s| s.group_id.as_deref())
                            == Some(group_id.as_str())
                });
                if !shared_elsewhere {
                    // A user-made group or a still-deleting referrer; retry later
                    emit_warn(
                        &ctx.recorder,
                        self,
                        "GroupLinked",
                        "Deleting",
                        Some(format!("Group `{}` is still linked upstream", self.spec.name)),
                    )
                    .await;
                    return Err(Error::MeshError(e));
                }
                info!("group {} is owned by another NBGroup, releasing", group_id);
            }
            Err(e) => {
                status.set_ready(false, "APIError", Some(&format!("error deleting group: {e}")));
                return Err(Error::MeshError(e));
            }
        }

        self.drop_cleanup_finalizer(ctx).await?;
        Ok(Action::await_change())
    }

    async fn drop_cleanup_finalizer(&self, ctx: &Context) -> Result<()> {
        if !self.finalizers().iter().any(|f| f == GROUP_CLEANUP_FINALIZER) {
            return Ok(());
        }
        let api: Api<NBGroup> =
            Api::namespaced(ctx.client.clone(), &self.namespace().unwrap_or_default());
        let finalizers = without(self.finalizers(), &GROUP_CLEANUP_FINALIZER.to_string());
        api.patch(
            &self.name_any(),
            &PatchParams::apply(GROUP_MANAGER_NAME),
            &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
        )
        .await
        .map_err(Error::KubeError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Group;

    fn remote(id: &str, name: &str) -> Group {
        Group {
            id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn absent_group_is_created() {
        assert_eq!(classify_remote(None, None), RemoteGroupState::Create);
    }

    #[test]
    fn same_named_group_is_adopted() {
        let g = remote("Test", "test-resource");
        assert_eq!(
            classify_remote(None, Some(&g)),
            RemoteGroupState::Adopt("Test".into())
        );
    }

    #[test]
    fn vanished_group_is_reported_gone() {
        assert_eq!(classify_remote(Some("Toast"), None), RemoteGroupState::Gone);
    }

    #[test]
    fn changed_id_rebinds() {
        let g = remote("new-id", "test-resource");
        assert_eq!(
            classify_remote(Some("old-id"), Some(&g)),
            RemoteGroupState::Rebind("new-id".into())
        );
        assert_eq!(
            classify_remote(Some("new-id"), Some(&g)),
            RemoteGroupState::InSync
        );
    }

    #[test]
    fn status_comparator_tracks_id_and_conditions() {
        let mut a = NBGroupStatus::default();
        let mut b = NBGroupStatus::default();
        assert!(a.equal(&b));
        a.group_id = Some("x".into());
        assert!(!a.equal(&b));
        b.group_id = Some("x".into());
        a.set_ready(true, "Ready", None);
        b.set_ready(true, "Ready", None);
        assert!(a.equal(&b));
    }
}
