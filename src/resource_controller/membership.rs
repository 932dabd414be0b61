//! Policy membership for NBResources.
//!
//! `spec.policyName` carries comma-separated *logical* names. Each logical
//! name resolves to an actual NBPolicy CR through `status.policyNameMapping`,
//! falling back to a generated policy when nothing matches. The resource is
//! authoritative for membership; policies only reflect it in
//! `status.managedServiceList`.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams, PostParams, ResourceExt},
};
use serde_json::json;
use tracing::*;

use super::{Context, NBResource, NBResourceStatus, RESOURCE_MANAGER_NAME};
use crate::conditions::Conditions;
use crate::policy_controller::{NBPolicy, NBPolicySpec};
use crate::util::{equivalent, split_csv};
use crate::{Error, Result};

/// Deterministic CR name for policies generated on behalf of a resource.
pub fn generated_policy_name(namespace: &str, resource: &str) -> String {
    format!("test-gen-{namespace}-{resource}")
}

impl NBResource {
    /// Reconcile this resource's memberships across every referenced policy:
    /// rotated-away names are withdrawn, new names appended, and mirrored
    /// ports/groups drift bumps `lastUpdatedAt` so the policy controller
    /// recomputes.
    pub(crate) async fn handle_policy_membership(
        &self,
        ctx: &Context,
        group_ids: &[String],
        status: &mut NBResourceStatus,
    ) -> Result<()> {
        let ns = self.namespace().unwrap();
        let nn = format!("{}/{}", ns, self.name_any());

        let desired_logical = split_csv(&self.spec.policy_name);
        let previous_actuals = status
            .policy_name
            .as_deref()
            .map(split_csv)
            .unwrap_or_default();
        let mut mapping = status.policy_name_mapping.clone().unwrap_or_default();

        let mut actuals: Vec<String> = Vec::new();
        for logical in &desired_logical {
            let actual = self.resolve_policy(ctx, logical, &mut mapping).await?;
            if !actuals.contains(&actual) {
                actuals.push(actual);
            }
        }

        let drift = !equivalent(&self.spec.tcp_ports, &status.tcp_ports)
            || !equivalent(&self.spec.udp_ports, &status.udp_ports)
            || !equivalent(group_ids, &status.groups);

        for stale in previous_actuals.iter().filter(|p| !actuals.contains(p)) {
            self.withdraw_from_policy(ctx, stale, &nn).await?;
        }

        let api: Api<NBPolicy> = Api::all(ctx.client.clone());
        for actual in &actuals {
            let Some(policy) = api.get_opt(actual).await.map_err(|e| {
                status.set_ready(
                    false,
                    "internalError",
                    Some(&format!("error getting NBPolicy: {e}")),
                );
                Error::KubeError(e)
            })?
            else {
                // Raced with a concurrent delete; the next pass re-resolves
                warn!("NBPolicy {actual} disappeared during reconcile");
                continue;
            };

            let mut pstatus = policy.status.clone().unwrap_or_default();
            let mut changed = false;
            if !pstatus.managed_service_list.contains(&nn) {
                pstatus.managed_service_list.push(nn.clone());
                changed = true;
            }
            if changed || drift {
                pstatus.last_updated_at = Some(Time(Utc::now()));
                api.patch_status(
                    actual,
                    &PatchParams::apply(RESOURCE_MANAGER_NAME),
                    &Patch::Merge(json!({ "status": pstatus })),
                )
                .await
                .map_err(Error::KubeError)?;
            }
        }

        status.tcp_ports = self.spec.tcp_ports.clone();
        status.udp_ports = self.spec.udp_ports.clone();
        status.groups = group_ids.to_vec();
        status.policy_name = (!actuals.is_empty()).then(|| actuals.join(","));
        status.policy_name_mapping = (!mapping.is_empty()).then_some(mapping);

        Ok(())
    }

    /// Resolve one logical policy name to an NBPolicy CR name, generating a
    /// policy when allowed and nothing matches. The mapping survives spec
    /// edits so a re-added logical name reuses its generated policy.
    async fn resolve_policy(
        &self,
        ctx: &Context,
        logical: &str,
        mapping: &mut BTreeMap<String, String>,
    ) -> Result<String> {
        let api: Api<NBPolicy> = Api::all(ctx.client.clone());

        let candidate = mapping
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string());
        if api.get_opt(&candidate).await.map_err(Error::KubeError)?.is_some() {
            mapping.insert(logical.to_string(), candidate.clone());
            return Ok(candidate);
        }
        if candidate != logical
            && api.get_opt(logical).await.map_err(Error::KubeError)?.is_some()
        {
            mapping.insert(logical.to_string(), logical.to_string());
            return Ok(logical.to_string());
        }

        if !ctx.settings.allow_auto_policies {
            return Err(Error::ValidationError(format!(
                "NBPolicy {logical} not found"
            )));
        }

        let ns = self.namespace().unwrap();
        let generated = generated_policy_name(&ns, &self.name_any());
        if api
            .get_opt(&generated)
            .await
            .map_err(Error::KubeError)?
            .is_none()
        {
            info!("generating NBPolicy {generated} for logical name \"{logical}\"");
            let policy = self.generated_policy(&generated, logical);
            api.create(&PostParams::default(), &policy)
                .await
                .map_err(Error::KubeError)?;
        }
        mapping.insert(logical.to_string(), generated.clone());
        Ok(generated)
    }

    pub(crate) fn generated_policy(&self, name: &str, logical: &str) -> NBPolicy {
        let friendly = self
            .spec
            .policy_friendly_name
            .as_ref()
            .and_then(|m| m.get(logical).cloned())
            .unwrap_or_else(|| logical.to_string());
        NBPolicy::new(
            name,
            NBPolicySpec {
                name: friendly,
                description: format!("Generated for {}", self.spec.name),
                source_groups: self.spec.policy_source_groups.clone(),
                destination_groups: vec![],
                protocols: vec![],
                ports: vec![],
                bidirectional: true,
            },
        )
    }

    /// Remove this resource's entry from a policy's managed-service list.
    pub(crate) async fn withdraw_from_policy(
        &self,
        ctx: &Context,
        policy_name: &str,
        nn: &str,
    ) -> Result<()> {
        let api: Api<NBPolicy> = Api::all(ctx.client.clone());
        let Some(policy) = api.get_opt(policy_name).await.map_err(Error::KubeError)? else {
            return Ok(());
        };

        let mut pstatus = policy.status.clone().unwrap_or_default();
        if !pstatus.managed_service_list.contains(&nn.to_string()) {
            return Ok(());
        }
        pstatus.managed_service_list.retain(|e| e != nn);
        pstatus.last_updated_at = Some(Time(Utc::now()));
        api.patch_status(
            policy_name,
            &PatchParams::apply(RESOURCE_MANAGER_NAME),
            &Patch::Merge(json!({ "status": pstatus })),
        )
        .await
        .map_err(Error::KubeError)?;
        Ok(())
    }
}
