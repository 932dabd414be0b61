use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use k8s_openapi::api::core::v1::{Secret, SecretKeySelector, Volume, VolumeMount};
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::controller::Action,
    CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use tracing::*;
use uuid::Uuid;

use super::Context;
use crate::conditions::{conditions_equal, Conditions, NBCondition, CONDITION_READY};
use crate::util::DEFAULT_REQUEUE;
use crate::{Error, Result};
use operator_derive::Conditions;

pub static SETUP_KEY_MANAGER_NAME: &str = "nbsetupkey-controller";

/// Pod annotation binding a workload to a named NBSetupKey.
pub static SETUP_KEY_ANNOTATION: &str = "netbird.io/setup-key";
pub static EXTRA_DNS_LABELS_ANNOTATION: &str = "netbird.io/extra-dns-labels";

/// Reverse index `namespace/secret-name` -> NBSetupKey namespaced name, so
/// Secret watch events enqueue the right CR. Rebuilt from the first
/// reconcile of each NBSetupKey after a restart.
static REFERENCED_SECRETS: LazyLock<RwLock<HashMap<String, (String, String)>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "netbird.io",
    version = "v1",
    kind = "NBSetupKey",
    namespaced,
    shortname = "nbsk",
    doc = "NBSetupKey references a Secret holding a NetBird setup key for pod injection",
    printcolumn = r#"{"name":"Ready","jsonPath":".status.conditions[?(@.type==\"Ready\")].status","type":"string"}"#,
    status = "NBSetupKeyStatus"
)]
pub struct NBSetupKeySpec {
    /// Secret and key containing the setup key material
    pub secret_key_ref: SecretKeySelector,
    /// Override of the operator-wide management URL
    #[serde(default, rename = "managementURL")]
    pub management_url: String,
    /// Additional volumes for the injected client container
    pub volumes: Option<Vec<Volume>>,
    /// Additional volume mounts for the injected client container
    pub volume_mounts: Option<Vec<VolumeMount>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Conditions)]
#[serde(rename_all = "camelCase")]
pub struct NBSetupKeyStatus {
    pub conditions: Option<Vec<NBCondition>>,
}

impl NBSetupKeyStatus {
    pub fn equal(&self, other: &Self) -> bool {
        conditions_equal(&self.conditions, &other.conditions)
    }
}

/// Validate the referenced secret: both ref halves set, the secret present,
/// the key present, and the value a UUID.
pub(crate) fn validate_setup_key(
    spec: &NBSetupKeySpec,
    secret: Option<&Secret>,
) -> std::result::Result<(), (&'static str, &'static str)> {
    if spec.secret_key_ref.name.is_empty() || spec.secret_key_ref.key.is_empty() {
        return Err((
            "InvalidConfig",
            "secretKeyRef must contain both secret name and secret key.",
        ));
    }

    let Some(secret) = secret else {
        return Err(("SecretNotExists", "Referenced secret does not exist"));
    };

    let Some(value) = secret
        .data
        .as_ref()
        .and_then(|d| d.get(&spec.secret_key_ref.key))
    else {
        return Err(("SecretKeyNotExists", "Referenced secret key does not exist"));
    };

    let parsed = std::str::from_utf8(&value.0)
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok());
    if parsed.is_none() {
        return Err((
            "InvalidSetupKey",
            "Referenced secret is not a valid SetupKey",
        ));
    }

    Ok(())
}

/// Record which Secret this CR points at, evicting any stale entry left by
/// a renamed reference.
pub fn update_referenced_secret(setup_key: &NBSetupKey) {
    let me = (
        setup_key.namespace().unwrap_or_default(),
        setup_key.name_any(),
    );
    let mut index = REFERENCED_SECRETS.write().unwrap();
    index.retain(|_, v| v != &me);
    if !setup_key.spec.secret_key_ref.name.is_empty() {
        index.insert(
            format!("{}/{}", me.0, setup_key.spec.secret_key_ref.name),
            me,
        );
    }
}

/// The NBSetupKey registered for a Secret, if any.
pub fn setup_key_for_secret(namespace: &str, name: &str) -> Option<(String, String)> {
    REFERENCED_SECRETS
        .read()
        .unwrap()
        .get(&format!("{namespace}/{name}"))
        .cloned()
}

impl NBSetupKey {
    /// True when the Ready condition reports True.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == CONDITION_READY && c.status == "True")
            })
            .unwrap_or(false)
    }

    pub async fn reconcile(&self, ctx: &Context) -> Result<Action> {
        let ns = self.namespace().unwrap();

        update_referenced_secret(self);

        let secret = if self.spec.secret_key_ref.name.is_empty() {
            None
        } else {
            let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
            api.get_opt(&self.spec.secret_key_ref.name)
                .await
                .map_err(Error::KubeError)?
        };

        let previous = self.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        match validate_setup_key(&self.spec, secret.as_ref()) {
            Ok(()) => status.set_ready(true, "", None),
            Err((reason, message)) => {
                warn!("invalid NBSetupKey {}/{}: {}", ns, self.name_any(), message);
                status.set_ready(false, reason, Some(message));
            }
        }

        if !status.equal(&previous) {
            let api: Api<NBSetupKey> = Api::namespaced(ctx.client.clone(), &ns);
            api.patch_status(
                &self.name_any(),
                &PatchParams::apply(SETUP_KEY_MANAGER_NAME),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map_err(Error::KubeError)?;
        }

        Ok(Action::requeue(DEFAULT_REQUEUE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn spec(secret: &str, key: &str) -> NBSetupKeySpec {
        NBSetupKeySpec {
            secret_key_ref: SecretKeySelector {
                name: secret.into(),
                key: key.into(),
                ..SecretKeySelector::default()
            },
            management_url: String::new(),
            volumes: None,
            volume_mounts: None,
        }
    }

    fn secret_with(key: &str, value: &[u8]) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(key.to_string(), ByteString(value.to_vec()))])),
            ..Secret::default()
        }
    }

    #[test]
    fn missing_ref_halves_are_invalid_config() {
        assert_eq!(
            validate_setup_key(&spec("", "setupKey"), None).unwrap_err().0,
            "InvalidConfig"
        );
        assert_eq!(
            validate_setup_key(&spec("secret", ""), None).unwrap_err().0,
            "InvalidConfig"
        );
    }

    #[test]
    fn missing_secret_and_key_have_distinct_reasons() {
        let s = spec("secret", "setupKey");
        assert_eq!(validate_setup_key(&s, None).unwrap_err().0, "SecretNotExists");
        let wrong_key = secret_with("otherKey", b"whatever");
        assert_eq!(
            validate_setup_key(&s, Some(&wrong_key)).unwrap_err().0,
            "SecretKeyNotExists"
        );
    }

    #[test]
    fn non_uuid_values_are_rejected() {
        let s = spec("secret", "setupKey");
        let bad = secret_with("setupKey", b"not-a-uuid");
        assert_eq!(
            validate_setup_key(&s, Some(&bad)).unwrap_err().0,
            "InvalidSetupKey"
        );
        let binary = secret_with("setupKey", &[0xff, 0xfe]);
        assert_eq!(
            validate_setup_key(&s, Some(&binary)).unwrap_err().0,
            "InvalidSetupKey"
        );
    }

    #[test]
    fn uuid_value_is_ready() {
        let s = spec("secret", "setupKey");
        let good = secret_with("setupKey", b"4f7a9c12-3b44-4c89-9d1e-8a2b5c6d7e8f");
        assert!(validate_setup_key(&s, Some(&good)).is_ok());
    }

    #[test]
    fn reverse_index_tracks_renamed_references() {
        let mut sk = NBSetupKey::new("binder", spec("first-secret", "setupKey"));
        sk.metadata.namespace = Some("team".into());

        update_referenced_secret(&sk);
        assert_eq!(
            setup_key_for_secret("team", "first-secret"),
            Some(("team".into(), "binder".into()))
        );

        sk.spec.secret_key_ref.name = "second-secret".into();
        update_referenced_secret(&sk);
        assert_eq!(setup_key_for_secret("team", "first-secret"), None);
        assert_eq!(
            setup_key_for_secret("team", "second-secret"),
            Some(("team".into(), "binder".into()))
        );
    }

    #[test]
    fn readiness_reads_the_ready_condition() {
        let mut sk = NBSetupKey::new("k", spec("s", "setupKey"));
        assert!(!sk.is_ready());
        let mut status = NBSetupKeyStatus::default();
        status.set_ready(true, "", None);
        sk.status = Some(status);
        assert!(sk.is_ready());
        let mut status = NBSetupKeyStatus::default();
        status.set_ready(false, "SecretNotExists", None);
        sk.status = Some(status);
        assert!(!sk.is_ready());
    }
}
