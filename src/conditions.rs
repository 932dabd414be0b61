use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

pub use operator_derive::Conditions as DeriveConditions;

/// The single condition type used across all NetBird statuses.
pub static CONDITION_READY: &str = "Ready";

/// Kubernetes-style condition carried in every NetBird status.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NBCondition {
    /// Type of the condition; `Ready` is the only type written by the operator
    #[serde(rename = "type")]
    pub type_: String,
    /// True, False or Unknown
    pub status: String,
    /// Last time the condition was evaluated
    pub last_probe_time: Option<Time>,
    /// Last time the condition status changed
    pub last_transition_time: Option<Time>,
    /// Machine-readable, CamelCase reason for the last transition
    pub reason: Option<String>,
    /// Human-readable detail for the last transition
    pub message: Option<String>,
}

// A trait for types that expose a `conditions` field
pub trait Conditions {
    // Accessors for the underlying conditions vector
    fn conditions(&self) -> &Option<Vec<NBCondition>>;
    fn conditions_mut(&mut self) -> &mut Option<Vec<NBCondition>>;

    /// Upsert the Ready condition. The probe time always moves; the
    /// transition time only moves when the boolean status flips.
    fn set_ready(&mut self, status: bool, reason: &str, message: Option<&str>) {
        let cond = make_condition(CONDITION_READY, status, reason, message);
        self.upsert_condition(cond);
    }

    // Clear all conditions
    fn clear_conditions(&mut self) {
        *self.conditions_mut() = None;
    }

    // Insert or update a condition in-place, preserving last_transition_time if status is unchanged
    fn upsert_condition(&mut self, new_cond: NBCondition) {
        let target = self.conditions_mut();
        match target {
            Some(vec) => {
                if let Some(pos) = vec.iter().position(|c| c.type_ == new_cond.type_) {
                    if vec[pos].status != new_cond.status {
                        vec[pos] = new_cond;
                    } else {
                        let last_transition_time = vec[pos].last_transition_time.clone();
                        vec[pos].reason = new_cond.reason;
                        vec[pos].message = new_cond.message;
                        vec[pos].last_probe_time = new_cond.last_probe_time;
                        vec[pos].last_transition_time = last_transition_time;
                    }
                } else {
                    vec.push(new_cond);
                }
            }
            None => {
                *target = Some(vec![new_cond]);
            }
        }
    }
}

// Create a condition with common fields populated
pub fn make_condition(type_: &str, status: bool, reason: &str, message: Option<&str>) -> NBCondition {
    let now = Time(chrono::Utc::now());
    NBCondition {
        type_: type_.to_string(),
        status: if status {
            "True".to_string()
        } else {
            "False".to_string()
        },
        last_probe_time: Some(now.clone()),
        last_transition_time: Some(now),
        reason: (!reason.is_empty()).then(|| reason.to_string()),
        message: message.map(|m| m.to_string()),
    }
}

/// Semantic equality for condition lists: timestamps are bookkeeping and do
/// not count as drift, everything else does.
pub fn conditions_equal(a: &Option<Vec<NBCondition>>, b: &Option<Vec<NBCondition>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|(c, d)| {
                    c.type_ == d.type_
                        && c.status == d.status
                        && c.reason == d.reason
                        && c.message == d.message
                })
        }
        _ => false,
    }
}
