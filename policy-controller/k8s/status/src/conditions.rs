use authpolicy_controller_core::ResourceId;
use authpolicy_controller_k8s_api::{AuthConfigStatus, Condition, Patch, Time};
#[cfg(not(test))]
use chrono::Utc;

pub(crate) const READY: &str = "Ready";

const API_VERSION: &str = "authpolicy.io/v1beta1";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    Reconciled,
    HostsCollision,
    InvalidSpec,
}

// === impl Reason ===

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconciled => "Reconciled",
            Self::HostsCollision => "HostsCollision",
            Self::InvalidSpec => "InvalidSpec",
        }
    }
}

/// Every declared host is linked to the policy's pipeline.
pub fn reconciled(generation: Option<i64>, hosts: Vec<String>) -> AuthConfigStatus {
    status(generation, true, hosts, Reason::Reconciled, String::new())
}

/// Some declared hosts are owned by other policies. `hosts` lists those that are linked.
pub fn hosts_collision(
    generation: Option<i64>,
    hosts: Vec<String>,
    collisions: &[(String, ResourceId)],
) -> AuthConfigStatus {
    let message = collisions
        .iter()
        .map(|(host, owner)| format!("host {host} is claimed by {owner}"))
        .collect::<Vec<_>>()
        .join("; ");
    status(generation, false, hosts, Reason::HostsCollision, message)
}

/// The spec could not be translated into a pipeline.
pub fn invalid_spec(
    generation: Option<i64>,
    hosts: Vec<String>,
    message: impl ToString,
) -> AuthConfigStatus {
    status(
        generation,
        false,
        hosts,
        Reason::InvalidSpec,
        message.to_string(),
    )
}

fn status(
    generation: Option<i64>,
    ready: bool,
    hosts: Vec<String>,
    reason: Reason,
    message: String,
) -> AuthConfigStatus {
    #[cfg(not(test))]
    let timestamp = Utc::now();
    #[cfg(test)]
    let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;

    AuthConfigStatus {
        ready,
        hosts,
        conditions: vec![Condition {
            type_: READY.to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            reason: reason.as_str().to_string(),
            message,
            observed_generation: generation,
            last_transition_time: Time(timestamp),
        }],
    }
}

/// Returns the status to write, or `None` if `current` already reflects `desired`.
///
/// Transition times are carried over from `current` for conditions whose status has not changed.
pub fn diff(
    current: Option<&AuthConfigStatus>,
    mut desired: AuthConfigStatus,
) -> Option<AuthConfigStatus> {
    let Some(current) = current else {
        return Some(desired);
    };

    for cond in &mut desired.conditions {
        if let Some(prior) = current
            .conditions
            .iter()
            .find(|c| c.type_ == cond.type_ && c.status == cond.status)
        {
            cond.last_transition_time = prior.last_transition_time.clone();
        }
    }

    if *current == desired {
        return None;
    }
    Some(desired)
}

pub fn make_patch(status: &AuthConfigStatus) -> Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": API_VERSION,
        "kind": "AuthConfig",
        "status": status,
    });
    Patch::Merge(value)
}
