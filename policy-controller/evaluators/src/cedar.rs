use anyhow::{bail, Context as _, Result};
use authpolicy_controller_core::{Authorize, PipelineState, Verdict};
use cedar_policy::{
    Authorizer, Context, Decision, Entities, EntityId, EntityTypeName, EntityUid, ParseErrors,
    PolicySet, Request,
};
use serde_json::{Map, Value};

/// Authorizes requests with an inline Cedar policy set.
///
/// Requests are presented to Cedar as `Identity::"<sub>"` performing `Action::"<METHOD>"` on
/// `Resource::"<path>"`, with the authorization JSON as the request context.
pub struct CedarPolicy {
    policies: PolicySet,
    authorizer: Authorizer,
    principal_type: EntityTypeName,
    action_type: EntityTypeName,
    resource_type: EntityTypeName,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid policy: {0}")]
pub struct InvalidPolicy(#[from] ParseErrors);

const ANONYMOUS: &str = "anonymous";

// === impl CedarPolicy ===

impl CedarPolicy {
    pub fn new(text: &str) -> Result<Self, InvalidPolicy> {
        Ok(Self {
            policies: text.parse()?,
            authorizer: Authorizer::new(),
            principal_type: "Identity".parse()?,
            action_type: "Action".parse()?,
            resource_type: "Resource".parse()?,
        })
    }

    fn uid(&self, ty: &EntityTypeName, id: &str) -> EntityUid {
        EntityUid::from_type_name_and_id(ty.clone(), EntityId::new(id))
    }

    fn request(&self, state: &PipelineState) -> Result<Request> {
        let req = state.request();
        let subject = state
            .identity()
            .and_then(|id| id.get("sub"))
            .and_then(Value::as_str)
            .unwrap_or(ANONYMOUS);

        let context = Context::from_json_value(context_json(state.authorization_json()), None)
            .context("failed to build policy context")?;

        Request::new(
            self.uid(&self.principal_type, subject),
            self.uid(&self.action_type, &req.method.to_ascii_uppercase()),
            self.uid(&self.resource_type, req.path_only()),
            context,
            None,
        )
        .context("failed to build policy request")
    }
}

#[async_trait::async_trait]
impl Authorize for CedarPolicy {
    async fn call(&self, state: &PipelineState) -> Result<Verdict> {
        let request = self.request(state)?;
        let response = self
            .authorizer
            .is_authorized(&request, &self.policies, &Entities::empty());

        let errors = response
            .diagnostics()
            .errors()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        tracing::trace!(decision = ?response.decision(), ?errors, "Evaluated policy");

        match response.decision() {
            Decision::Allow => Ok(Verdict::Allow),
            Decision::Deny if !errors.is_empty() => {
                bail!("policy evaluation failed: {}", errors.join("; "))
            }
            Decision::Deny => Ok(Verdict::Deny(Some("denied by policy".to_string()))),
        }
    }
}

/// Cedar records hold neither nulls nor floating point numbers, so nulls are dropped and
/// non-integral numbers are rendered as strings.
fn context_json(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, context_json(v)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(context_json)
                .collect(),
        ),
        Value::Number(n) if n.as_i64().is_none() => Value::String(n.to_string()),
        v => v,
    }
}
