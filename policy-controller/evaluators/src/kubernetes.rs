use anyhow::{anyhow, bail, Context as _, Result};
use authpolicy_controller_core::{Authorize, PipelineState, Selector, Verdict};
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
    SubjectAccessReviewStatus,
};
use kube::api::{Api, PostParams};
use serde_json::Value;
use std::{sync::Arc, time::Duration};

/// Submits access reviews to an external authorizer.
#[async_trait::async_trait]
pub trait ReviewAccess: Send + Sync {
    async fn review(&self, spec: SubjectAccessReviewSpec) -> Result<SubjectAccessReviewStatus>;
}

/// Reviews access with the Kubernetes API server's `SubjectAccessReview` API.
#[derive(Clone)]
pub struct KubeReviewer {
    client: kube::Client,
}

/// Delegates the authorization decision to Kubernetes RBAC.
pub struct SubjectAccessReviewAuthz {
    user: Selector,
    groups: Option<Selector>,
    resource: Option<ResourceTemplate>,
    fail_closed: bool,
    timeout: Duration,
    reviewer: Arc<dyn ReviewAccess>,
}

/// Resource attributes of the review. When no verb is set, the request method is used.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceTemplate {
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub resource: Option<String>,
    pub name: Option<String>,
    pub subresource: Option<String>,
    pub verb: Option<String>,
}

// === impl KubeReviewer ===

impl KubeReviewer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ReviewAccess for KubeReviewer {
    async fn review(&self, spec: SubjectAccessReviewSpec) -> Result<SubjectAccessReviewStatus> {
        let api = Api::<SubjectAccessReview>::all(self.client.clone());
        let review = SubjectAccessReview {
            spec,
            ..Default::default()
        };
        let review = api.create(&PostParams::default(), &review).await?;
        review
            .status
            .ok_or_else(|| anyhow!("review returned without a status"))
    }
}

// === impl SubjectAccessReviewAuthz ===

impl SubjectAccessReviewAuthz {
    pub fn new(user: Selector, reviewer: Arc<dyn ReviewAccess>, timeout: Duration) -> Self {
        Self {
            user,
            groups: None,
            resource: None,
            fail_closed: false,
            timeout,
            reviewer,
        }
    }

    pub fn with_groups(mut self, groups: Selector) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_resource(mut self, resource: ResourceTemplate) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn fail_closed(mut self, fail_closed: bool) -> Self {
        self.fail_closed = fail_closed;
        self
    }

    fn spec(&self, state: &PipelineState) -> Result<SubjectAccessReviewSpec> {
        let doc = state.authorization_json();
        let user = match self.user.resolve(&doc) {
            Some(Value::String(user)) => user.clone(),
            Some(_) => bail!("user selector {} is not a string", self.user),
            None => bail!("user selector {} did not resolve", self.user),
        };
        let groups = match &self.groups {
            None => None,
            Some(sel) => Some(match sel.resolve(&doc) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                Some(Value::String(group)) => vec![group.clone()],
                _ => bail!("groups selector {sel} did not resolve to a list"),
            }),
        };

        let req = state.request();
        let method_verb = req.method.to_ascii_lowercase();
        let (resource_attributes, non_resource_attributes) = match &self.resource {
            Some(tmpl) => {
                let attrs = ResourceAttributes {
                    namespace: tmpl.namespace.clone(),
                    group: tmpl.group.clone(),
                    resource: tmpl.resource.clone(),
                    name: tmpl.name.clone(),
                    subresource: tmpl.subresource.clone(),
                    verb: Some(tmpl.verb.clone().unwrap_or(method_verb)),
                    ..Default::default()
                };
                (Some(attrs), None)
            }
            None => {
                let attrs = NonResourceAttributes {
                    path: Some(req.path_only().to_string()),
                    verb: Some(method_verb),
                };
                (None, Some(attrs))
            }
        };

        Ok(SubjectAccessReviewSpec {
            user: Some(user),
            groups,
            resource_attributes,
            non_resource_attributes,
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl Authorize for SubjectAccessReviewAuthz {
    async fn call(&self, state: &PipelineState) -> Result<Verdict> {
        let spec = self.spec(state)?;
        let user = spec.user.clone().unwrap_or_default();

        let result = tokio::time::timeout(self.timeout, self.reviewer.review(spec))
            .await
            .context("access review timed out")
            .and_then(|res| res);
        let status = match result {
            Ok(status) => status,
            Err(error) if self.fail_closed => {
                tracing::debug!(%user, %error, "Access review failed; denying");
                return Ok(Verdict::Deny(Some("access review failed".to_string())));
            }
            Err(error) => return Err(error.context("access review failed")),
        };

        tracing::debug!(%user, allowed = status.allowed, "Reviewed access");
        if status.allowed {
            return Ok(Verdict::Allow);
        }
        let reason = status
            .reason
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "access denied".to_string());
        Ok(Verdict::Deny(Some(reason)))
    }
}
