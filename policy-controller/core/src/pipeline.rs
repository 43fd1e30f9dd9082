//! The authorization pipeline evaluates a request in three ordered stages:
//!
//! 1. identity: evaluators are tried in order and the first success authenticates the request. If
//!    all of them fail the request is denied as unauthenticated.
//! 2. metadata: every evaluator runs in order. Failures are recorded by name and do not stop the
//!    pipeline.
//! 3. authorization: every evaluator must allow. The first denial (or evaluator error) stops the
//!    stage and is reported.
//!
//! A pipeline is immutable once built and may be shared across concurrent evaluations; all
//! per-request state lives in [`PipelineState`].

use crate::{
    evaluator::{Authorize, FetchMetadata, Verdict, VerifyIdentity},
    request::AuthRequest,
};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::time::{self, Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AuthPipeline {
    identity: Vec<Named<dyn VerifyIdentity>>,
    metadata: Vec<Named<dyn FetchMetadata>>,
    authorization: Vec<Named<dyn Authorize>>,
    timeout: Duration,
}

#[derive(Default)]
pub struct Builder {
    identity: Vec<Named<dyn VerifyIdentity>>,
    metadata: Vec<Named<dyn FetchMetadata>>,
    authorization: Vec<Named<dyn Authorize>>,
    timeout: Option<Duration>,
}

struct Named<E: ?Sized> {
    name: String,
    evaluator: Arc<E>,
}

/// Per-request evaluation state, accumulated as the stages run.
#[derive(Clone, Debug)]
pub struct PipelineState {
    request: AuthRequest,
    identity: Option<(String, Value)>,
    metadata: BTreeMap<String, Value>,
    metadata_errors: BTreeMap<String, String>,
    authorization: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The request is permitted. Holds the name of the identity source that authenticated it, if
    /// the pipeline declares any.
    Allow { identity: Option<String> },
    Deny(Denial),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denial {
    pub kind: DenialKind,

    /// The evaluator that produced the denial, if any.
    pub evaluator: Option<String>,

    pub reason: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DenialKind {
    /// No identity evaluator verified the request.
    Unauthenticated,

    /// An authorization evaluator denied the request.
    PermissionDenied,

    /// An authorization evaluator failed to produce a verdict.
    Internal,

    /// The evaluation deadline elapsed.
    Timeout,

    /// No pipeline is published for the request's host.
    NotFound,
}

// === impl AuthPipeline ===

impl AuthPipeline {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn identity_names(&self) -> impl Iterator<Item = &str> {
        self.identity.iter().map(|n| n.name.as_str())
    }

    pub fn metadata_names(&self) -> impl Iterator<Item = &str> {
        self.metadata.iter().map(|n| n.name.as_str())
    }

    pub fn authorization_names(&self) -> impl Iterator<Item = &str> {
        self.authorization.iter().map(|n| n.name.as_str())
    }

    /// Evaluates the request, bounded by the pipeline's timeout.
    pub async fn evaluate(&self, request: AuthRequest) -> Decision {
        self.evaluate_until(request, Instant::now() + self.timeout)
            .await
    }

    /// Evaluates the request, denying it if the deadline elapses before a decision is reached.
    pub async fn evaluate_until(&self, request: AuthRequest, deadline: Instant) -> Decision {
        let mut state = PipelineState::new(request);
        let result = time::timeout_at(deadline, self.run(&mut state)).await;
        match result {
            Ok(Ok(identity)) => Decision::Allow { identity },
            Ok(Err(denial)) => Decision::Deny(denial),
            Err(_) => {
                tracing::debug!(host = %state.request.host, "Evaluation deadline elapsed");
                Decision::Deny(Denial {
                    kind: DenialKind::Timeout,
                    evaluator: None,
                    reason: "evaluation timed out".to_string(),
                })
            }
        }
    }

    async fn run(&self, state: &mut PipelineState) -> Result<Option<String>, Denial> {
        self.verify_identity(state).await?;
        self.fetch_metadata(state).await;
        self.authorize(state).await?;
        Ok(state.identity.as_ref().map(|(name, _)| name.clone()))
    }

    async fn verify_identity(&self, state: &mut PipelineState) -> Result<(), Denial> {
        if self.identity.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::with_capacity(self.identity.len());
        for Named { name, evaluator } in &self.identity {
            match evaluator.call(state).await {
                Ok(identity) => {
                    tracing::debug!(identity = %name, "Identity verified");
                    state.set_identity(name, identity);
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(identity = %name, %error, "Identity not verified");
                    failures.push(format!("{name}: {error}"));
                }
            }
        }

        Err(Denial {
            kind: DenialKind::Unauthenticated,
            evaluator: None,
            reason: failures.join("; "),
        })
    }

    async fn fetch_metadata(&self, state: &mut PipelineState) {
        for Named { name, evaluator } in &self.metadata {
            match evaluator.call(state).await {
                Ok(value) => state.set_metadata(name, value),
                Err(error) => {
                    tracing::debug!(metadata = %name, %error, "Failed to fetch metadata");
                    state.metadata_errors.insert(name.clone(), error.to_string());
                }
            }
        }
    }

    async fn authorize(&self, state: &mut PipelineState) -> Result<(), Denial> {
        for Named { name, evaluator } in &self.authorization {
            match evaluator.call(state).await {
                Ok(Verdict::Allow) => {
                    state.authorization.insert(name.clone(), Value::Bool(true));
                }
                Ok(Verdict::Deny(reason)) => {
                    return Err(Denial {
                        kind: DenialKind::PermissionDenied,
                        evaluator: Some(name.clone()),
                        reason: reason.unwrap_or_else(|| "unauthorized".to_string()),
                    });
                }
                Err(error) => {
                    tracing::warn!(authorization = %name, %error, "Authorization evaluator failed");
                    return Err(Denial {
                        kind: DenialKind::Internal,
                        evaluator: Some(name.clone()),
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AuthPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPipeline")
            .field("identity", &self.identity_names().collect::<Vec<_>>())
            .field("metadata", &self.metadata_names().collect::<Vec<_>>())
            .field(
                "authorization",
                &self.authorization_names().collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

// === impl Builder ===

impl Builder {
    pub fn identity(mut self, name: impl ToString, evaluator: Arc<dyn VerifyIdentity>) -> Self {
        self.identity.push(Named::new(name, evaluator));
        self
    }

    pub fn metadata(mut self, name: impl ToString, evaluator: Arc<dyn FetchMetadata>) -> Self {
        self.metadata.push(Named::new(name, evaluator));
        self
    }

    pub fn authorization(mut self, name: impl ToString, evaluator: Arc<dyn Authorize>) -> Self {
        self.authorization.push(Named::new(name, evaluator));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> AuthPipeline {
        AuthPipeline {
            identity: self.identity,
            metadata: self.metadata,
            authorization: self.authorization,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }
}

// === impl Named ===

impl<E: ?Sized> Named<E> {
    fn new(name: impl ToString, evaluator: Arc<E>) -> Self {
        Self {
            name: name.to_string(),
            evaluator,
        }
    }
}

impl<E: ?Sized> Clone for Named<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            evaluator: self.evaluator.clone(),
        }
    }
}

// === impl PipelineState ===

impl PipelineState {
    pub fn new(request: AuthRequest) -> Self {
        Self {
            request,
            identity: None,
            metadata: BTreeMap::new(),
            metadata_errors: BTreeMap::new(),
            authorization: BTreeMap::new(),
        }
    }

    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    pub fn set_identity(&mut self, source: impl ToString, identity: Value) {
        self.identity = Some((source.to_string(), identity));
    }

    pub fn set_metadata(&mut self, name: impl ToString, value: Value) {
        self.metadata.insert(name.to_string(), value);
    }

    /// The name of the identity source that verified the request.
    pub fn identity_source(&self) -> Option<&str> {
        self.identity.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn identity(&self) -> Option<&Value> {
        self.identity.as_ref().map(|(_, identity)| identity)
    }

    pub fn metadata(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name)
    }

    pub fn metadata_error(&self, name: &str) -> Option<&str> {
        self.metadata_errors.get(name).map(String::as_str)
    }

    /// Builds the structured view of the request and the pipeline's results that selectors and
    /// policies are evaluated against.
    pub fn authorization_json(&self) -> Value {
        let mut doc = self.request.to_json();
        let auth = json!({
            "identity": self.identity().cloned().unwrap_or_else(|| Value::Object(Map::new())),
            "metadata": self.metadata,
            "authorization": self.authorization,
        });
        if let Value::Object(map) = &mut doc {
            map.insert("auth".to_string(), auth);
        }
        doc
    }
}

#[cfg(test)]
mod tests;
