use crate::pipeline::PipelineState;
use anyhow::Result;
use serde_json::Value;

/// Verifies the identity of a request, returning the identity object (e.g. token claims).
#[async_trait::async_trait]
pub trait VerifyIdentity: Send + Sync {
    async fn call(&self, state: &PipelineState) -> Result<Value>;
}

/// Fetches additional attributes about the request's subject or resource.
#[async_trait::async_trait]
pub trait FetchMetadata: Send + Sync {
    async fn call(&self, state: &PipelineState) -> Result<Value>;
}

/// Decides whether a request is permitted.
///
/// An `Err` means the evaluator could not reach a verdict, which is distinct from a denial.
#[async_trait::async_trait]
pub trait Authorize: Send + Sync {
    async fn call(&self, state: &PipelineState) -> Result<Verdict>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Option<String>),
}

// === impl Verdict ===

impl Verdict {
    pub fn from_bool(allowed: bool) -> Self {
        if allowed {
            Self::Allow
        } else {
            Self::Deny(None)
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}
