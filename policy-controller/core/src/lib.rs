#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core types shared by the policy controller: the request model, the authorization pipeline and
//! its evaluator traits, and the host cache abstraction used to route requests to pipelines.

mod evaluator;
pub mod host;
pub mod pipeline;
mod request;
mod resource_id;
pub mod selector;

pub use self::{
    evaluator::{Authorize, FetchMetadata, Verdict, VerifyIdentity},
    host::{HostCache, Registration},
    pipeline::{AuthPipeline, Decision, Denial, DenialKind, PipelineState},
    request::AuthRequest,
    resource_id::ResourceId,
    selector::Selector,
};

pub const POLICY_CONTROLLER_NAME: &str = "authpolicy.io/policy-controller";
