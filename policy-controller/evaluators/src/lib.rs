#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Concrete evaluators for the authorization pipeline.

mod anonymous;
mod cedar;
mod credentials;
pub mod discovery;
mod json;
mod kubernetes;
mod oidc;
mod uma;
mod userinfo;

#[cfg(test)]
mod test_util;

pub use self::{
    anonymous::Anonymous,
    cedar::{CedarPolicy, InvalidPolicy},
    credentials::Credentials,
    discovery::{Discover, HttpDiscovery},
    json::{InvalidRule, JsonRules, Mode, Rule},
    kubernetes::{KubeReviewer, ResourceTemplate, ReviewAccess, SubjectAccessReviewAuthz},
    oidc::Oidc,
    uma::Uma,
    userinfo::UserInfo,
};

/// Builds the HTTP client shared by evaluators for outbound calls.
pub fn http_client(timeout: std::time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("authpolicy-controller/", env!("CARGO_PKG_VERSION")))
        .build()
}
