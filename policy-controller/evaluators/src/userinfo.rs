use crate::oidc::Oidc;
use anyhow::{anyhow, bail, Context as _, Result};
use authpolicy_controller_core::{FetchMetadata, PipelineState};
use serde_json::Value;
use std::sync::Arc;

/// Fetches claims from the userinfo endpoint of the OpenID Connect issuer that verified the
/// request.
pub struct UserInfo {
    identity_source: String,
    oidc: Arc<Oidc>,
    client: reqwest::Client,
}

impl UserInfo {
    pub fn new(identity_source: impl ToString, oidc: Arc<Oidc>, client: reqwest::Client) -> Self {
        Self {
            identity_source: identity_source.to_string(),
            oidc,
            client,
        }
    }
}

#[async_trait::async_trait]
impl FetchMetadata for UserInfo {
    async fn call(&self, state: &PipelineState) -> Result<Value> {
        if state.identity_source() != Some(self.identity_source.as_str()) {
            bail!(
                "identity source {} did not verify the request",
                self.identity_source
            );
        }
        let token = self
            .oidc
            .credentials()
            .extract(state.request())
            .ok_or_else(|| anyhow!("credential not found"))?;

        let endpoint = self.oidc.userinfo_endpoint().await?;
        tracing::debug!(%endpoint, "Fetching user info");
        self.client
            .get(&endpoint)
            .bearer_auth(token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("failed to fetch {endpoint}"))?
            .json::<Value>()
            .await
            .context("invalid user info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credentials::Credentials, discovery::HttpDiscovery, test_util::serve};
    use authpolicy_controller_core::AuthRequest;
    use axum::{http::HeaderMap, routing::get, Json, Router};
    use serde_json::json;
    use std::time::Duration;

    async fn userinfo() -> UserInfo {
        let issuer = serve(|base| {
            let config = json!({
                "issuer": base,
                "userinfo_endpoint": format!("{base}/userinfo"),
            });
            Router::new()
                .route(
                    "/.well-known/openid-configuration",
                    get(move || async move { Json(config) }),
                )
                .route(
                    "/userinfo",
                    get(|headers: HeaderMap| async move {
                        let authz = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        Json(json!({"email": "ada@example.com", "authorization": authz}))
                    }),
                )
        })
        .await;
        let discovery = Arc::new(HttpDiscovery::new(
            reqwest::Client::new(),
            Duration::from_secs(60),
        ));
        let oidc = Oidc::discover(issuer, Credentials::default(), discovery)
            .await
            .unwrap();
        UserInfo::new("keycloak", Arc::new(oidc), reqwest::Client::new())
    }

    fn verified_by(source: &str) -> PipelineState {
        let req =
            AuthRequest::new("echo-api", "GET", "/").with_header("authorization", "Bearer t0k3n");
        let mut state = PipelineState::new(req);
        state.set_identity(source, json!({"sub": "ada"}));
        state
    }

    #[tokio::test]
    async fn fetches_with_the_request_credential() {
        let userinfo = userinfo().await;
        let info = userinfo.call(&verified_by("keycloak")).await.unwrap();
        assert_eq!(
            info,
            json!({"email": "ada@example.com", "authorization": "Bearer t0k3n"})
        );
    }

    #[tokio::test]
    async fn requires_its_identity_source() {
        let userinfo = userinfo().await;
        assert!(userinfo.call(&verified_by("api-key")).await.is_err());
    }
}
