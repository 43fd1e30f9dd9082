use crate::discovery::Discover;
use anyhow::{anyhow, Context as _, Result};
use authpolicy_controller_core::{FetchMetadata, PipelineState};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Fetches the resources registered with a UMA 2.0 authorization server for the request path.
///
/// Each call obtains a protection API token with the client credentials grant, looks up the
/// resource ids matching the request path and then fetches each resource description.
pub struct Uma {
    endpoint: String,
    client_id: String,
    client_secret: String,
    discovery: Arc<dyn Discover>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

// === impl Uma ===

impl Uma {
    /// Discovers the authorization server, failing if its metadata cannot be fetched.
    pub async fn discover(
        endpoint: impl ToString,
        client_id: impl ToString,
        client_secret: impl ToString,
        discovery: Arc<dyn Discover>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let endpoint = endpoint.to_string();
        discovery.uma_configuration(&endpoint).await?;
        Ok(Self {
            endpoint,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            discovery,
            client,
        })
    }

    async fn protection_token(&self, token_endpoint: &str) -> Result<String> {
        let rsp = self
            .client
            .post(token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("failed to obtain a protection API token")?
            .json::<TokenResponse>()
            .await
            .context("invalid token response")?;
        Ok(rsp.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        token: &str,
    ) -> Result<T> {
        req.bearer_auth(token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("resource registration request failed")?
            .json::<T>()
            .await
            .context("invalid resource registration response")
    }
}

#[async_trait::async_trait]
impl FetchMetadata for Uma {
    async fn call(&self, state: &PipelineState) -> Result<Value> {
        let config = self.discovery.uma_configuration(&self.endpoint).await?;
        let token_endpoint = config
            .token_endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("{} does not publish a token endpoint", self.endpoint))?;
        let registry = config
            .resource_registration_endpoint
            .as_deref()
            .ok_or_else(|| {
                anyhow!(
                    "{} does not publish a resource registration endpoint",
                    self.endpoint
                )
            })?
            .trim_end_matches('/');

        let token = self.protection_token(token_endpoint).await?;

        let path = state.request().path_only();
        let ids = self
            .get_json::<Vec<String>>(self.client.get(registry).query(&[("uri", path)]), &token)
            .await?;
        tracing::debug!(%path, resources = ids.len(), "Found registered resources");

        let base = reqwest::Url::parse(registry)
            .with_context(|| format!("invalid resource registration endpoint {registry}"))?;
        let mut resources = Vec::with_capacity(ids.len());
        for id in ids {
            // Ids are opaque to the server and are sent as a single path segment.
            let mut url = base.clone();
            url.path_segments_mut()
                .map_err(|()| anyhow!("{registry} cannot be a base URL"))?
                .pop_if_empty()
                .push(&id);
            resources.push(self.get_json::<Value>(self.client.get(url), &token).await?);
        }
        Ok(Value::Array(resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::HttpDiscovery, test_util::serve};
    use authpolicy_controller_core::AuthRequest;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::{collections::HashMap, time::Duration};

    fn bearer(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer pat")
    }

    async fn server() -> String {
        serve(|base| {
            let config = json!({
                "issuer": base,
                "token_endpoint": format!("{base}/token"),
                "resource_registration_endpoint": format!("{base}/resource_set"),
            });
            Router::new()
                .route(
                    "/.well-known/uma2-configuration",
                    get(move || async move { Json(config) }),
                )
                .route(
                    "/token",
                    post(|headers: HeaderMap| async move {
                        // base64("clientID:clientSecret")
                        let expected = "Basic Y2xpZW50SUQ6Y2xpZW50U2VjcmV0";
                        if headers.get("authorization").and_then(|v| v.to_str().ok())
                            != Some(expected)
                        {
                            return Err(StatusCode::UNAUTHORIZED);
                        }
                        Ok(Json(json!({"access_token": "pat", "token_type": "Bearer"})))
                    }),
                )
                .route(
                    "/resource_set",
                    get(
                        |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                            if !bearer(&headers) {
                                return Err(StatusCode::UNAUTHORIZED);
                            }
                            let ids = match q.get("uri").map(String::as_str) {
                                Some("/greetings/1") => vec!["r1"],
                                Some("/greetings/3") => vec!["shared/r 3"],
                                _ => vec![],
                            };
                            Ok(Json(json!(ids)))
                        },
                    ),
                )
                .route(
                    "/resource_set/:id",
                    get(|headers: HeaderMap, Path(id): Path<String>| async move {
                        if !bearer(&headers) {
                            return Err(StatusCode::UNAUTHORIZED);
                        }
                        Ok(Json(json!({"_id": id, "owner": {"id": "ada"}})))
                    }),
                )
        })
        .await
    }

    async fn uma(endpoint: &str, secret: &str) -> Uma {
        let discovery = Arc::new(HttpDiscovery::new(
            reqwest::Client::new(),
            Duration::from_secs(60),
        ));
        Uma::discover(
            endpoint,
            "clientID",
            secret,
            discovery,
            reqwest::Client::new(),
        )
        .await
        .unwrap()
    }

    fn state(path: &str) -> PipelineState {
        PipelineState::new(AuthRequest::new("echo-api", "GET", path))
    }

    #[tokio::test]
    async fn fetches_registered_resources() {
        let endpoint = server().await;
        let uma = uma(&endpoint, "clientSecret").await;

        let resources = uma.call(&state("/greetings/1?lang=en")).await.unwrap();
        assert_eq!(resources, json!([{"_id": "r1", "owner": {"id": "ada"}}]));

        let resources = uma.call(&state("/greetings/2")).await.unwrap();
        assert_eq!(resources, json!([]));
    }

    #[tokio::test]
    async fn resource_ids_are_escaped() {
        let endpoint = server().await;
        let uma = uma(&endpoint, "clientSecret").await;

        let resources = uma.call(&state("/greetings/3")).await.unwrap();
        assert_eq!(resources, json!([{"_id": "shared/r 3", "owner": {"id": "ada"}}]));
    }

    #[tokio::test]
    async fn bad_client_credentials_fail() {
        let endpoint = server().await;
        let uma = uma(&endpoint, "wrong").await;
        assert!(uma.call(&state("/greetings/1")).await.is_err());
    }
}
