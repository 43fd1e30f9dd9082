use crate::{credentials::Credentials, discovery::Discover};
use anyhow::{anyhow, bail, ensure, Context as _, Result};
use authpolicy_controller_core::{PipelineState, VerifyIdentity};
use jsonwebtoken::{jwk::Jwk, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::sync::Arc;

/// Verifies JSON Web Tokens issued by an OpenID Connect provider.
///
/// The provider's signing keys are located through its discovery document. The verified claims
/// become the request's identity.
pub struct Oidc {
    issuer: String,
    credentials: Credentials,
    discovery: Arc<dyn Discover>,
}

// === impl Oidc ===

impl Oidc {
    /// Discovers the issuer, failing if its metadata cannot be fetched.
    pub async fn discover(
        issuer: impl ToString,
        credentials: Credentials,
        discovery: Arc<dyn Discover>,
    ) -> Result<Self> {
        let issuer = issuer.to_string();
        discovery.openid_configuration(&issuer).await?;
        Ok(Self {
            issuer,
            credentials,
            discovery,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub async fn userinfo_endpoint(&self) -> Result<String> {
        let config = self.discovery.openid_configuration(&self.issuer).await?;
        config
            .userinfo_endpoint
            .clone()
            .ok_or_else(|| anyhow!("issuer {} does not publish a userinfo endpoint", self.issuer))
    }

    async fn signing_key(&self, jwks_uri: &str, kid: Option<&str>) -> Result<Jwk> {
        let keys = self.discovery.jwks(jwks_uri, false).await?;
        if let Some(key) = find_key(&keys.keys, kid) {
            return Ok(key.clone());
        }

        // The provider may have rotated its keys since they were cached.
        let keys = self.discovery.jwks(jwks_uri, true).await?;
        find_key(&keys.keys, kid)
            .cloned()
            .ok_or_else(|| anyhow!("no signing key matches kid {kid:?}"))
    }
}

#[async_trait::async_trait]
impl VerifyIdentity for Oidc {
    async fn call(&self, state: &PipelineState) -> Result<Value> {
        let token = self
            .credentials
            .extract(state.request())
            .ok_or_else(|| anyhow!("credential not found"))?;

        let header = jsonwebtoken::decode_header(&token).context("malformed token")?;
        let config = self.discovery.openid_configuration(&self.issuer).await?;
        let Some(jwks_uri) = config.jwks_uri.as_deref() else {
            bail!("issuer {} does not publish a key set", self.issuer);
        };
        let jwk = self.signing_key(jwks_uri, header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk).context("unusable signing key")?;
        let alg = signing_algorithm(&jwk, header.alg)?;

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.validate_nbf = true;
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Value>(&token, &key, &validation)
            .context("token verification failed")?;
        Ok(data.claims)
    }
}

/// The key's declared algorithm takes precedence over the token header, which must agree with it.
fn signing_algorithm(jwk: &Jwk, header: Algorithm) -> Result<Algorithm> {
    let Some(declared) = jwk.common.key_algorithm.as_ref() else {
        return Ok(header);
    };
    let alg = format!("{declared:?}")
        .parse::<Algorithm>()
        .map_err(|_| anyhow!("signing key algorithm {declared:?} cannot verify tokens"))?;
    ensure!(
        alg == header,
        "token algorithm {header:?} does not match the signing key's {alg:?}"
    );
    Ok(alg)
}

fn find_key<'k>(keys: &'k [Jwk], kid: Option<&str>) -> Option<&'k Jwk> {
    match kid {
        Some(kid) => keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid)),
        None => keys.first(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{discovery::HttpDiscovery, test_util::serve};
    use authpolicy_controller_core::AuthRequest;
    use axum::{routing::get, Json, Router};
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn issuer() -> String {
        serve(|base| {
            let config = json!({
                "issuer": base,
                "jwks_uri": format!("{base}/certs"),
            });
            let keys = json!({
                "keys": [{
                    "kty": "oct",
                    "kid": "k1",
                    "alg": "HS256",
                    "k": URL_SAFE_NO_PAD.encode(SECRET),
                }]
            });
            Router::new()
                .route(
                    "/.well-known/openid-configuration",
                    get(move || async move { Json(config) }),
                )
                .route("/certs", get(move || async move { Json(keys) }))
        })
        .await
    }

    fn token(issuer: &str, kid: &str, ttl: i64) -> String {
        signed(Algorithm::HS256, issuer, kid, ttl)
    }

    fn signed(alg: Algorithm, issuer: &str, kid: &str, ttl: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let mut header = Header::new(alg);
        header.kid = Some(kid.to_string());
        let claims = json!({
            "iss": issuer,
            "sub": "ada",
            "role": "admin",
            "exp": now + ttl,
        });
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    async fn verify(oidc: &Oidc, token: &str) -> Result<Value> {
        let req = AuthRequest::new("echo-api", "GET", "/")
            .with_header("authorization", format!("Bearer {token}"));
        oidc.call(&PipelineState::new(req)).await
    }

    async fn oidc(issuer: &str) -> Oidc {
        let discovery = HttpDiscovery::new(reqwest::Client::new(), Duration::from_secs(60));
        Oidc::discover(issuer, Credentials::default(), Arc::new(discovery))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn verifies_signed_tokens() {
        let issuer = issuer().await;
        let oidc = oidc(&issuer).await;

        let claims = verify(&oidc, &token(&issuer, "k1", 300)).await.unwrap();
        assert_eq!(claims["sub"], "ada");
        assert_eq!(claims["role"], "admin");
    }

    #[tokio::test]
    async fn rejects_invalid_tokens() {
        let issuer = issuer().await;
        let oidc = oidc(&issuer).await;

        assert!(verify(&oidc, &token(&issuer, "k1", -600)).await.is_err());
        assert!(verify(&oidc, &token(&issuer, "unknown", 300)).await.is_err());
        assert!(verify(&oidc, &token("https://evil.example.com", "k1", 300))
            .await
            .is_err());
        assert!(verify(&oidc, "not-a-jwt").await.is_err());

        // Signed with the right secret but an algorithm the key does not declare.
        let err = verify(&oidc, &signed(Algorithm::HS384, &issuer, "k1", 300))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"), "{err}");

        let anonymous = PipelineState::new(AuthRequest::new("echo-api", "GET", "/"));
        assert!(oidc.call(&anonymous).await.is_err());
    }

    #[tokio::test]
    async fn discovery_failure_is_an_error() {
        let issuer = serve(|_| Router::new()).await;
        let discovery = HttpDiscovery::new(reqwest::Client::new(), Duration::from_secs(60));
        let res = Oidc::discover(issuer, Credentials::default(), Arc::new(discovery)).await;
        assert!(res.is_err());
    }
}
