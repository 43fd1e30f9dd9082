//! Issuer discovery documents and key sets, cached with a time-based expiry.
//!
//! Entries are refreshed lazily: a lookup after the TTL elapses fetches the document again. No
//! lock is held while a fetch is in flight.

use ahash::AHashMap as HashMap;
use anyhow::{Context as _, Result};
pub use jsonwebtoken::jwk::JwkSet;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// The subset of an OpenID Connect provider's metadata used by the evaluators.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

/// The subset of a UMA 2.0 authorization server's metadata used by the evaluators.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UmaConfiguration {
    pub issuer: String,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub resource_registration_endpoint: Option<String>,
}

#[async_trait::async_trait]
pub trait Discover: Send + Sync {
    async fn openid_configuration(&self, issuer: &str) -> Result<Arc<OpenIdConfiguration>>;

    async fn uma_configuration(&self, issuer: &str) -> Result<Arc<UmaConfiguration>>;

    /// Fetches the key set at `uri`. When `refresh` is set the cached copy is ignored, e.g. after
    /// a token names an unknown key.
    async fn jwks(&self, uri: &str, refresh: bool) -> Result<Arc<JwkSet>>;
}

/// Discovers issuer metadata over HTTP.
#[derive(Debug)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    openid: TtlCache<OpenIdConfiguration>,
    uma: TtlCache<UmaConfiguration>,
    jwks: TtlCache<JwkSet>,
}

#[derive(Debug)]
struct TtlCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Arc<T>)>>,
}

// === impl HttpDiscovery ===

impl HttpDiscovery {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            openid: TtlCache::new(ttl),
            uma: TtlCache::new(ttl),
            jwks: TtlCache::new(ttl),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        tracing::debug!(%url, "Fetching");
        let rsp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("failed to fetch {url}"))?;
        rsp.json::<T>()
            .await
            .with_context(|| format!("invalid document at {url}"))
    }
}

#[async_trait::async_trait]
impl Discover for HttpDiscovery {
    async fn openid_configuration(&self, issuer: &str) -> Result<Arc<OpenIdConfiguration>> {
        if let Some(config) = self.openid.get(issuer) {
            return Ok(config);
        }
        let config = self
            .fetch::<OpenIdConfiguration>(&well_known(issuer, "openid-configuration"))
            .await?;
        tracing::info!(%issuer, "Discovered OpenID Connect issuer");
        Ok(self.openid.insert(issuer, config))
    }

    async fn uma_configuration(&self, issuer: &str) -> Result<Arc<UmaConfiguration>> {
        if let Some(config) = self.uma.get(issuer) {
            return Ok(config);
        }
        let config = self
            .fetch::<UmaConfiguration>(&well_known(issuer, "uma2-configuration"))
            .await?;
        tracing::info!(%issuer, "Discovered UMA authorization server");
        Ok(self.uma.insert(issuer, config))
    }

    async fn jwks(&self, uri: &str, refresh: bool) -> Result<Arc<JwkSet>> {
        if !refresh {
            if let Some(keys) = self.jwks.get(uri) {
                return Ok(keys);
            }
        }
        let keys = self.fetch::<JwkSet>(uri).await?;
        tracing::debug!(%uri, keys = keys.keys.len(), "Fetched key set");
        Ok(self.jwks.insert(uri, keys))
    }
}

fn well_known(issuer: &str, document: &str) -> String {
    format!("{}/.well-known/{}", issuer.trim_end_matches('/'), document)
}

// === impl TtlCache ===

impl<T> TtlCache<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.read();
        let (fetched_at, value) = entries.get(key)?;
        (fetched_at.elapsed() < self.ttl).then(|| value.clone())
    }

    fn insert(&self, key: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.entries
            .write()
            .insert(key.to_string(), (Instant::now(), value.clone()));
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::serve;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caches_documents_until_expiry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let issuer = serve(move |base| {
            let doc = json!({
                "issuer": base,
                "jwks_uri": format!("{base}/certs"),
                "userinfo_endpoint": format!("{base}/userinfo"),
            });
            Router::new().route(
                "/.well-known/openid-configuration",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let doc = doc.clone();
                    async move { Json(doc) }
                }),
            )
        })
        .await;

        let discovery = HttpDiscovery::new(reqwest::Client::new(), DEFAULT_TTL);
        let config = discovery.openid_configuration(&issuer).await.unwrap();
        assert_eq!(config.issuer, issuer);
        assert_eq!(config.jwks_uri, Some(format!("{issuer}/certs")));

        discovery.openid_configuration(&issuer).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let expired = HttpDiscovery::new(reqwest::Client::new(), Duration::ZERO);
        expired.openid_configuration(&issuer).await.unwrap();
        expired.openid_configuration(&issuer).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_issuer_is_an_error() {
        let issuer = serve(|_| Router::new()).await;
        let discovery = HttpDiscovery::new(reqwest::Client::new(), DEFAULT_TTL);
        assert!(discovery.uma_configuration(&issuer).await.is_err());
    }

    #[test]
    fn well_known_paths() {
        assert_eq!(
            well_known("http://127.0.0.1:9001/auth/realms/demo/", "uma2-configuration"),
            "http://127.0.0.1:9001/auth/realms/demo/.well-known/uma2-configuration"
        );
    }
}
