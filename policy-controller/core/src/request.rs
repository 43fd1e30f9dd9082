use serde_json::{json, Value};
use std::{borrow::Cow, collections::BTreeMap, net::SocketAddr};

/// Attributes of an inbound request submitted for authorization.
///
/// Header names are stored lowercased.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub host: String,
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub headers: BTreeMap<String, String>,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

// === impl AuthRequest ===

impl AuthRequest {
    pub fn new(host: impl ToString, method: impl ToString, path: impl ToString) -> Self {
        Self {
            host: host.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            scheme: "http".to_string(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl ToString) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.source = Some(addr);
        self
    }

    pub fn with_destination(mut self, addr: SocketAddr) -> Self {
        self.destination = Some(addr);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The request path without its query string.
    pub fn path_only(&self) -> &str {
        self.path
            .split_once('?')
            .map_or(self.path.as_str(), |(path, _)| path)
    }

    /// Returns the first value of a query string parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<Cow<'_, str>> {
        let (_, query) = self.path.split_once('?')?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Cookie values are returned as sent.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .find_map(|cookie| match cookie.trim().split_once('=') {
                Some((key, value)) if key == name => Some(value),
                _ => None,
            })
    }

    pub(crate) fn to_json(&self) -> Value {
        json!({
            "request": {
                "host": self.host,
                "method": self.method,
                "path": self.path,
                "scheme": self.scheme,
                "headers": self.headers,
            },
            "source": peer_json(self.source),
            "destination": peer_json(self.destination),
        })
    }
}

fn peer_json(addr: Option<SocketAddr>) -> Value {
    match addr {
        Some(addr) => json!({
            "address": addr.ip().to_string(),
            "port": addr.port(),
        }),
        None => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_are_case_insensitive() {
        let req = AuthRequest::new("api.example.com", "GET", "/").with_header("X-Api-Key", "k");
        assert_eq!(req.header("x-api-key"), Some("k"));
        assert_eq!(req.header("X-API-KEY"), Some("k"));
    }

    #[test]
    fn query_and_cookie_lookup() {
        let req = AuthRequest::new("api.example.com", "GET", "/pets?limit=10&access_token=abc")
            .with_header("Cookie", "theme=dark; session=s3cr3t");
        assert_eq!(req.path_only(), "/pets");
        assert_eq!(req.query_param("access_token").as_deref(), Some("abc"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.cookie("session"), Some("s3cr3t"));
        assert_eq!(req.cookie("lang"), None);
    }

    #[test]
    fn query_values_are_decoded() {
        let req = AuthRequest::new("api", "GET", "/pets?api_key=abc%3D%3D&q=a+b%2Fc&flag");
        assert_eq!(req.query_param("api_key").as_deref(), Some("abc=="));
        assert_eq!(req.query_param("q").as_deref(), Some("a b/c"));
        assert_eq!(req.query_param("flag").as_deref(), Some(""));
    }
}
