use authpolicy_controller_core::AuthRequest;
use std::borrow::Cow;

/// Where a request carries its credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// `Authorization: <prefix> <credential>`.
    AuthorizationHeader { prefix: String },
    CustomHeader { name: String },
    QueryString { name: String },
    Cookie { name: String },
}

impl Default for Credentials {
    fn default() -> Self {
        Self::AuthorizationHeader {
            prefix: "Bearer".to_string(),
        }
    }
}

impl Credentials {
    pub fn extract<'r>(&self, req: &'r AuthRequest) -> Option<Cow<'r, str>> {
        let value = match self {
            Self::AuthorizationHeader { prefix } => {
                let header = req.header("authorization")?;
                let (scheme, credential) = header.split_once(' ')?;
                if !scheme.eq_ignore_ascii_case(prefix) {
                    return None;
                }
                Cow::Borrowed(credential.trim())
            }
            Self::CustomHeader { name } => Cow::Borrowed(req.header(name)?),
            Self::QueryString { name } => req.query_param(name)?,
            Self::Cookie { name } => Cow::Borrowed(req.cookie(name)?),
        };
        (!value.is_empty()).then_some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_each_location() {
        let req = AuthRequest::new("api", "GET", "/pets?api_key=q1")
            .with_header("Authorization", "Bearer t0k3n")
            .with_header("X-Api-Key", "h1")
            .with_header("Cookie", "session=c1");

        assert_eq!(
            Credentials::default().extract(&req).as_deref(),
            Some("t0k3n")
        );
        assert_eq!(
            Credentials::AuthorizationHeader {
                prefix: "APIKEY".to_string()
            }
            .extract(&req),
            None
        );
        assert_eq!(
            Credentials::CustomHeader {
                name: "x-api-key".to_string()
            }
            .extract(&req)
            .as_deref(),
            Some("h1")
        );
        assert_eq!(
            Credentials::QueryString {
                name: "api_key".to_string()
            }
            .extract(&req)
            .as_deref(),
            Some("q1")
        );
        assert_eq!(
            Credentials::Cookie {
                name: "session".to_string()
            }
            .extract(&req)
            .as_deref(),
            Some("c1")
        );
    }

    #[test]
    fn query_credentials_are_decoded() {
        let req = AuthRequest::new("api", "GET", "/pets?api_key=abc%3D%3D");
        let credentials = Credentials::QueryString {
            name: "api_key".to_string(),
        };
        assert_eq!(credentials.extract(&req).as_deref(), Some("abc=="));
    }

    #[test]
    fn empty_credentials_are_missing() {
        let req = AuthRequest::new("api", "GET", "/").with_header("Authorization", "Bearer ");
        assert_eq!(Credentials::default().extract(&req), None);
    }
}
