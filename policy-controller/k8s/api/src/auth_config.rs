use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Protects a set of hosts with an authorization pipeline.
///
/// Each identity, metadata and authorization entry declares exactly one mechanism.
#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "authpolicy.io",
    version = "v1beta1",
    kind = "AuthConfig",
    status = "AuthConfigStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfigSpec {
    /// Hostnames routed to this policy. A host may be claimed by only one `AuthConfig`.
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity: Vec<IdentitySpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization: Vec<AuthorizationSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySpec {
    pub name: String,

    /// Where the request carries its credential. Defaults to a bearer token.
    pub credentials: Option<CredentialsSpec>,

    pub oidc: Option<OidcSpec>,

    /// Accepts every request with an empty identity.
    pub anonymous: Option<AnonymousSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSpec {
    pub authorization_header: Option<AuthorizationHeader>,
    pub custom_header: Option<Named>,
    pub query_string: Option<Named>,
    pub cookie: Option<Named>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Named {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OidcSpec {
    /// The issuer URL. Its discovery document is fetched from
    /// `<endpoint>/.well-known/openid-configuration`.
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AnonymousSpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSpec {
    pub name: String,

    pub user_info: Option<UserInfoSpec>,

    pub uma: Option<UmaSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoSpec {
    /// The name of an `oidc` identity entry.
    pub identity_source: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UmaSpec {
    pub endpoint: String,

    /// A secret in the policy's namespace holding `clientID` and `clientSecret`.
    pub credentials_ref: SecretRef,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSpec {
    pub name: String,

    pub cedar: Option<CedarSpec>,

    pub json: Option<JsonRulesSpec>,

    pub kubernetes: Option<KubernetesSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CedarSpec {
    pub policy: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct JsonRulesSpec {
    pub rules: Vec<JsonRuleSpec>,

    /// `all` (the default) or `any`.
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct JsonRuleSpec {
    pub selector: String,
    pub operator: String,
    pub value: String,
}

/// Delegates the decision to a Kubernetes `SubjectAccessReview`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    /// Selects the reviewed user. Defaults to `auth.identity.sub`.
    pub user: Option<String>,

    pub groups: Option<String>,

    /// When unset, the request path is reviewed as a non-resource URL.
    pub resource_attributes: Option<ResourceAttributesSpec>,

    /// Deny, rather than fail, when the review cannot be completed.
    #[serde(default)]
    pub fail_closed: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceAttributesSpec {
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub resource: Option<String>,
    pub name: Option<String>,
    pub subresource: Option<String>,
    pub verb: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfigStatus {
    pub ready: bool,

    /// Hosts currently routed to this policy.
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// === impl AuthConfigSpec ===

impl AuthConfigSpec {
    /// Names of the secrets referenced by this policy.
    pub fn secret_refs(&self) -> impl Iterator<Item = &str> + '_ {
        self.metadata
            .iter()
            .filter_map(|m| m.uma.as_ref())
            .map(|uma| uma.credentials_ref.name.as_str())
    }
}
