//! Compiles an `AuthConfig` spec into an authorization pipeline.
//!
//! Translation runs in two phases. Planning checks the declarations and builds every evaluator
//! that needs no I/O; a planning failure is a permanent defect of the spec. Building then discovers
//! the issuers and authorization servers the plan references; a building failure is transient.

use crate::{
    core::{AuthPipeline, Authorize, FetchMetadata, Selector, VerifyIdentity},
    evaluators::{
        Anonymous, CedarPolicy, Credentials, Discover, InvalidPolicy, InvalidRule, JsonRules,
        Mode, Oidc, ResourceTemplate, ReviewAccess, Rule, SubjectAccessReviewAuthz, Uma, UserInfo,
    },
    k8s::auth_config::{
        AuthConfigSpec, AuthorizationSpec, CredentialsSpec, IdentitySpec, JsonRulesSpec,
        KubernetesSpec, MetadataSpec, UmaSpec, UserInfoSpec,
    },
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use authpolicy_controller_core::selector::InvalidSelector;
use std::{sync::Arc, time::Duration};

pub const UMA_CLIENT_ID: &str = "clientID";
pub const UMA_CLIENT_SECRET: &str = "clientSecret";

const DEFAULT_REVIEW_USER: &str = "auth.identity.sub";

/// Builds pipelines with the shared clients evaluators need.
#[derive(Clone)]
pub struct Translator {
    discovery: Arc<dyn Discover>,
    client: reqwest::Client,
    reviewer: Arc<dyn ReviewAccess>,
    evaluation_timeout: Duration,
    review_timeout: Duration,
}

/// Secret values resolved for a policy, by secret name and key.
#[derive(Clone, Debug, Default)]
pub struct Secrets(HashMap<(String, String), Vec<u8>>);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Invalid(#[from] TranslateError),

    #[error(transparent)]
    Unavailable(anyhow::Error),
}

/// A defect in the spec that persists until the resource is edited.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("at least one host must be declared")]
    NoHosts,

    #[error("{stage} {name}: exactly one mechanism must be set, found {count}")]
    Mechanisms {
        stage: &'static str,
        name: String,
        count: usize,
    },

    #[error("identity {0}: at most one credentials location may be set")]
    Credentials(String),

    #[error("{stage} name {name} is declared more than once")]
    DuplicateName { stage: &'static str, name: String },

    #[error("metadata {name}: {identity} is not an oidc identity")]
    UnknownIdentity { name: String, identity: String },

    #[error("metadata {name}: secret {secret} key {key} is not valid UTF-8")]
    SecretEncoding {
        name: String,
        secret: String,
        key: &'static str,
    },

    #[error("authorization {name}: {source}")]
    Rule { name: String, source: InvalidRule },

    #[error("authorization {name}: unknown mode {mode:?}")]
    Mode { name: String, mode: String },

    #[error("authorization {name}: {source}")]
    Policy { name: String, source: InvalidPolicy },

    #[error("authorization {name}: {source}")]
    Selector {
        name: String,
        source: InvalidSelector,
    },
}

enum IdentityPlan<'s> {
    Oidc {
        endpoint: &'s str,
        credentials: Credentials,
    },
    Anonymous,
}

enum MetadataPlan<'s> {
    UserInfo {
        identity: &'s str,
    },
    Uma {
        endpoint: &'s str,
        client_id: String,
        client_secret: String,
    },
}

struct Plan<'s> {
    identity: Vec<(&'s str, IdentityPlan<'s>)>,
    metadata: Vec<(&'s str, MetadataPlan<'s>)>,
    authorization: Vec<(&'s str, Arc<dyn Authorize>)>,
}

/// Lists the `(secret, key)` pairs a spec references.
pub fn secret_keys(spec: &AuthConfigSpec) -> Vec<(&str, &'static str)> {
    spec.secret_refs()
        .flat_map(|name| [(name, UMA_CLIENT_ID), (name, UMA_CLIENT_SECRET)])
        .collect()
}

// === impl Translator ===

impl Translator {
    pub fn new(
        discovery: Arc<dyn Discover>,
        client: reqwest::Client,
        reviewer: Arc<dyn ReviewAccess>,
        evaluation_timeout: Duration,
        review_timeout: Duration,
    ) -> Self {
        Self {
            discovery,
            client,
            reviewer,
            evaluation_timeout,
            review_timeout,
        }
    }

    pub async fn translate(
        &self,
        spec: &AuthConfigSpec,
        secrets: &Secrets,
    ) -> Result<AuthPipeline, Error> {
        let plan = self.plan(spec, secrets)?;
        self.build(plan).await.map_err(Error::Unavailable)
    }

    fn plan<'s>(
        &self,
        spec: &'s AuthConfigSpec,
        secrets: &Secrets,
    ) -> Result<Plan<'s>, TranslateError> {
        if spec.hosts.is_empty() {
            return Err(TranslateError::NoHosts);
        }
        unique_names("identity", spec.identity.iter().map(|i| i.name.as_str()))?;
        unique_names("metadata", spec.metadata.iter().map(|m| m.name.as_str()))?;
        unique_names(
            "authorization",
            spec.authorization.iter().map(|a| a.name.as_str()),
        )?;

        let identity = spec
            .identity
            .iter()
            .map(|decl| Ok((decl.name.as_str(), plan_identity(decl)?)))
            .collect::<Result<Vec<_>, TranslateError>>()?;

        let oidc = identity
            .iter()
            .filter(|(_, plan)| matches!(plan, IdentityPlan::Oidc { .. }))
            .map(|(name, _)| *name)
            .collect::<HashSet<_>>();
        let metadata = spec
            .metadata
            .iter()
            .map(|decl| Ok((decl.name.as_str(), plan_metadata(decl, &oidc, secrets)?)))
            .collect::<Result<Vec<_>, TranslateError>>()?;

        let authorization = spec
            .authorization
            .iter()
            .map(|decl| Ok((decl.name.as_str(), self.authorizer(decl)?)))
            .collect::<Result<Vec<_>, TranslateError>>()?;

        Ok(Plan {
            identity,
            metadata,
            authorization,
        })
    }

    async fn build(&self, plan: Plan<'_>) -> anyhow::Result<AuthPipeline> {
        let mut pipeline = AuthPipeline::builder().timeout(self.evaluation_timeout);

        let mut issuers = HashMap::new();
        for (name, plan) in plan.identity {
            let evaluator: Arc<dyn VerifyIdentity> = match plan {
                IdentityPlan::Oidc {
                    endpoint,
                    credentials,
                } => {
                    let oidc = Oidc::discover(endpoint, credentials, self.discovery.clone()).await?;
                    let oidc = Arc::new(oidc);
                    issuers.insert(name, oidc.clone());
                    oidc
                }
                IdentityPlan::Anonymous => Arc::new(Anonymous),
            };
            pipeline = pipeline.identity(name, evaluator);
        }

        for (name, plan) in plan.metadata {
            let evaluator: Arc<dyn FetchMetadata> = match plan {
                MetadataPlan::UserInfo { identity } => {
                    let oidc = issuers
                        .get(identity)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("identity {identity} was not built"))?;
                    Arc::new(UserInfo::new(identity, oidc, self.client.clone()))
                }
                MetadataPlan::Uma {
                    endpoint,
                    client_id,
                    client_secret,
                } => Arc::new(
                    Uma::discover(
                        endpoint,
                        client_id,
                        client_secret,
                        self.discovery.clone(),
                        self.client.clone(),
                    )
                    .await?,
                ),
            };
            pipeline = pipeline.metadata(name, evaluator);
        }

        for (name, evaluator) in plan.authorization {
            pipeline = pipeline.authorization(name, evaluator);
        }

        Ok(pipeline.build())
    }

    fn authorizer(&self, decl: &AuthorizationSpec) -> Result<Arc<dyn Authorize>, TranslateError> {
        let name = &decl.name;
        let mechanism = exactly_one(
            "authorization",
            name,
            [
                decl.cedar.as_ref().map(|c| Authorization::Cedar(&c.policy)),
                decl.json.as_ref().map(Authorization::Json),
                decl.kubernetes.as_ref().map(Authorization::Kubernetes),
            ],
        )?;

        let authorizer: Arc<dyn Authorize> = match mechanism {
            Authorization::Cedar(policy) => {
                Arc::new(CedarPolicy::new(policy).map_err(|source| TranslateError::Policy {
                    name: name.clone(),
                    source,
                })?)
            }
            Authorization::Json(json) => {
                let mode = match json.mode.as_deref() {
                    None | Some("all") => Mode::All,
                    Some("any") => Mode::Any,
                    Some(mode) => {
                        return Err(TranslateError::Mode {
                            name: name.clone(),
                            mode: mode.to_string(),
                        })
                    }
                };
                let rules = json
                    .rules
                    .iter()
                    .map(|r| Rule::new(&r.selector, &r.operator, &r.value))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|source| TranslateError::Rule {
                        name: name.clone(),
                        source,
                    })?;
                Arc::new(JsonRules::new(rules, mode))
            }
            Authorization::Kubernetes(spec) => Arc::new(self.access_review(name, spec)?),
        };
        Ok(authorizer)
    }

    fn access_review(
        &self,
        name: &str,
        spec: &KubernetesSpec,
    ) -> Result<SubjectAccessReviewAuthz, TranslateError> {
        let selector = |s: &str| {
            s.parse::<Selector>()
                .map_err(|source| TranslateError::Selector {
                    name: name.to_string(),
                    source,
                })
        };

        let user = selector(spec.user.as_deref().unwrap_or(DEFAULT_REVIEW_USER))?;
        let mut authz =
            SubjectAccessReviewAuthz::new(user, self.reviewer.clone(), self.review_timeout)
                .fail_closed(spec.fail_closed);
        if let Some(groups) = spec.groups.as_deref() {
            authz = authz.with_groups(selector(groups)?);
        }
        if let Some(attrs) = &spec.resource_attributes {
            authz = authz.with_resource(ResourceTemplate {
                namespace: attrs.namespace.clone(),
                group: attrs.group.clone(),
                resource: attrs.resource.clone(),
                name: attrs.name.clone(),
                subresource: attrs.subresource.clone(),
                verb: attrs.verb.clone(),
            });
        }
        Ok(authz)
    }
}

enum Metadata<'s> {
    UserInfo(&'s UserInfoSpec),
    Uma(&'s UmaSpec),
}

enum Authorization<'s> {
    Cedar(&'s str),
    Json(&'s JsonRulesSpec),
    Kubernetes(&'s KubernetesSpec),
}

fn plan_identity(decl: &IdentitySpec) -> Result<IdentityPlan<'_>, TranslateError> {
    let credentials = match &decl.credentials {
        None => Credentials::default(),
        Some(creds) => credentials(&decl.name, creds)?,
    };
    exactly_one(
        "identity",
        &decl.name,
        [
            decl.oidc.as_ref().map(|oidc| IdentityPlan::Oidc {
                endpoint: &oidc.endpoint,
                credentials: credentials.clone(),
            }),
            decl.anonymous.as_ref().map(|_| IdentityPlan::Anonymous),
        ],
    )
}

fn credentials(name: &str, spec: &CredentialsSpec) -> Result<Credentials, TranslateError> {
    let mut locations = [
        spec.authorization_header
            .as_ref()
            .map(|h| Credentials::AuthorizationHeader {
                prefix: h.prefix.clone().unwrap_or_else(|| "Bearer".to_string()),
            }),
        spec.custom_header
            .as_ref()
            .map(|h| Credentials::CustomHeader {
                name: h.name.clone(),
            }),
        spec.query_string
            .as_ref()
            .map(|q| Credentials::QueryString {
                name: q.name.clone(),
            }),
        spec.cookie.as_ref().map(|c| Credentials::Cookie {
            name: c.name.clone(),
        }),
    ]
    .into_iter()
    .flatten();

    let location = locations.next().unwrap_or_default();
    if locations.next().is_some() {
        return Err(TranslateError::Credentials(name.to_string()));
    }
    Ok(location)
}

fn plan_metadata<'s>(
    decl: &'s MetadataSpec,
    oidc: &HashSet<&str>,
    secrets: &Secrets,
) -> Result<MetadataPlan<'s>, TranslateError> {
    let mechanism = exactly_one(
        "metadata",
        &decl.name,
        [
            decl.user_info.as_ref().map(Metadata::UserInfo),
            decl.uma.as_ref().map(Metadata::Uma),
        ],
    )?;

    match mechanism {
        Metadata::UserInfo(spec) => {
            if !oidc.contains(spec.identity_source.as_str()) {
                return Err(TranslateError::UnknownIdentity {
                    name: decl.name.clone(),
                    identity: spec.identity_source.clone(),
                });
            }
            Ok(MetadataPlan::UserInfo {
                identity: &spec.identity_source,
            })
        }
        Metadata::Uma(spec) => {
            let secret = spec.credentials_ref.name.as_str();
            let value = |key: &'static str| {
                secrets
                    .get_str(secret, key)
                    .ok_or_else(|| TranslateError::SecretEncoding {
                        name: decl.name.clone(),
                        secret: secret.to_string(),
                        key,
                    })
            };
            Ok(MetadataPlan::Uma {
                endpoint: &spec.endpoint,
                client_id: value(UMA_CLIENT_ID)?,
                client_secret: value(UMA_CLIENT_SECRET)?,
            })
        }
    }
}

fn exactly_one<T>(
    stage: &'static str,
    name: &str,
    options: impl IntoIterator<Item = Option<T>>,
) -> Result<T, TranslateError> {
    let mut set = options.into_iter().flatten().collect::<Vec<_>>();
    if set.len() != 1 {
        return Err(TranslateError::Mechanisms {
            stage,
            name: name.to_string(),
            count: set.len(),
        });
    }
    Ok(set.remove(0))
}

fn unique_names<'s>(
    stage: &'static str,
    names: impl Iterator<Item = &'s str>,
) -> Result<(), TranslateError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(TranslateError::DuplicateName {
                stage,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

// === impl Secrets ===

impl Secrets {
    pub fn insert(&mut self, name: impl ToString, key: impl ToString, value: Vec<u8>) {
        self.0.insert((name.to_string(), key.to_string()), value);
    }

    /// Returns the value as a string, or `None` if it was not resolved or is not UTF-8.
    fn get_str(&self, name: &str, key: &str) -> Option<String> {
        let value = self.0.get(&(name.to_string(), key.to_string()))?;
        String::from_utf8(value.clone()).ok()
    }
}
