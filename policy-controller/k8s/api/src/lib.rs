#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth_config;

pub use self::auth_config::{AuthConfig, AuthConfigSpec, AuthConfigStatus};
pub use k8s_openapi::{
    api::{self, core::v1::Secret},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client, Error, Resource,
};
