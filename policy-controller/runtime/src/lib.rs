#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use authpolicy_controller_core as core;
pub use authpolicy_controller_evaluators as evaluators;
pub use authpolicy_controller_k8s_api as k8s;
pub use authpolicy_controller_k8s_index as index;
pub use authpolicy_controller_k8s_status as status;

mod args;
mod driver;
mod reconcile;
mod store;
mod translate;


pub use self::{
    args::Args,
    driver::{Backoff, Driver, Reconcile},
    reconcile::{Error, ReconcileMetrics, Reconciler, Requeue},
    store::{AuthConfigStore, KubeStore, SecretAccessor, SecretError},
    translate::{secret_keys, Secrets, TranslateError, Translator},
};
