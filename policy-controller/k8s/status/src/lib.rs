#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Readiness reporting for `AuthConfig` resources.
//!
//! The reconciler computes the desired status and, when it differs from the observed one, queues a
//! merge patch. The [`Controller`] drains the queue and applies each patch with a timeout. Patch
//! failures are logged and counted; they never fail a reconcile.

mod conditions;
mod controller;


pub use self::{
    conditions::{diff, hosts_collision, invalid_spec, make_patch, reconciled, Reason},
    controller::{Controller, ControllerMetrics, Update},
};
