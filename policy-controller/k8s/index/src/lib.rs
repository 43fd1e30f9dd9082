//! Routes request hosts to the authorization pipelines that protect them.
//!
//! The index holds two maps: each claimed host to the policy that owns it, and each policy to
//! its most recently published pipeline. A host has at most one owner; a later claim by another
//! policy is reported as a collision and leaves the existing owner in place.
//!
//! Lookups take a read lock and clone out an `Arc` of the pipeline, so evaluation never holds the
//! lock.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;


pub use self::index::Index;
