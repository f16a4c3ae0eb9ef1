//! Database Kubernetes Operator
//!
//! This operator watches `Database` custom resources and provisions a
//! credential store, storage claim, workload and network endpoint for each.

pub mod adapters;
pub mod applier;
pub mod backoff;
pub mod cluster;
pub mod composer;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod status;
pub mod watcher;

pub use error::{Error, Result};
