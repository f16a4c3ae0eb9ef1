//! Kubernetes controllers for the Database CRD
//!
//! This module contains the controller that watches for CRD changes and
//! dispatches reconciliation work.

mod database_controller;

pub use database_controller::{run as run_database_controller, Dispatcher, DispatcherConfig};

use std::sync::Arc;

use crate::adapters::CredentialPolicy;
use crate::applier::Applier;
use crate::cluster::ClusterApi;
use crate::status::StatusSink;

/// Shared context for reconciliation workers
pub struct Context {
    /// Applies dependent objects against the cluster
    pub applier: Applier,
    /// Supplies credential store contents
    pub credentials: Arc<dyn CredentialPolicy>,
    /// Receives every reconciliation report
    pub status: Arc<dyn StatusSink>,
}

impl Context {
    /// Create a new context
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        credentials: Arc<dyn CredentialPolicy>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            applier: Applier::new(cluster),
            credentials,
            status,
        }
    }
}
