//! Adapters between the operator core and its external collaborators

mod credentials;
mod kube_cluster;

pub use credentials::*;
pub use kube_cluster::*;
