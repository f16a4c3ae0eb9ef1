//! Reconcilers for the Database CRD
//!
//! This module contains the business logic for reconciling each CRD type.
//! Reconcilers are responsible for:
//! - Validating and composing the desired dependent objects
//! - Applying them in dependency order
//! - Producing a report for status and retry scheduling

pub mod database;
