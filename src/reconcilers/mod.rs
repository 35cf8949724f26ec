//! Reconcilers for the 3scale capability and backup CRDs
//!
//! Controllers stay thin; the logic lives here:
//! - Entity-set synchronization of backends and products
//! - Status conditions
//! - Backup and restore pipelines
//! - Binding snapshots

pub mod backend;
pub mod backup;
pub mod binding;
pub mod entities;
pub mod jobs;
pub mod product;
pub mod resource;
pub mod restore;
pub mod status;
pub mod validation;
