//! 3scale Kubernetes Operator
//!
//! Keeps Backend, Product and Api resources synchronized with a 3scale admin
//! portal, and backs up and restores APIManager installations.

pub mod adapters;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod diff;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod reconcilers;
pub mod remote;
pub mod tasks;

pub use error::{Error, Result};
