//! Custom Resource Definitions for the 3scale Operator

mod apimanager;
mod backend;
mod binding;
pub mod common;
mod product;

pub use apimanager::*;
pub use backend::*;
pub use binding::*;
pub use common::{
    Condition, Conditions, LocalObjectReference, MappingRuleSpec, MethodSpec, MetricSpec,
    SyncStatus,
};
pub use product::*;

use kube::CustomResourceExt;

/// Generate YAML manifests for the CRDs owned by this operator
pub fn generate_crds() -> Vec<String> {
    vec![
        serde_yaml::to_string(&Backend::crd()).unwrap(),
        serde_yaml::to_string(&Product::crd()).unwrap(),
        serde_yaml::to_string(&Api::crd()).unwrap(),
        serde_yaml::to_string(&Binding::crd()).unwrap(),
        serde_yaml::to_string(&APIManagerBackup::crd()).unwrap(),
        serde_yaml::to_string(&APIManagerRestore::crd()).unwrap(),
    ]
}
