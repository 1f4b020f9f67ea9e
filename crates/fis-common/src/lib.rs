//! Common types for the FIS operator: CRDs, configuration overrides, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod naming;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all FIS operator CRDs
pub const API_GROUP: &str = "fis.dev";

/// Field manager used for every write the operator performs
pub const FIELD_MANAGER: &str = "fis-operator";

/// Finalizer guarding ExperimentTemplate cleanup
pub const TEMPLATE_FINALIZER: &str = "fis.dev/template-cleanup";

/// Finalizer guarding Experiment cleanup
pub const EXPERIMENT_FINALIZER: &str = "fis.dev/experiment-cleanup";

/// Standard Kubernetes managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label and tag on everything the operator creates
pub const MANAGED_BY_VALUE: &str = "fis-operator";

/// Label recording which ExperimentTemplate owns a namespaced object
pub const TEMPLATE_LABEL: &str = "fis.dev/template";
