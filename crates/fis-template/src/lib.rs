//! ExperimentTemplate controller
//!
//! Keeps an AWS FIS experiment template, the IAM role FIS assumes, the EKS
//! access entry for that role and per-namespace RBAC in sync with each
//! `ExperimentTemplate` resource.

#![deny(missing_docs)]

pub mod access;
mod cleanup;
pub mod controller;
pub mod store;

pub use access::{AccessProvisioner, KubeAccessProvisioner};
pub use controller::{error_policy, reconcile, TemplateContext};
pub use store::{KubeTemplateStore, TemplateStore};
