//! Experiment controller
//!
//! Starts FIS experiments from an `Experiment` resource, once or on a cron
//! schedule, and mirrors the run state back into its status.

#![deny(missing_docs)]

pub mod controller;
pub mod history;
pub mod schedule;
pub mod store;

pub use controller::{error_policy, reconcile, ExperimentContext};
pub use schedule::CronSchedule;
pub use store::{ExperimentStore, KubeExperimentStore};
