//! AWS side of the FIS operator
//!
//! Each AWS service sits behind a small async trait so the controllers can
//! be tested with mocks:
//! - [`fis::FisApi`]: experiment templates and experiments
//! - [`iam::IamApi`]: the role FIS assumes
//! - [`eks::EksApi`]: access entries granting that role cluster access
//!
//! [`converter`] turns CRD specs into the request models these traits take.

#![deny(missing_docs)]

pub mod aws;
pub mod converter;
pub mod eks;
pub mod fis;
pub mod iam;

pub use eks::{EksApi, EksClient};
pub use fis::{ExperimentSummary, FisApi, FisClient, ProviderExperiment, ProviderTemplate};
pub use iam::{IamApi, IamClient};

#[cfg(any(test, feature = "mock"))]
pub use eks::MockEksApi;
#[cfg(any(test, feature = "mock"))]
pub use fis::MockFisApi;
#[cfg(any(test, feature = "mock"))]
pub use iam::MockIamApi;
