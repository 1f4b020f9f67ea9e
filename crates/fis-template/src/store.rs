//! Persistence of ExperimentTemplate finalizers and status

use async_trait::async_trait;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;

use fis_common::crd::{ExperimentTemplate, ExperimentTemplateStatus};
use fis_common::kube_utils;
use fis_common::{Error, TEMPLATE_FINALIZER};

/// Writes the template controller makes to its own resource
///
/// Every write that takes a resourceVersion fails with a conflict when the
/// object changed since it was read.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Add the cleanup finalizer, returning the new resourceVersion
    async fn add_finalizer(&self, name: &str) -> Result<Option<String>, Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Apply the status, returning the new resourceVersion
    async fn patch_status(
        &self,
        name: &str,
        resource_version: Option<String>,
        status: &ExperimentTemplateStatus,
    ) -> Result<Option<String>, Error>;
}

/// [`TemplateStore`] backed by the Kubernetes API
pub struct KubeTemplateStore {
    api: Api<ExperimentTemplate>,
}

impl KubeTemplateStore {
    /// Create a store for the cluster-scoped ExperimentTemplate resource
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl TemplateStore for KubeTemplateStore {
    async fn add_finalizer(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(kube_utils::add_finalizer(&self.api, name, TEMPLATE_FINALIZER).await?)
    }

    async fn remove_finalizer(&self, name: &str) -> Result<(), Error> {
        Ok(kube_utils::remove_finalizer(&self.api, name, TEMPLATE_FINALIZER).await?)
    }

    async fn patch_status(
        &self,
        name: &str,
        resource_version: Option<String>,
        status: &ExperimentTemplateStatus,
    ) -> Result<Option<String>, Error> {
        kube_utils::apply_status(&self.api, name, resource_version.as_deref(), status).await
    }
}
