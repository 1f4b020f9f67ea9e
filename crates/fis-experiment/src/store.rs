//! Reads and writes the experiment controller makes against Kubernetes

use async_trait::async_trait;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;

use fis_common::crd::{Experiment, ExperimentStatus, ExperimentTemplate};
use fis_common::kube_utils;
use fis_common::{Error, EXPERIMENT_FINALIZER};

/// Kubernetes access needed by the experiment controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Look up an ExperimentTemplate by name
    async fn get_template(&self, name: &str) -> Result<Option<ExperimentTemplate>, Error>;

    /// Add the cleanup finalizer, returning the new resourceVersion
    async fn add_finalizer(&self, name: &str) -> Result<Option<String>, Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Apply the status, returning the new resourceVersion
    async fn patch_status(
        &self,
        name: &str,
        resource_version: Option<String>,
        status: &ExperimentStatus,
    ) -> Result<Option<String>, Error>;
}

/// [`ExperimentStore`] backed by the Kubernetes API
pub struct KubeExperimentStore {
    experiments: Api<Experiment>,
    templates: Api<ExperimentTemplate>,
}

impl KubeExperimentStore {
    /// Create a store over the cluster-scoped FIS resources
    pub fn new(client: Client) -> Self {
        Self {
            experiments: Api::all(client.clone()),
            templates: Api::all(client),
        }
    }
}

#[async_trait]
impl ExperimentStore for KubeExperimentStore {
    async fn get_template(&self, name: &str) -> Result<Option<ExperimentTemplate>, Error> {
        Ok(self.templates.get_opt(name).await?)
    }

    async fn add_finalizer(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(kube_utils::add_finalizer(&self.experiments, name, EXPERIMENT_FINALIZER).await?)
    }

    async fn remove_finalizer(&self, name: &str) -> Result<(), Error> {
        Ok(kube_utils::remove_finalizer(&self.experiments, name, EXPERIMENT_FINALIZER).await?)
    }

    async fn patch_status(
        &self,
        name: &str,
        resource_version: Option<String>,
        status: &ExperimentStatus,
    ) -> Result<Option<String>, Error> {
        kube_utils::apply_status(&self.experiments, name, resource_version.as_deref(), status)
            .await
    }
}
