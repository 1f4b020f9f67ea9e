//! EKS access entries that map the FIS role to a Kubernetes user

use async_trait::async_trait;
use aws_config::SdkConfig;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tracing::{debug, info, warn};

use fis_common::retry::{retry_with_linear_backoff, RetryConfig};
use fis_common::Error;

use crate::aws::sdk_error;

const SERVICE: &str = "eks";

/// Access entry operations on a single EKS cluster
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait EksApi: Send + Sync {
    /// Whether an access entry exists for the principal
    async fn access_entry_exists(&self, cluster: &str, principal_arn: &str)
        -> Result<bool, Error>;

    /// Create a STANDARD access entry; an existing entry counts as success
    async fn create_access_entry(
        &self,
        cluster: &str,
        principal_arn: &str,
        username: &str,
    ) -> Result<(), Error>;

    /// Delete the access entry; a missing entry counts as success
    async fn delete_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<(), Error>;

    /// ARN of the cluster, used as the FIS cluster identifier
    async fn describe_cluster_arn(&self, cluster: &str) -> Result<String, Error>;
}

/// [`EksApi`] backed by the AWS SDK
#[derive(Clone, Debug)]
pub struct EksClient {
    client: aws_sdk_eks::Client,
}

impl EksClient {
    /// Create a client from shared SDK configuration
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_eks::Client::new(config),
        }
    }
}

#[async_trait]
impl EksApi for EksClient {
    async fn access_entry_exists(
        &self,
        cluster: &str,
        principal_arn: &str,
    ) -> Result<bool, Error> {
        match self
            .client
            .describe_access_entry()
            .cluster_name(cluster)
            .principal_arn(principal_arn)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(sdk_error(SERVICE, "DescribeAccessEntry", e)),
        }
    }

    async fn create_access_entry(
        &self,
        cluster: &str,
        principal_arn: &str,
        username: &str,
    ) -> Result<(), Error> {
        match self
            .client
            .create_access_entry()
            .cluster_name(cluster)
            .principal_arn(principal_arn)
            .username(username)
            .r#type("STANDARD")
            .send()
            .await
        {
            Ok(_) => {
                info!(%cluster, principal = %principal_arn, "created EKS access entry");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_in_use_exception()) =>
            {
                debug!(%cluster, principal = %principal_arn, "EKS access entry already exists");
                Ok(())
            }
            Err(e) => Err(sdk_error(SERVICE, "CreateAccessEntry", e)),
        }
    }

    async fn delete_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<(), Error> {
        match self
            .client
            .delete_access_entry()
            .cluster_name(cluster)
            .principal_arn(principal_arn)
            .send()
            .await
        {
            Ok(_) => {
                info!(%cluster, principal = %principal_arn, "deleted EKS access entry");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error(SERVICE, "DeleteAccessEntry", e)),
        }
    }

    async fn describe_cluster_arn(&self, cluster: &str) -> Result<String, Error> {
        const OP: &str = "DescribeCluster";

        let out = self
            .client
            .describe_cluster()
            .name(cluster)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, OP, e))?;
        out.cluster()
            .and_then(|c| c.arn())
            .map(str::to_string)
            .ok_or_else(|| Error::provider(SERVICE, OP, "cluster has no ARN"))
    }
}

/// Ensure an access entry exists, retrying while a fresh IAM role propagates
///
/// Exhausting the retries is logged and swallowed; the next reconcile tries
/// again.
pub async fn ensure_access_entry(
    eks: &dyn EksApi,
    cluster: &str,
    principal_arn: &str,
    username: &str,
    retry: &RetryConfig,
) {
    let result = retry_with_linear_backoff(retry, "ensure_access_entry", || async move {
        if eks.access_entry_exists(cluster, principal_arn).await? {
            return Ok(());
        }
        eks.create_access_entry(cluster, principal_arn, username).await
    })
    .await;

    if let Err(e) = result {
        warn!(
            %cluster,
            principal = %principal_arn,
            error = %e,
            "EKS access entry not ensured; experiments may lack cluster access"
        );
    }
}

/// Remove the access entry if present
pub async fn remove_access_entry(
    eks: &dyn EksApi,
    cluster: &str,
    principal_arn: &str,
) -> Result<(), Error> {
    if !eks.access_entry_exists(cluster, principal_arn).await? {
        return Ok(());
    }
    eks.delete_access_entry(cluster, principal_arn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CLUSTER: &str = "prod";
    const ROLE: &str = "arn:aws:iam::123456789012:role/fis-chaos";

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            step: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn story_existing_entry_is_left_alone() {
        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(true));
        eks.expect_create_access_entry().never();

        ensure_access_entry(&eks, CLUSTER, ROLE, "fis-chaos", &fast_retry(3)).await;
    }

    #[tokio::test]
    async fn story_propagation_delay_is_retried_until_success() {
        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(false));
        let mut calls = 0;
        eks.expect_create_access_entry()
            .times(2)
            .returning(move |_, _, _| {
                calls += 1;
                if calls == 1 {
                    Err(Error::provider("eks", "CreateAccessEntry", "role not found yet"))
                } else {
                    Ok(())
                }
            });

        ensure_access_entry(&eks, CLUSTER, ROLE, "fis-chaos", &fast_retry(3)).await;
    }

    #[tokio::test]
    async fn story_exhausted_retries_are_swallowed() {
        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(false));
        eks.expect_create_access_entry()
            .times(3)
            .returning(|_, _, _| Err(Error::provider("eks", "CreateAccessEntry", "denied")));

        ensure_access_entry(&eks, CLUSTER, ROLE, "fis-chaos", &fast_retry(3)).await;
    }

    #[tokio::test]
    async fn story_missing_entry_skips_delete() {
        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(false));
        eks.expect_delete_access_entry().never();

        remove_access_entry(&eks, CLUSTER, ROLE).await.unwrap();
    }
}
