//! IAM role that FIS assumes when it runs an experiment

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_iam::types::Tag;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info, warn};

use fis_common::naming::role_policy_name;
use fis_common::{Error, MANAGED_BY_VALUE, TEMPLATE_LABEL};

use crate::aws::{build_error, sdk_error};

const SERVICE: &str = "iam";

/// Everything needed to create the FIS role
#[derive(Clone, Debug, PartialEq)]
pub struct RoleRequest {
    /// Role name
    pub role_name: String,
    /// Trust policy document (JSON)
    pub assume_role_policy: String,
    /// Human readable description
    pub description: String,
    /// Ownership tags
    pub tags: BTreeMap<String, String>,
}

/// Operations on IAM roles and their inline policies
///
/// Missing entities are tolerated on every delete.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait IamApi: Send + Sync {
    /// ARN of the role, `None` if it does not exist
    async fn get_role_arn(&self, role_name: &str) -> Result<Option<String>, Error>;

    /// Create the role, returning its ARN; an existing role is returned as-is
    async fn create_role(&self, request: &RoleRequest) -> Result<String, Error>;

    /// Create or replace an inline policy
    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), Error>;

    /// Names of the role's inline policies
    async fn list_role_policies(&self, role_name: &str) -> Result<Vec<String>, Error>;

    /// Delete an inline policy
    async fn delete_role_policy(&self, role_name: &str, policy_name: &str) -> Result<(), Error>;

    /// Delete the role itself
    async fn delete_role(&self, role_name: &str) -> Result<(), Error>;
}

/// [`IamApi`] backed by the AWS SDK
#[derive(Clone, Debug)]
pub struct IamClient {
    client: aws_sdk_iam::Client,
}

impl IamClient {
    /// Create a client from shared SDK configuration
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_iam::Client::new(config),
        }
    }
}

#[async_trait]
impl IamApi for IamClient {
    async fn get_role_arn(&self, role_name: &str) -> Result<Option<String>, Error> {
        match self.client.get_role().role_name(role_name).send().await {
            Ok(out) => Ok(out.role().map(|r| r.arn().to_string())),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_no_such_entity_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(sdk_error(SERVICE, "GetRole", e)),
        }
    }

    async fn create_role(&self, request: &RoleRequest) -> Result<String, Error> {
        const OP: &str = "CreateRole";

        let tags = request
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| build_error(SERVICE, OP, e))?;

        let result = self
            .client
            .create_role()
            .role_name(&request.role_name)
            .assume_role_policy_document(&request.assume_role_policy)
            .description(&request.description)
            .set_tags(Some(tags))
            .send()
            .await;

        match result {
            Ok(out) => {
                let arn = out
                    .role()
                    .map(|r| r.arn().to_string())
                    .ok_or_else(|| Error::provider(SERVICE, OP, "response did not include a role"))?;
                info!(role = %request.role_name, %arn, "created IAM role");
                Ok(arn)
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_entity_already_exists_exception()) =>
            {
                debug!(role = %request.role_name, "IAM role already exists");
                self.get_role_arn(&request.role_name).await?.ok_or_else(|| {
                    Error::provider(SERVICE, OP, "role reported as existing but not found")
                })
            }
            Err(e) => Err(sdk_error(SERVICE, OP, e)),
        }
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<(), Error> {
        self.client
            .put_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, "PutRolePolicy", e))?;
        Ok(())
    }

    async fn list_role_policies(&self, role_name: &str) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let result = self
                .client
                .list_role_policies()
                .role_name(role_name)
                .set_marker(marker.take())
                .send()
                .await;

            let out = match result {
                Ok(out) => out,
                Err(e)
                    if e.as_service_error()
                        .is_some_and(|se| se.is_no_such_entity_exception()) =>
                {
                    return Ok(names);
                }
                Err(e) => return Err(sdk_error(SERVICE, "ListRolePolicies", e)),
            };

            names.extend(out.policy_names().iter().cloned());
            match out.marker() {
                Some(m) if out.is_truncated() => marker = Some(m.to_string()),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn delete_role_policy(&self, role_name: &str, policy_name: &str) -> Result<(), Error> {
        match self
            .client
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_no_such_entity_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error(SERVICE, "DeleteRolePolicy", e)),
        }
    }

    async fn delete_role(&self, role_name: &str) -> Result<(), Error> {
        match self.client.delete_role().role_name(role_name).send().await {
            Ok(_) => {
                info!(role = %role_name, "deleted IAM role");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_no_such_entity_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error(SERVICE, "DeleteRole", e)),
        }
    }
}

/// Trust policy letting the FIS service assume the role
pub fn trust_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "fis.amazonaws.com" },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// Inline permissions FIS needs for EKS pod actions and experiment logging
pub fn permissions_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["eks:DescribeCluster", "eks:ListClusters"],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": "iam:PassRole",
                "Resource": "*",
                "Condition": {
                    "StringEquals": { "iam:PassedToService": "fis.amazonaws.com" }
                }
            },
            {
                "Effect": "Allow",
                "Action": [
                    "logs:CreateLogDelivery",
                    "logs:PutResourcePolicy",
                    "logs:DescribeResourcePolicies",
                    "logs:DescribeLogGroups"
                ],
                "Resource": "*"
            }
        ]
    })
    .to_string()
}

/// Build the create request for a template's role
pub fn role_request(role_name: &str, template: &str) -> RoleRequest {
    RoleRequest {
        role_name: role_name.to_string(),
        assume_role_policy: trust_policy(),
        description: format!("FIS experiment role for template {}", template),
        tags: BTreeMap::from([
            ("ManagedBy".to_string(), MANAGED_BY_VALUE.to_string()),
            (TEMPLATE_LABEL.to_string(), template.to_string()),
        ]),
    }
}

/// Make sure the role exists and carries the current inline policy
///
/// Returns the role ARN. The policy is re-applied even when the role already
/// existed so permission changes roll out on the next reconcile.
pub async fn ensure_fis_role(
    iam: &dyn IamApi,
    role_name: &str,
    template: &str,
) -> Result<String, Error> {
    let arn = match iam.get_role_arn(role_name).await? {
        Some(arn) => arn,
        None => iam.create_role(&role_request(role_name, template)).await?,
    };

    iam.put_role_policy(role_name, &role_policy_name(role_name), &permissions_policy())
        .await?;
    Ok(arn)
}

/// Delete every inline policy and then the role
pub async fn delete_fis_role(iam: &dyn IamApi, role_name: &str) -> Result<(), Error> {
    for policy in iam.list_role_policies(role_name).await? {
        if let Err(e) = iam.delete_role_policy(role_name, &policy).await {
            warn!(role = %role_name, %policy, error = %e, "failed to delete inline policy");
        }
    }
    iam.delete_role(role_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use mockall::Sequence;

    const ARN: &str = "arn:aws:iam::123456789012:role/fis-chaos";

    #[test]
    fn test_trust_policy_names_fis_principal() {
        let doc: serde_json::Value = serde_json::from_str(&trust_policy()).unwrap();
        let statement = &doc["Statement"][0];
        assert_eq!(statement["Principal"]["Service"], "fis.amazonaws.com");
        assert_eq!(statement["Action"], "sts:AssumeRole");
    }

    #[test]
    fn test_permissions_policy_limits_pass_role_to_fis() {
        let doc: serde_json::Value = serde_json::from_str(&permissions_policy()).unwrap();
        let pass_role = doc["Statement"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["Action"] == "iam:PassRole")
            .unwrap();
        assert_eq!(
            pass_role["Condition"]["StringEquals"]["iam:PassedToService"],
            "fis.amazonaws.com"
        );
    }

    #[test]
    fn test_role_request_carries_ownership_tags() {
        let req = role_request("fis-chaos", "chaos");
        assert_eq!(req.tags.get("ManagedBy").map(String::as_str), Some("fis-operator"));
        assert_eq!(req.tags.get("fis.dev/template").map(String::as_str), Some("chaos"));
    }

    #[tokio::test]
    async fn story_existing_role_is_reused_and_policy_refreshed() {
        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn()
            .with(eq("fis-chaos"))
            .returning(|_| Ok(Some(ARN.to_string())));
        iam.expect_create_role().never();
        iam.expect_put_role_policy()
            .withf(|role, policy, _| role == "fis-chaos" && policy == "fis-chaos-policy")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let arn = ensure_fis_role(&iam, "fis-chaos", "chaos").await.unwrap();
        assert_eq!(arn, ARN);
    }

    #[tokio::test]
    async fn story_missing_role_is_created() {
        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn().returning(|_| Ok(None));
        iam.expect_create_role()
            .withf(|req| req.role_name == "fis-chaos")
            .times(1)
            .returning(|_| Ok(ARN.to_string()));
        iam.expect_put_role_policy().returning(|_, _, _| Ok(()));

        assert_eq!(ensure_fis_role(&iam, "fis-chaos", "chaos").await.unwrap(), ARN);
    }

    #[tokio::test]
    async fn story_role_deletion_removes_policies_first() {
        let mut seq = Sequence::new();
        let mut iam = MockIamApi::new();
        iam.expect_list_role_policies()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec!["fis-chaos-policy".to_string()]));
        iam.expect_delete_role_policy()
            .with(eq("fis-chaos"), eq("fis-chaos-policy"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        iam.expect_delete_role()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        delete_fis_role(&iam, "fis-chaos").await.unwrap();
    }
}
