//! Operator-wide settings and per-resource override resolution
//!
//! Three values can be supplied at several layers. The first non-empty one
//! wins, in this order:
//!
//! | Value              | Environment           | Annotation                    | Flag                   |
//! |--------------------|-----------------------|-------------------------------|------------------------|
//! | Role ARN           | `FIS_ROLE_ARN`        | `fis.dev/role-arn`            | `--role-arn`           |
//! | Cluster identifier | `CLUSTER_IDENTIFIER`  | `fis.dev/cluster-identifier`  | `--cluster-identifier` |
//! | Service account    | `FIS_SERVICE_ACCOUNT` | `fis.dev/service-account`     | `--service-account`    |
//!
//! After the flag layer come the status cache (roles) or a derived default
//! (service account).

use std::collections::BTreeMap;

use crate::naming;

/// Environment variable overriding the FIS role for every template
pub const ROLE_ARN_ENV: &str = "FIS_ROLE_ARN";

/// Environment variable overriding the EKS cluster identifier
pub const CLUSTER_IDENTIFIER_ENV: &str = "CLUSTER_IDENTIFIER";

/// Environment variable overriding the Kubernetes service account used by FIS
pub const SERVICE_ACCOUNT_ENV: &str = "FIS_SERVICE_ACCOUNT";

/// Annotation overriding the FIS role on one template
pub const ROLE_ARN_ANNOTATION: &str = "fis.dev/role-arn";

/// Annotation overriding the cluster identifier on one template
pub const CLUSTER_IDENTIFIER_ANNOTATION: &str = "fis.dev/cluster-identifier";

/// Annotation overriding the service account on one template
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "fis.dev/service-account";

/// Values read from the process environment at startup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `FIS_ROLE_ARN`
    pub role_arn: Option<String>,
    /// `CLUSTER_IDENTIFIER`
    pub cluster_identifier: Option<String>,
    /// `FIS_SERVICE_ACCOUNT`
    pub service_account: Option<String>,
}

impl EnvOverrides {
    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            role_arn: lookup(ROLE_ARN_ENV),
            cluster_identifier: lookup(CLUSTER_IDENTIFIER_ENV),
            service_account: lookup(SERVICE_ACCOUNT_ENV),
        }
    }
}

/// Controller-wide settings shared by every reconcile
#[derive(Clone, Debug, Default)]
pub struct OperatorSettings {
    /// Environment layer
    pub env: EnvOverrides,
    /// `--role-arn`
    pub role_arn: Option<String>,
    /// `--cluster-identifier`, or the ARN resolved from `--cluster-name`
    pub cluster_identifier: Option<String>,
    /// `--service-account`
    pub service_account: Option<String>,
    /// EKS cluster name used for access entries. Access entries are skipped when unset.
    pub eks_cluster_name: Option<String>,
}

impl OperatorSettings {
    /// Role supplied from outside the operator, if any.
    ///
    /// A role set in the template spec outranks every override layer. Roles
    /// returned here are caller-owned and never deleted.
    pub fn external_role_arn(
        &self,
        spec_role_arn: Option<&str>,
        annotations: &BTreeMap<String, String>,
    ) -> Option<String> {
        first_non_empty([
            spec_role_arn,
            self.env.role_arn.as_deref(),
            annotation(annotations, ROLE_ARN_ANNOTATION),
            self.role_arn.as_deref(),
        ])
    }

    /// Cluster identifier passed to FIS as the target cluster
    pub fn cluster_identifier(&self, annotations: &BTreeMap<String, String>) -> Option<String> {
        first_non_empty([
            self.env.cluster_identifier.as_deref(),
            annotation(annotations, CLUSTER_IDENTIFIER_ANNOTATION),
            self.cluster_identifier.as_deref(),
        ])
    }

    /// Service account FIS runs as inside target namespaces
    pub fn service_account(
        &self,
        annotations: &BTreeMap<String, String>,
        template_name: &str,
    ) -> String {
        first_non_empty([
            self.env.service_account.as_deref(),
            annotation(annotations, SERVICE_ACCOUNT_ANNOTATION),
            self.service_account.as_deref(),
        ])
        .unwrap_or_else(|| naming::access_name(template_name))
    }
}

fn annotation<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations.get(key).map(String::as_str)
}

/// First candidate that is present and not blank, trimmed
pub fn first_non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}
