//! Per-namespace RBAC that lets FIS act on pods
//!
//! Every target namespace of a template gets a ServiceAccount, a Role and a
//! RoleBinding. Role and RoleBinding are named `fis-<template>`; the
//! ServiceAccount carries the name FIS is told to run as (`fis-<template>`
//! unless overridden). The RoleBinding binds the Role to the ServiceAccount
//! and to the Kubernetes user the FIS role is mapped to by its EKS access entry.
//!
//! Removal only touches objects labeled as ours, so a pre-existing
//! ServiceAccount named by an override survives template deletion.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use fis_common::kube_utils::{is_conflict, is_not_found};
use fis_common::naming::{access_name, access_username, template_label_value};
use fis_common::{Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE, TEMPLATE_LABEL};

/// Creates and removes the RBAC triple for one template in one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessProvisioner: Send + Sync {
    /// Create any missing objects; existing ones are left untouched
    async fn ensure(
        &self,
        namespace: &str,
        template: &str,
        service_account: &str,
    ) -> Result<(), Error>;

    /// Delete RoleBinding, Role and ServiceAccount in that order
    async fn remove(
        &self,
        namespace: &str,
        template: &str,
        service_account: &str,
    ) -> Result<(), Error>;
}

/// [`AccessProvisioner`] backed by the Kubernetes API
pub struct KubeAccessProvisioner {
    client: Client,
}

impl KubeAccessProvisioner {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn create_if_missing<K>(&self, namespace: &str, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => {
                info!(kind = %K::kind(&()), name = ?obj.meta().name, %namespace, "created");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_if_owned<K>(
        &self,
        namespace: &str,
        name: &str,
        template: &str,
    ) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let Some(existing) = api.get_opt(name).await? else {
            return Ok(());
        };
        if !is_owned(existing.meta(), template) {
            debug!(kind = %K::kind(&()), %name, %namespace, "not created by this template; left in place");
            return Ok(());
        }
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(kind = %K::kind(&()), %name, %namespace, "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AccessProvisioner for KubeAccessProvisioner {
    async fn ensure(
        &self,
        namespace: &str,
        template: &str,
        service_account_name: &str,
    ) -> Result<(), Error> {
        self.create_if_missing(
            namespace,
            &service_account(namespace, template, service_account_name),
        )
        .await?;
        self.create_if_missing(namespace, &role(namespace, template))
            .await?;
        self.create_if_missing(
            namespace,
            &role_binding(namespace, template, service_account_name),
        )
        .await
    }

    async fn remove(
        &self,
        namespace: &str,
        template: &str,
        service_account_name: &str,
    ) -> Result<(), Error> {
        let name = access_name(template);
        let mut first_error = None;

        let results = [
            self.delete_if_owned::<RoleBinding>(namespace, &name, template)
                .await,
            self.delete_if_owned::<Role>(namespace, &name, template)
                .await,
            self.delete_if_owned::<ServiceAccount>(namespace, service_account_name, template)
                .await,
        ];
        for result in results {
            if let Err(e) = result {
                warn!(%namespace, %name, error = %e, "failed to delete access object");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn labels(template: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (TEMPLATE_LABEL.to_string(), template_label_value(template)),
    ])
}

fn metadata(namespace: &str, name: String, template: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(template)),
        annotations: Some(BTreeMap::from([(
            TEMPLATE_LABEL.to_string(),
            template.to_string(),
        )])),
        ..Default::default()
    }
}

/// Created by this operator for this template
fn is_owned(meta: &ObjectMeta, template: &str) -> bool {
    let labels = meta.labels.as_ref();
    let label = |key: &str| labels.and_then(|l| l.get(key)).map(String::as_str);
    label(MANAGED_BY_LABEL) == Some(MANAGED_BY_VALUE)
        && label(TEMPLATE_LABEL) == Some(template_label_value(template).as_str())
}

fn rule(api_group: &str, resource: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// ServiceAccount FIS pod actions run as
pub fn service_account(namespace: &str, template: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(namespace, name.to_string(), template),
        ..Default::default()
    }
}

/// Role with the permissions the EKS pod actions need
pub fn role(namespace: &str, template: &str) -> Role {
    Role {
        metadata: metadata(namespace, access_name(template), template),
        rules: Some(vec![
            rule("", "configmaps", &["get", "create", "patch", "delete"]),
            rule(
                "",
                "pods",
                &["create", "list", "get", "delete", "deletecollection"],
            ),
            rule("", "pods/ephemeralcontainers", &["update"]),
            rule("", "pods/exec", &["create"]),
            rule("apps", "deployments", &["get"]),
        ]),
    }
}

/// RoleBinding granting the Role to the ServiceAccount and the access-entry user
pub fn role_binding(namespace: &str, template: &str, service_account: &str) -> RoleBinding {
    let name = access_name(template);
    RoleBinding {
        metadata: metadata(namespace, name.clone(), template),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![
            Subject {
                kind: "ServiceAccount".to_string(),
                name: service_account.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            Subject {
                kind: "User".to_string(),
                name: access_username(template),
                api_group: Some("rbac.authorization.k8s.io".to_string()),
                ..Default::default()
            },
        ]),
    }
}
