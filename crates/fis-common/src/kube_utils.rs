//! Shared Kubernetes helpers for the cluster-scoped FIS CRDs
//!
//! Finalizer edits and status writes both carry the `resourceVersion` they
//! were computed from, so a concurrent change makes the write fail with 409
//! and the whole reconcile runs again.

use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::FIELD_MANAGER;

/// True when the API error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the API error is a 409 (already exists or write conflict)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Check whether an object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Add a finalizer, returning the resulting resourceVersion
pub async fn add_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
) -> Result<Option<String>, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let obj = api.get(name).await?;
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(obj.meta().resource_version.clone());
    }
    finalizers.push(finalizer.to_string());

    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    let updated = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(name = %name, finalizer = %finalizer, "added finalizer");
    Ok(updated.meta().resource_version.clone())
}

/// Remove a finalizer. A missing object counts as success.
pub async fn remove_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let obj = match api.get(name).await {
        Ok(obj) => obj,
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e),
    };

    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Server-side apply body for a status write
///
/// Fields this manager set earlier and no longer sends are removed by the
/// API server, so clearing an `Option` in the status struct clears it in the
/// object too.
pub fn status_apply_patch<K>(
    name: &str,
    resource_version: Option<&str>,
    status: &impl Serialize,
) -> Result<Value, serde_json::Error>
where
    K: Resource<DynamicType = ()>,
{
    let mut metadata = Map::new();
    metadata.insert("name".to_string(), Value::String(name.to_string()));
    if let Some(rv) = resource_version {
        metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
    }

    Ok(json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "metadata": metadata,
        "status": serde_json::to_value(status)?,
    }))
}

/// Apply the status subresource, returning the resulting resourceVersion
pub async fn apply_status<K>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    status: &impl Serialize,
) -> Result<Option<String>, crate::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let patch = status_apply_patch::<K>(name, resource_version, status)?;
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let updated = api.patch_status(name, &params, &Patch::Apply(&patch)).await?;
    Ok(updated.meta().resource_version.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExperimentTemplate, ExperimentTemplateStatus, TemplatePhase};
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(500)));
    }

    #[test]
    fn test_has_finalizer() {
        let mut tpl = ExperimentTemplate::new(
            "web",
            serde_json::from_value(serde_json::json!({"targets": [], "actions": []})).unwrap(),
        );
        assert!(!has_finalizer(&tpl, crate::TEMPLATE_FINALIZER));
        tpl.metadata.finalizers = Some(vec![crate::TEMPLATE_FINALIZER.to_string()]);
        assert!(has_finalizer(&tpl, crate::TEMPLATE_FINALIZER));
        assert!(!has_finalizer(&tpl, crate::EXPERIMENT_FINALIZER));
    }

    #[test]
    fn test_status_patch_carries_type_meta_and_resource_version() {
        let status = ExperimentTemplateStatus {
            phase: TemplatePhase::Ready,
            template_id: Some("EXT1".to_string()),
            ..Default::default()
        };
        let patch = status_apply_patch::<ExperimentTemplate>("web", Some("42"), &status).unwrap();
        assert_eq!(patch["apiVersion"], "fis.dev/v1alpha1");
        assert_eq!(patch["kind"], "ExperimentTemplate");
        assert_eq!(patch["metadata"]["name"], "web");
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["phase"], "Ready");
        assert_eq!(patch["status"]["templateId"], "EXT1");
    }

    #[test]
    fn test_status_patch_without_resource_version() {
        let status = ExperimentTemplateStatus::default();
        let patch = status_apply_patch::<ExperimentTemplate>("web", None, &status).unwrap();
        assert!(patch["metadata"].get("resourceVersion").is_none());
        assert_eq!(patch["status"]["phase"], "Pending");
    }
}
