//! CRD generation and installation

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use fis_common::crd::{Experiment, ExperimentTemplate};
use fis_common::FIELD_MANAGER;

/// Every CRD this operator owns
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![ExperimentTemplate::crd(), Experiment::crd()]
}

/// Multi-document YAML for `--crd`
pub fn render_crds() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

/// Server-side apply both CRDs so they always match the running binary
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_names_are_cluster_scoped_in_api_group() {
        let names: Vec<_> = all_crds()
            .into_iter()
            .map(|crd| (crd.metadata.name.unwrap_or_default(), crd.spec.scope))
            .collect();
        assert_eq!(
            names,
            vec![
                ("experimenttemplates.fis.dev".to_string(), "Cluster".to_string()),
                ("experiments.fis.dev".to_string(), "Cluster".to_string()),
            ]
        );
    }

    #[test]
    fn test_rendered_yaml_has_two_documents() {
        let yaml = render_crds().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 2);
        assert!(yaml.contains("\n---\n"));
    }
}
