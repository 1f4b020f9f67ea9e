//! Deletion of everything a template created outside Kubernetes' own GC
//!
//! Each step is attempted even when an earlier one fails; failures are
//! logged and the finalizer is removed regardless.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, warn};

use fis_common::crd::{ExperimentTemplate, TemplatePhase};
use fis_common::kube_utils::has_finalizer;
use fis_common::naming::role_name_from_arn;
use fis_common::{Error, TEMPLATE_FINALIZER};
use fis_provider::eks::remove_access_entry;
use fis_provider::iam::delete_fis_role;

use crate::controller::{cleanup_namespaces, TemplateContext};

pub(crate) async fn delete(
    template: &ExperimentTemplate,
    ctx: &TemplateContext,
) -> Result<Action, Error> {
    if !has_finalizer(template, TEMPLATE_FINALIZER) {
        return Ok(Action::await_change());
    }

    let name = template.name_any();
    let status = template.status.clone().unwrap_or_default();
    info!("cleaning up experiment template");

    if status.phase != TemplatePhase::Deleting {
        let mut deleting = status.clone();
        deleting.phase = TemplatePhase::Deleting;
        deleting.message = Some("cleaning up FIS resources".to_string());
        if let Err(e) = ctx
            .store
            .patch_status(&name, template.resource_version(), &deleting)
            .await
        {
            warn!(error = %e, "failed to record Deleting phase");
        }
    }

    if let Some(id) = &status.template_id {
        if let Err(e) = ctx.fis.delete_template(id).await {
            warn!(template_id = %id, error = %e, "failed to delete FIS experiment template");
        }
    }

    if let (Some(role_arn), Some(cluster)) = (
        status.role_arn.as_deref(),
        ctx.settings.eks_cluster_name.as_deref(),
    ) {
        if let Err(e) = remove_access_entry(ctx.eks.as_ref(), cluster, role_arn).await {
            warn!(role = %role_arn, error = %e, "failed to delete EKS access entry");
        }
    }

    // caller-supplied roles are never deleted
    if status.role_managed {
        match status.role_arn.as_deref().and_then(role_name_from_arn) {
            Some(role_name) => {
                if let Err(e) = delete_fis_role(ctx.iam.as_ref(), role_name).await {
                    warn!(role = %role_name, error = %e, "failed to delete FIS role");
                }
            }
            None => warn!(role = ?status.role_arn, "cannot derive role name from ARN"),
        }
    }

    let service_account = status
        .service_account
        .clone()
        .unwrap_or_else(|| ctx.settings.service_account(template.annotations(), &name));
    for namespace in cleanup_namespaces(template) {
        if let Err(e) = ctx
            .access
            .remove(&namespace, &name, &service_account)
            .await
        {
            warn!(%namespace, error = %e, "failed to remove namespace access");
        }
    }

    ctx.store.remove_finalizer(&name).await?;
    info!("experiment template cleaned up");
    Ok(Action::await_change())
}
