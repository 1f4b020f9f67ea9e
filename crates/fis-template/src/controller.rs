//! ExperimentTemplate reconciliation
//!
//! Creation is a saga: role, RBAC, FIS template, access entry. Every step
//! that produces an external id is persisted before the next one runs, so an
//! interrupted reconcile picks up where it stopped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use fis_common::config::OperatorSettings;
use fis_common::crd::{
    set_condition, Condition, ConditionStatus, ExperimentTemplate, ExperimentTemplateStatus,
    TemplatePhase, CONDITION_READY, CONDITION_STALLED,
};
use fis_common::kube_utils::has_finalizer;
use fis_common::naming;
use fis_common::retry::RetryConfig;
use fis_common::{Error, TEMPLATE_FINALIZER};
use fis_provider::converter::{build_template_request, ConversionInputs};
use fis_provider::eks::ensure_access_entry;
use fis_provider::iam::{delete_fis_role, ensure_fis_role};
use fis_provider::{EksApi, FisApi, IamApi};

use crate::access::{AccessProvisioner, KubeAccessProvisioner};
use crate::cleanup;
use crate::store::{KubeTemplateStore, TemplateStore};

/// Requeue delay after a retryable reconcile error
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Requeue delay after a permanent reconcile error
pub const PERMANENT_ERROR_DELAY: Duration = Duration::from_secs(300);

/// Shared state for every template reconcile
pub struct TemplateContext {
    /// Finalizer and status writes
    pub store: Arc<dyn TemplateStore>,
    /// Namespace RBAC
    pub access: Arc<dyn AccessProvisioner>,
    /// FIS client
    pub fis: Arc<dyn FisApi>,
    /// IAM client
    pub iam: Arc<dyn IamApi>,
    /// EKS client, used only when a cluster name is configured
    pub eks: Arc<dyn EksApi>,
    /// Operator-wide overrides
    pub settings: Arc<OperatorSettings>,
    /// Retry used for the access entry of a role created in the same reconcile
    pub access_entry_retry: RetryConfig,
}

impl TemplateContext {
    /// Build a context from a Kubernetes client and the shared AWS clients
    pub fn new(
        client: Client,
        fis: Arc<dyn FisApi>,
        iam: Arc<dyn IamApi>,
        eks: Arc<dyn EksApi>,
        settings: Arc<OperatorSettings>,
    ) -> Self {
        Self {
            store: Arc::new(KubeTemplateStore::new(client.clone())),
            access: Arc::new(KubeAccessProvisioner::new(client)),
            fis,
            iam,
            eks,
            settings,
            access_entry_retry: RetryConfig::default(),
        }
    }

    /// Context over mocks with instant retries
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn TemplateStore>,
        access: Arc<dyn AccessProvisioner>,
        fis: Arc<dyn FisApi>,
        iam: Arc<dyn IamApi>,
        eks: Arc<dyn EksApi>,
        settings: OperatorSettings,
    ) -> Self {
        Self {
            store,
            access,
            fis,
            iam,
            eks,
            settings: Arc::new(settings),
            access_entry_retry: RetryConfig::linear(3, Duration::ZERO),
        }
    }
}

/// Status being built during one reconcile, written only when it changed
pub(crate) struct StatusSync<'a> {
    store: &'a dyn TemplateStore,
    name: String,
    resource_version: Option<String>,
    written: ExperimentTemplateStatus,
    pub(crate) status: ExperimentTemplateStatus,
}

impl<'a> StatusSync<'a> {
    pub(crate) fn new(
        store: &'a dyn TemplateStore,
        name: &str,
        resource_version: Option<String>,
        status: ExperimentTemplateStatus,
    ) -> Self {
        Self {
            store,
            name: name.to_string(),
            resource_version,
            written: status.clone(),
            status,
        }
    }

    pub(crate) async fn persist(&mut self) -> Result<(), Error> {
        if self.status == self.written {
            return Ok(());
        }
        self.resource_version = self
            .store
            .patch_status(&self.name, self.resource_version.clone(), &self.status)
            .await?;
        self.written = self.status.clone();
        Ok(())
    }

    fn set_phase(&mut self, phase: TemplatePhase, message: impl Into<String>) {
        self.status.phase = phase;
        self.status.message = Some(message.into());
    }
}

/// Where the FIS role comes from
#[derive(Clone, Debug, PartialEq)]
enum RoleSource {
    /// Supplied by the caller; never deleted
    External(String),
    /// Created earlier by this operator
    Managed(String),
    /// Must be created now
    AutoCreate(String),
}

/// Everything resolved up front; a failure here is a configuration error
#[derive(Debug)]
struct Plan {
    cluster_identifier: String,
    service_account: String,
    namespaces: Vec<String>,
    role: RoleSource,
}

fn resolve_plan(
    template: &ExperimentTemplate,
    status: &ExperimentTemplateStatus,
    settings: &OperatorSettings,
) -> Result<Plan, Error> {
    let name = template.name_any();
    template.spec.validate(&name)?;

    let annotations = template.annotations();
    let cluster_identifier = settings.cluster_identifier(annotations).ok_or_else(|| {
        Error::configuration(
            &name,
            "no EKS cluster identifier: set CLUSTER_IDENTIFIER, the fis.dev/cluster-identifier \
             annotation, or --cluster-identifier/--cluster-name",
        )
    })?;

    let namespaces = template.spec.target_namespaces();
    if namespaces.is_empty() {
        return Err(Error::configuration(&name, "no target namespaces"));
    }

    let role = match settings.external_role_arn(template.spec.role_arn.as_deref(), annotations) {
        Some(arn) => RoleSource::External(arn),
        None => match status.role_arn.as_ref().filter(|_| status.role_managed) {
            Some(arn) => RoleSource::Managed(arn.clone()),
            None if template.spec.auto_create_role => {
                RoleSource::AutoCreate(naming::role_name(&name))
            }
            None => {
                return Err(Error::configuration(
                    &name,
                    "autoCreateRole is false and no role ARN was supplied",
                ))
            }
        },
    };

    Ok(Plan {
        cluster_identifier,
        service_account: settings.service_account(annotations, &name),
        namespaces,
        role,
    })
}

/// Reconcile an ExperimentTemplate
#[instrument(skip(template, ctx), fields(template = %template.name_any()))]
pub async fn reconcile(
    template: Arc<ExperimentTemplate>,
    ctx: Arc<TemplateContext>,
) -> Result<Action, Error> {
    let name = template.name_any();

    if template.metadata.deletion_timestamp.is_some() {
        return cleanup::delete(&template, &ctx).await;
    }

    let resource_version = if has_finalizer(template.as_ref(), TEMPLATE_FINALIZER) {
        template.resource_version()
    } else {
        ctx.store.add_finalizer(&name).await?
    };

    let generation = template.metadata.generation.unwrap_or(0);
    let status = template.status.clone().unwrap_or_default();

    if status.is_synced(generation) {
        debug!("template in sync");
        return Ok(Action::await_change());
    }
    if status.is_stalled_at(generation) {
        debug!("template stalled at this generation; waiting for a spec change");
        return Ok(Action::await_change());
    }

    let mut sync = StatusSync::new(ctx.store.as_ref(), &name, resource_version, status);

    let plan = match resolve_plan(&template, &sync.status, &ctx.settings) {
        Ok(plan) => plan,
        Err(e) => return stall(&mut sync, generation, "InvalidSpec", &e).await,
    };

    match sync.status.template_id.clone() {
        Some(id) => update(&template, &ctx, &mut sync, &plan, generation, &id).await,
        None => create(&template, &ctx, &mut sync, &plan, generation).await,
    }
}

async fn create(
    template: &ExperimentTemplate,
    ctx: &TemplateContext,
    sync: &mut StatusSync<'_>,
    plan: &Plan,
    generation: i64,
) -> Result<Action, Error> {
    let name = template.name_any();
    info!("creating FIS experiment template");

    sync.set_phase(TemplatePhase::Creating, "creating FIS experiment template");
    sync.persist().await?;

    let (role_arn, fresh_role) = resolve_role(ctx, sync, plan, &name).await?;

    sync.status.service_account = Some(plan.service_account.clone());
    sync.persist().await?;
    for namespace in &plan.namespaces {
        ctx.access
            .ensure(namespace, &name, &plan.service_account)
            .await?;
    }

    let request = build_template_request(
        &name,
        &template.spec,
        &ConversionInputs {
            cluster_identifier: &plan.cluster_identifier,
            service_account: &plan.service_account,
            role_arn: &role_arn,
        },
    )?;

    match ctx.fis.create_template(&request).await {
        Ok(id) => {
            info!(template_id = %id, "FIS experiment template created");
            sync.status.template_id = Some(id);
            sync.persist().await?;
        }
        Err(e) => {
            error!(error = %e, "failed to create FIS experiment template");
            for namespace in &plan.namespaces {
                if let Err(err) = ctx
                    .access
                    .remove(namespace, &name, &plan.service_account)
                    .await
                {
                    warn!(%namespace, error = %err, "failed to roll back namespace access");
                }
            }
            if !e.is_retryable() {
                return stall(sync, generation, "CreateFailed", &e).await;
            }
            sync.set_phase(TemplatePhase::Failed, e.to_string());
            set_condition(
                &mut sync.status.conditions,
                Condition::new(CONDITION_READY, ConditionStatus::False, "CreateFailed", e.to_string())
                    .with_generation(generation),
            );
            sync.persist().await?;
            return Err(e);
        }
    }

    ensure_cluster_access(ctx, &role_arn, &name, fresh_role).await;

    mark_ready(sync, generation, &plan.namespaces, "FIS experiment template created");
    sync.persist().await?;
    Ok(Action::await_change())
}

async fn update(
    template: &ExperimentTemplate,
    ctx: &TemplateContext,
    sync: &mut StatusSync<'_>,
    plan: &Plan,
    generation: i64,
    template_id: &str,
) -> Result<Action, Error> {
    let name = template.name_any();
    info!(%template_id, "updating FIS experiment template");

    sync.set_phase(TemplatePhase::Creating, "updating FIS experiment template");
    sync.persist().await?;

    if ctx.fis.get_template(template_id).await?.is_none() {
        warn!(%template_id, "FIS experiment template no longer exists; recreating");
        sync.status.template_id = None;
        sync.persist().await?;
        return create(template, ctx, sync, plan, generation).await;
    }

    let (role_arn, fresh_role) = resolve_role(ctx, sync, plan, &name).await?;

    // the old ServiceAccount and the RoleBinding naming it are replaced wholesale
    if let Some(previous) = sync
        .status
        .service_account
        .clone()
        .filter(|sa| *sa != plan.service_account)
    {
        for namespace in &sync.status.target_namespaces {
            if let Err(e) = ctx.access.remove(namespace, &name, &previous).await {
                warn!(
                    %namespace,
                    service_account = %previous,
                    error = %e,
                    "failed to remove access of replaced service account"
                );
            }
        }
        info!(%previous, current = %plan.service_account, "service account changed");
    }
    sync.status.service_account = Some(plan.service_account.clone());
    sync.persist().await?;

    for namespace in &plan.namespaces {
        ctx.access
            .ensure(namespace, &name, &plan.service_account)
            .await?;
    }
    let stale: Vec<String> = sync
        .status
        .target_namespaces
        .iter()
        .filter(|ns| !plan.namespaces.contains(ns))
        .cloned()
        .collect();
    for namespace in &stale {
        match ctx
            .access
            .remove(namespace, &name, &plan.service_account)
            .await
        {
            Ok(()) => info!(%namespace, "removed access from namespace no longer targeted"),
            Err(e) => warn!(%namespace, error = %e, "failed to remove stale namespace access"),
        }
    }

    let request = build_template_request(
        &name,
        &template.spec,
        &ConversionInputs {
            cluster_identifier: &plan.cluster_identifier,
            service_account: &plan.service_account,
            role_arn: &role_arn,
        },
    )?;

    if let Err(e) = ctx.fis.update_template(template_id, &request).await {
        error!(error = %e, "failed to update FIS experiment template");
        sync.set_phase(TemplatePhase::Failed, e.to_string());
        set_condition(
            &mut sync.status.conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, "UpdateFailed", e.to_string())
                .with_generation(generation),
        );
        sync.persist().await?;
        return Err(e);
    }

    ensure_cluster_access(ctx, &role_arn, &name, fresh_role).await;

    mark_ready(sync, generation, &plan.namespaces, "FIS experiment template updated");
    sync.persist().await?;
    Ok(Action::await_change())
}

/// Resolve the role ARN, creating the managed role when needed.
///
/// Returns the ARN and whether the role was created in this reconcile.
async fn resolve_role(
    ctx: &TemplateContext,
    sync: &mut StatusSync<'_>,
    plan: &Plan,
    template: &str,
) -> Result<(String, bool), Error> {
    match &plan.role {
        RoleSource::External(arn) => {
            if sync.status.role_managed {
                release_managed_role(ctx, &sync.status, template).await;
            }
            sync.status.role_arn = Some(arn.clone());
            sync.status.role_managed = false;
            Ok((arn.clone(), false))
        }
        RoleSource::Managed(arn) => Ok((arn.clone(), false)),
        RoleSource::AutoCreate(role_name) => {
            let arn = ensure_fis_role(ctx.iam.as_ref(), role_name, template).await?;
            info!(role = %role_name, %arn, "FIS role ready");
            sync.status.role_arn = Some(arn.clone());
            sync.status.role_managed = true;
            sync.persist().await?;
            Ok((arn, true))
        }
    }
}

/// Drop a role this operator created once the caller supplies their own
async fn release_managed_role(
    ctx: &TemplateContext,
    status: &ExperimentTemplateStatus,
    template: &str,
) {
    let Some(arn) = status.role_arn.as_deref() else {
        return;
    };
    if let Some(cluster) = ctx.settings.eks_cluster_name.as_deref() {
        if let Err(e) =
            fis_provider::eks::remove_access_entry(ctx.eks.as_ref(), cluster, arn).await
        {
            warn!(role = %arn, error = %e, "failed to remove access entry of replaced role");
        }
    }
    if let Some(role_name) = naming::role_name_from_arn(arn) {
        match delete_fis_role(ctx.iam.as_ref(), role_name).await {
            Ok(()) => info!(role = %role_name, %template, "deleted replaced FIS role"),
            Err(e) => warn!(role = %role_name, error = %e, "failed to delete replaced FIS role"),
        }
    }
}

async fn ensure_cluster_access(
    ctx: &TemplateContext,
    role_arn: &str,
    template: &str,
    fresh_role: bool,
) {
    let Some(cluster) = ctx.settings.eks_cluster_name.as_deref() else {
        return;
    };
    // a role created moments ago may not be visible to EKS yet
    let retry = if fresh_role {
        ctx.access_entry_retry.clone()
    } else {
        RetryConfig::once()
    };
    ensure_access_entry(
        ctx.eks.as_ref(),
        cluster,
        role_arn,
        &naming::access_username(template),
        &retry,
    )
    .await;
}

fn mark_ready(
    sync: &mut StatusSync<'_>,
    generation: i64,
    namespaces: &[String],
    message: &str,
) {
    sync.set_phase(TemplatePhase::Ready, message);
    sync.status.observed_generation = Some(generation);
    sync.status.target_namespaces = namespaces.to_vec();
    sync.status.last_sync_time = Some(Utc::now());
    sync.status
        .conditions
        .retain(|c| c.type_ != CONDITION_STALLED);
    set_condition(
        &mut sync.status.conditions,
        Condition::new(CONDITION_READY, ConditionStatus::True, "Synced", message)
            .with_generation(generation),
    );
}

/// Record a failure that retrying cannot fix until the spec changes
async fn stall(
    sync: &mut StatusSync<'_>,
    generation: i64,
    reason: &str,
    err: &Error,
) -> Result<Action, Error> {
    warn!(error = %err, %reason, "template stalled");
    let message = err.to_string();
    sync.set_phase(TemplatePhase::Failed, message.clone());
    set_condition(
        &mut sync.status.conditions,
        Condition::new(CONDITION_READY, ConditionStatus::False, reason, message.clone())
            .with_generation(generation),
    );
    set_condition(
        &mut sync.status.conditions,
        Condition::new(CONDITION_STALLED, ConditionStatus::True, reason, message)
            .with_generation(generation),
    );
    sync.persist().await?;
    Ok(Action::await_change())
}

/// Requeue policy for failed template reconciles
pub fn error_policy(
    template: Arc<ExperimentTemplate>,
    error: &Error,
    _ctx: Arc<TemplateContext>,
) -> Action {
    error!(
        ?error,
        template = %template.name_any(),
        retryable = error.is_retryable(),
        "template reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::requeue(PERMANENT_ERROR_DELAY)
    }
}

/// Namespaces whose RBAC must go when the template is deleted
pub(crate) fn cleanup_namespaces(template: &ExperimentTemplate) -> BTreeSet<String> {
    let mut namespaces: BTreeSet<String> = template.spec.target_namespaces().into_iter().collect();
    if let Some(status) = &template.status {
        namespaces.extend(status.target_namespaces.iter().cloned());
    }
    namespaces
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::access::MockAccessProvisioner;
    use crate::store::MockTemplateStore;
    use fis_common::config::EnvOverrides;
    use fis_provider::{MockEksApi, MockFisApi, MockIamApi, ProviderTemplate};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::Mutex;

    pub(crate) const CLUSTER_ARN: &str = "arn:aws:eks:us-east-1:123456789012:cluster/prod";
    pub(crate) const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/fis-web-cpu";

    pub(crate) fn sample_template() -> ExperimentTemplate {
        let spec = serde_json::from_value(serde_json::json!({
            "targets": [
                {"name": "web", "namespace": "shop", "labelSelector": {"app": "web"}, "scope": "50%"},
                {"name": "api", "namespace": "backend", "labelSelector": {"app": "api"}}
            ],
            "actions": [
                {"name": "cpu", "type": "pod-cpu-stress", "duration": "5m", "target": "web"}
            ]
        }))
        .unwrap();
        let mut template = ExperimentTemplate::new("web-cpu", spec);
        template.metadata = ObjectMeta {
            name: Some("web-cpu".to_string()),
            generation: Some(1),
            resource_version: Some("100".to_string()),
            finalizers: Some(vec![TEMPLATE_FINALIZER.to_string()]),
            ..Default::default()
        };
        template
    }

    pub(crate) fn settings() -> OperatorSettings {
        OperatorSettings {
            env: EnvOverrides::default(),
            cluster_identifier: Some(CLUSTER_ARN.to_string()),
            eks_cluster_name: Some("prod".to_string()),
            ..Default::default()
        }
    }

    fn ready_status() -> ExperimentTemplateStatus {
        ExperimentTemplateStatus {
            template_id: Some("EXT123".to_string()),
            role_arn: Some(ROLE_ARN.to_string()),
            role_managed: true,
            phase: TemplatePhase::Ready,
            observed_generation: Some(1),
            target_namespaces: vec!["backend".to_string(), "shop".to_string()],
            ..Default::default()
        }
    }

    /// Store that records every status it is asked to write
    fn recording_store(written: Arc<Mutex<Vec<ExperimentTemplateStatus>>>) -> MockTemplateStore {
        let mut store = MockTemplateStore::new();
        store.expect_add_finalizer().returning(|_| Ok(Some("101".to_string())));
        store.expect_patch_status().returning(move |_, rv, status| {
            written.lock().unwrap().push(status.clone());
            let next = rv.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0) + 1;
            Ok(Some(next.to_string()))
        });
        store
    }

    fn ctx(
        store: MockTemplateStore,
        access: MockAccessProvisioner,
        fis: MockFisApi,
        iam: MockIamApi,
        eks: MockEksApi,
        settings: OperatorSettings,
    ) -> Arc<TemplateContext> {
        Arc::new(TemplateContext::for_testing(
            Arc::new(store),
            Arc::new(access),
            Arc::new(fis),
            Arc::new(iam),
            Arc::new(eks),
            settings,
        ))
    }

    /// Story: a synced template is left alone, however often it is reconciled
    #[tokio::test]
    async fn story_unchanged_template_makes_no_calls() {
        let mut template = sample_template();
        template.status = Some(ready_status());
        let template = Arc::new(template);

        let store = MockTemplateStore::new();
        let access = MockAccessProvisioner::new();
        let fis = MockFisApi::new();
        let iam = MockIamApi::new();
        let eks = MockEksApi::new();
        let ctx = ctx(store, access, fis, iam, eks, settings());

        for _ in 0..2 {
            let action = reconcile(template.clone(), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    /// Story: a new template walks role -> RBAC -> FIS -> access entry -> Ready
    #[tokio::test]
    async fn story_new_template_is_provisioned_in_order() {
        let mut template = sample_template();
        template.metadata.finalizers = None;
        let template = Arc::new(template);

        let written = Arc::new(Mutex::new(Vec::new()));
        let mut seq = Sequence::new();

        let store = recording_store(written.clone());

        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn()
            .with(eq("fis-web-cpu"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        iam.expect_create_role()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ROLE_ARN.to_string()));
        iam.expect_put_role_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut access = MockAccessProvisioner::new();
        access
            .expect_ensure()
            .with(eq("backend"), eq("web-cpu"), eq("fis-web-cpu"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        access
            .expect_ensure()
            .with(eq("shop"), eq("web-cpu"), eq("fis-web-cpu"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template()
            .withf(|req| {
                req.role_arn == ROLE_ARN
                    && req.actions["cpu"].parameters["kubernetesServiceAccount"] == "fis-web-cpu"
                    && req.targets["web"].parameters["clusterIdentifier"] == CLUSTER_ARN
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("EXT123".to_string()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(false));
        eks.expect_create_access_entry()
            .with(eq("prod"), eq(ROLE_ARN), eq("fis-web-cpu"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let ctx = ctx(store, access, fis, iam, eks, settings());
        let action = reconcile(template, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let written = written.lock().unwrap();
        let last = written.last().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
        assert_eq!(last.template_id.as_deref(), Some("EXT123"));
        assert_eq!(last.role_arn.as_deref(), Some(ROLE_ARN));
        assert!(last.role_managed);
        assert_eq!(last.observed_generation, Some(1));
        assert_eq!(last.target_namespaces, ["backend", "shop"]);

        // the role ARN is persisted before the FIS template exists
        assert!(written
            .iter()
            .any(|s| s.role_arn.is_some() && s.template_id.is_none()));
    }

    /// Story: FIS rejects the template, the RBAC just created is rolled back
    #[tokio::test]
    async fn story_create_failure_rolls_back_access_and_stalls() {
        let mut template = sample_template();
        template.status = Some(ExperimentTemplateStatus {
            role_arn: Some(ROLE_ARN.to_string()),
            role_managed: true,
            ..Default::default()
        });
        let template = Arc::new(template);

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().times(2).returning(|_, _, _| Ok(()));
        access.expect_remove().times(2).returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template().times(1).returning(|_| {
            Err(Error::provider_permanent(
                "fis",
                "CreateExperimentTemplate",
                "invalid action parameters",
            ))
        });

        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn().never();
        let mut eks = MockEksApi::new();
        eks.expect_create_access_entry().never();

        let ctx = ctx(store, access, fis, iam, eks, settings());
        let action = reconcile(template, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let written = written.lock().unwrap();
        let last = written.last().unwrap();
        assert_eq!(last.phase, TemplatePhase::Failed);
        assert!(last.message.as_deref().unwrap().contains("invalid action parameters"));
        assert!(last.is_stalled_at(1));
        assert_eq!(last.template_id, None);
    }

    /// Story: a stalled generation is not retried by status-triggered reconciles
    #[tokio::test]
    async fn story_stalled_template_waits_for_spec_change() {
        let mut status = ExperimentTemplateStatus {
            phase: TemplatePhase::Failed,
            ..Default::default()
        };
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_STALLED, ConditionStatus::True, "CreateFailed", "boom")
                .with_generation(1),
        );
        let mut template = sample_template();
        template.status = Some(status);

        let ctx = ctx(
            MockTemplateStore::new(),
            MockAccessProvisioner::new(),
            MockFisApi::new(),
            MockIamApi::new(),
            MockEksApi::new(),
            settings(),
        );
        let action = reconcile(Arc::new(template.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a missing cluster identifier is a configuration error, not a retry loop
    #[tokio::test]
    async fn story_missing_cluster_identifier_stalls() {
        let template = Arc::new(sample_template());
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut fis = MockFisApi::new();
        fis.expect_create_template().never();

        let ctx = ctx(
            store,
            MockAccessProvisioner::new(),
            fis,
            MockIamApi::new(),
            MockEksApi::new(),
            OperatorSettings::default(),
        );
        let action = reconcile(template, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let written = written.lock().unwrap();
        let last = written.last().unwrap();
        assert_eq!(last.phase, TemplatePhase::Failed);
        assert!(last.is_stalled_at(1));
    }

    /// Story: autoCreateRole=false without any role is a configuration error
    #[tokio::test]
    async fn story_no_role_without_auto_create_stalls() {
        let mut template = sample_template();
        template.spec.auto_create_role = false;
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut iam = MockIamApi::new();
        iam.expect_create_role().never();

        let ctx = ctx(
            store,
            MockAccessProvisioner::new(),
            MockFisApi::new(),
            iam,
            MockEksApi::new(),
            settings(),
        );
        reconcile(Arc::new(template), ctx).await.unwrap();

        let written = written.lock().unwrap();
        let last = written.last().unwrap();
        assert!(last.is_stalled_at(1));
        assert!(last.message.as_deref().unwrap().contains("autoCreateRole"));
    }

    /// Story: a caller-supplied role is used as-is and no IAM calls are made
    #[tokio::test]
    async fn story_external_role_skips_iam() {
        let mut template = sample_template();
        template.spec.role_arn = Some("arn:aws:iam::123456789012:role/caller".to_string());
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn().never();
        iam.expect_create_role().never();

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template()
            .withf(|req| req.role_arn == "arn:aws:iam::123456789012:role/caller")
            .returning(|_| Ok("EXT9".to_string()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(true));

        let ctx = ctx(store, access, fis, iam, eks, settings());
        reconcile(Arc::new(template), ctx).await.unwrap();

        let written = written.lock().unwrap();
        let last = written.last().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
        assert!(!last.role_managed);
    }

    /// Story: a spec change updates FIS in place and prunes namespaces no longer targeted
    #[tokio::test]
    async fn story_spec_change_updates_and_prunes_namespaces() {
        let mut template = sample_template();
        template.metadata.generation = Some(2);
        template.spec.targets.retain(|t| t.name == "web");
        let mut status = ready_status();
        status.target_namespaces = vec!["backend".to_string(), "shop".to_string()];
        template.status = Some(status);

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut fis = MockFisApi::new();
        fis.expect_get_template().with(eq("EXT123")).returning(|id| {
            Ok(Some(ProviderTemplate {
                id: id.to_string(),
                description: None,
            }))
        });
        fis.expect_update_template()
            .withf(|id, req| id == "EXT123" && req.targets.len() == 1)
            .times(1)
            .returning(|_, _| Ok(()));
        fis.expect_create_template().never();

        let mut access = MockAccessProvisioner::new();
        access
            .expect_ensure()
            .with(eq("shop"), eq("web-cpu"), eq("fis-web-cpu"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        access
            .expect_remove()
            .with(eq("backend"), eq("web-cpu"), eq("fis-web-cpu"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(true));

        let ctx = ctx(store, access, fis, MockIamApi::new(), eks, settings());
        reconcile(Arc::new(template), ctx).await.unwrap();

        let written = written.lock().unwrap();
        let last = written.last().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
        assert_eq!(last.observed_generation, Some(2));
        assert_eq!(last.target_namespaces, ["shop"]);
    }

    /// Story: the FIS template was deleted out of band and is recreated
    #[tokio::test]
    async fn story_missing_provider_template_is_recreated() {
        let mut template = sample_template();
        template.metadata.generation = Some(2);
        template.status = Some(ready_status());

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut fis = MockFisApi::new();
        fis.expect_get_template().returning(|_| Ok(None));
        fis.expect_update_template().never();
        fis.expect_create_template()
            .times(1)
            .returning(|_| Ok("EXT456".to_string()));

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().returning(|_, _, _| Ok(()));
        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(true));

        let ctx = ctx(store, access, fis, MockIamApi::new(), eks, settings());
        reconcile(Arc::new(template), ctx).await.unwrap();

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.template_id.as_deref(), Some("EXT456"));
        assert_eq!(last.phase, TemplatePhase::Ready);
    }

    /// Story: a transient update failure is surfaced for retry
    #[tokio::test]
    async fn story_update_failure_marks_failed_and_retries() {
        let mut template = sample_template();
        template.metadata.generation = Some(2);
        template.status = Some(ready_status());
        let template = Arc::new(template);

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut fis = MockFisApi::new();
        fis.expect_get_template().returning(|id| {
            Ok(Some(ProviderTemplate {
                id: id.to_string(),
                description: None,
            }))
        });
        fis.expect_update_template()
            .returning(|_, _| Err(Error::provider("fis", "UpdateExperimentTemplate", "throttled")));

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().returning(|_, _, _| Ok(()));

        let ctx = ctx(store, access, fis, MockIamApi::new(), MockEksApi::new(), settings());
        let err = reconcile(template.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(error_policy(template, &err, ctx), Action::requeue(RETRY_DELAY));

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, TemplatePhase::Failed);
        assert!(!last.is_stalled_at(2));
    }

    /// Story: an overridden service account is the one provisioned, bound and sent to FIS
    #[tokio::test]
    async fn story_service_account_override_is_provisioned() {
        let template = Arc::new(sample_template());
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn().returning(|_| Ok(Some(ROLE_ARN.to_string())));
        iam.expect_put_role_policy().returning(|_, _, _| Ok(()));

        let mut access = MockAccessProvisioner::new();
        access
            .expect_ensure()
            .withf(|_, template, sa| template == "web-cpu" && sa == "custom-sa")
            .times(2)
            .returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template()
            .withf(|req| req.actions["cpu"].parameters["kubernetesServiceAccount"] == "custom-sa")
            .times(1)
            .returning(|_| Ok("EXT123".to_string()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(true));

        let mut settings = settings();
        settings.service_account = Some("custom-sa".to_string());

        let ctx = ctx(store, access, fis, iam, eks, settings);
        reconcile(template, ctx).await.unwrap();

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
        assert_eq!(last.service_account.as_deref(), Some("custom-sa"));
    }

    /// Story: switching the service account removes the old one's access first
    #[tokio::test]
    async fn story_service_account_change_replaces_access() {
        let mut template = sample_template();
        template.metadata.generation = Some(2);
        let mut status = ready_status();
        status.service_account = Some("fis-web-cpu".to_string());
        template.status = Some(status);

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut fis = MockFisApi::new();
        fis.expect_get_template().returning(|id| {
            Ok(Some(ProviderTemplate {
                id: id.to_string(),
                description: None,
            }))
        });
        fis.expect_update_template()
            .withf(|_, req| req.actions["cpu"].parameters["kubernetesServiceAccount"] == "custom-sa")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut seq = Sequence::new();
        let mut access = MockAccessProvisioner::new();
        access
            .expect_remove()
            .withf(|_, _, sa| sa == "fis-web-cpu")
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        access
            .expect_ensure()
            .withf(|_, _, sa| sa == "custom-sa")
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().returning(|_, _| Ok(true));

        let mut template_settings = settings();
        template_settings.service_account = Some("custom-sa".to_string());

        let ctx = ctx(store, access, fis, MockIamApi::new(), eks, template_settings);
        reconcile(Arc::new(template), ctx).await.unwrap();

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
        assert_eq!(last.service_account.as_deref(), Some("custom-sa"));
    }

    /// Story: a throttled create rolls back and is retried instead of stalling
    #[tokio::test]
    async fn story_transient_create_failure_is_retried() {
        let mut template = sample_template();
        template.status = Some(ExperimentTemplateStatus {
            role_arn: Some(ROLE_ARN.to_string()),
            role_managed: true,
            ..Default::default()
        });
        let template = Arc::new(template);

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().times(2).returning(|_, _, _| Ok(()));
        access.expect_remove().times(2).returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template()
            .times(1)
            .returning(|_| Err(Error::provider("fis", "CreateExperimentTemplate", "throttled")));

        let ctx = ctx(store, access, fis, MockIamApi::new(), MockEksApi::new(), settings());
        let err = reconcile(template.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(error_policy(template, &err, ctx), Action::requeue(RETRY_DELAY));

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, TemplatePhase::Failed);
        assert_eq!(last.template_id, None);
        assert!(!last.is_stalled_at(1));
    }

    /// Story: the access entry of a role created moments ago is retried, then given up on
    #[tokio::test]
    async fn story_fresh_role_access_entry_retried_three_times() {
        let template = Arc::new(sample_template());
        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn().returning(|_| Ok(None));
        iam.expect_create_role().times(1).returning(|_| Ok(ROLE_ARN.to_string()));
        iam.expect_put_role_policy().returning(|_, _, _| Ok(()));

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template().returning(|_| Ok("EXT123".to_string()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().times(3).returning(|_, _| Ok(false));
        eks.expect_create_access_entry()
            .times(3)
            .returning(|_, _, _| Err(Error::provider("eks", "CreateAccessEntry", "principal not found")));

        let ctx = ctx(store, access, fis, iam, eks, settings());
        let action = reconcile(template, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
    }

    /// Story: a role that already existed gets a single access entry attempt
    #[tokio::test]
    async fn story_existing_role_access_entry_tried_once() {
        let mut template = sample_template();
        template.status = Some(ExperimentTemplateStatus {
            role_arn: Some(ROLE_ARN.to_string()),
            role_managed: true,
            ..Default::default()
        });

        let written = Arc::new(Mutex::new(Vec::new()));
        let store = recording_store(written.clone());

        let mut iam = MockIamApi::new();
        iam.expect_get_role_arn().never();
        iam.expect_create_role().never();

        let mut access = MockAccessProvisioner::new();
        access.expect_ensure().returning(|_, _, _| Ok(()));

        let mut fis = MockFisApi::new();
        fis.expect_create_template().returning(|_| Ok("EXT123".to_string()));

        let mut eks = MockEksApi::new();
        eks.expect_access_entry_exists().times(1).returning(|_, _| Ok(false));
        eks.expect_create_access_entry()
            .times(1)
            .returning(|_, _, _| Err(Error::provider("eks", "CreateAccessEntry", "throttled")));

        let ctx = ctx(store, access, fis, iam, eks, settings());
        reconcile(Arc::new(template), ctx).await.unwrap();

        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, TemplatePhase::Ready);
    }

    #[test]
    fn test_cleanup_namespaces_union_status_and_spec() {
        let mut template = sample_template();
        template.status = Some(ExperimentTemplateStatus {
            target_namespaces: vec!["legacy".to_string(), "shop".to_string()],
            ..Default::default()
        });
        let namespaces: Vec<String> = cleanup_namespaces(&template).into_iter().collect();
        assert_eq!(namespaces, ["backend", "legacy", "shop"]);
    }
}
