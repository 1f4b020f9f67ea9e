//! Experiment reconciliation
//!
//! One-shot experiments start a single run and poll it to a terminal state.
//! Scheduled experiments start a run for the latest due cron slot and requeue
//! themselves for the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use fis_common::crd::{
    set_condition, Condition, ConditionStatus, Experiment, ExperimentState, ExperimentStatus,
    CONDITION_READY, CONDITION_STALLED,
};
use fis_common::kube_utils::has_finalizer;
use fis_common::{Error, EXPERIMENT_FINALIZER};
use fis_provider::converter::build_start_request;
use fis_provider::{FisApi, ProviderExperiment};

use crate::history::record_history;
use crate::schedule::CronSchedule;
use crate::store::{ExperimentStore, KubeExperimentStore};

/// Poll interval while a run is in flight
pub const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Poll interval when FIS reports a status this operator does not know
pub const UNKNOWN_STATE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Requeue delay after a retryable reconcile error
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Requeue delay after a permanent reconcile error
pub const PERMANENT_ERROR_DELAY: Duration = Duration::from_secs(300);

/// Missed slots beyond which a warning is logged
const MISSED_SLOTS_WARNING: usize = 100;

const INITIATING_REASON: &str = "Experiment is initiating";

/// Shared state for every experiment reconcile
pub struct ExperimentContext {
    /// Kubernetes reads and writes
    pub store: Arc<dyn ExperimentStore>,
    /// FIS client
    pub fis: Arc<dyn FisApi>,
}

impl ExperimentContext {
    /// Build a context from a Kubernetes client and the shared FIS client
    pub fn new(client: Client, fis: Arc<dyn FisApi>) -> Self {
        Self {
            store: Arc::new(KubeExperimentStore::new(client)),
            fis,
        }
    }

    /// Context over mocks
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn ExperimentStore>, fis: Arc<dyn FisApi>) -> Self {
        Self { store, fis }
    }
}

struct StatusSync<'a> {
    store: &'a dyn ExperimentStore,
    name: String,
    resource_version: Option<String>,
    written: ExperimentStatus,
    status: ExperimentStatus,
}

impl<'a> StatusSync<'a> {
    fn new(
        store: &'a dyn ExperimentStore,
        name: &str,
        resource_version: Option<String>,
        status: ExperimentStatus,
    ) -> Self {
        Self {
            store,
            name: name.to_string(),
            resource_version,
            written: status.clone(),
            status,
        }
    }

    async fn persist(&mut self) -> Result<(), Error> {
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

    /// Record a failure the controller cannot fix by retrying
    fn fail(&mut self, reason: &str, message: String, generation: Option<i64>) {
        self.status.state = Some(ExperimentState::Failed);
        self.status.reason = Some(message.clone());
        self.status.active = 0;
        let mut condition =
            Condition::new(CONDITION_READY, ConditionStatus::False, reason, message);
        if let Some(generation) = generation {
            condition = condition.with_generation(generation);
        }
        set_condition(&mut self.status.conditions, condition);
    }

    /// A run was just started
    fn started(&mut self, run: &ProviderExperiment, now: DateTime<Utc>) {
        self.status.experiment_id = Some(run.id.clone());
        self.status.state = Some(ExperimentState::Initiating);
        self.status.reason = Some(INITIATING_REASON.to_string());
        self.status.start_time = Some(run.start_time.unwrap_or(now));
        self.status.end_time = None;
        self.status.active = 1;
        self.status.target_account_configurations_count = run.target_account_configurations_count;
        self.status.conditions.retain(|c| c.type_ != CONDITION_STALLED);
        set_condition(
            &mut self.status.conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True, "Started", INITIATING_REASON),
        );
    }

    /// Copy the provider's view of the current run
    fn observe(&mut self, run: &ProviderExperiment) {
        let previous = self.status.state;
        match run.state {
            Some(state) => {
                self.status.state = Some(state);
                self.status.active = i32::from(!state.is_terminal());
            }
            None => warn!(status = %run.raw_status, "unknown experiment status from FIS"),
        }
        if run.reason.is_some() {
            self.status.reason = run.reason.clone();
        }
        if self.status.start_time.is_none() {
            self.status.start_time = run.start_time;
        }
        if run.end_time.is_some() {
            self.status.end_time = run.end_time;
        }
        if run.target_account_configurations_count.is_some() {
            self.status.target_account_configurations_count =
                run.target_account_configurations_count;
        }
        if previous != self.status.state {
            info!(
                experiment_id = %run.id,
                previous = ?previous,
                state = ?self.status.state,
                reason = ?self.status.reason,
                "experiment state changed"
            );
        }
    }
}

/// Reconcile an Experiment
#[instrument(skip(experiment, ctx), fields(experiment = %experiment.name_any()))]
pub async fn reconcile(
    experiment: Arc<Experiment>,
    ctx: Arc<ExperimentContext>,
) -> Result<Action, Error> {
    reconcile_at(&experiment, &ctx, Utc::now()).await
}

async fn reconcile_at(
    experiment: &Experiment,
    ctx: &ExperimentContext,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let name = experiment.name_any();

    if experiment.metadata.deletion_timestamp.is_some() {
        return delete(experiment, ctx).await;
    }

    let resource_version = if has_finalizer(experiment, EXPERIMENT_FINALIZER) {
        experiment.resource_version()
    } else {
        ctx.store.add_finalizer(&name).await?
    };

    if experiment.spec.suspend {
        debug!("experiment suspended");
        return Ok(Action::await_change());
    }

    let status = experiment.status.clone().unwrap_or_default();
    let mut sync = StatusSync::new(ctx.store.as_ref(), &name, resource_version, status);

    match experiment.spec.schedule() {
        Some(expression) => run_scheduled(experiment, ctx, &mut sync, expression, now).await,
        None => run_once(experiment, ctx, &mut sync, now).await,
    }
}

/// Resolve the FIS template id, recording terminal failures on the status.
///
/// Returns `Ok(None)` when the failure was recorded and the reconcile should stop.
async fn resolve_template_id(
    experiment: &Experiment,
    ctx: &ExperimentContext,
    sync: &mut StatusSync<'_>,
) -> Result<Option<String>, Error> {
    let name = experiment.name_any();
    let reference = &experiment.spec.experiment_template;

    let resolved = if let Some(id) = reference.id.as_deref().filter(|s| !s.is_empty()) {
        Ok(id.to_string())
    } else if let Some(template) = reference.name.as_deref().filter(|s| !s.is_empty()) {
        match ctx.store.get_template(template).await? {
            None => Err(Error::configuration(
                &name,
                format!("ExperimentTemplate '{}' not found", template),
            )),
            Some(found) => found
                .status
                .and_then(|s| s.template_id)
                .ok_or_else(|| {
                    Error::not_ready(
                        format!("ExperimentTemplate/{}", template),
                        "FIS template has not been created yet",
                    )
                }),
        }
    } else {
        Err(Error::configuration(
            &name,
            "experimentTemplate must set either id or name",
        ))
    };

    match resolved {
        Ok(id) => {
            if sync.status.template_id.as_deref() != Some(id.as_str()) {
                sync.status.template_id = Some(id.clone());
                sync.persist().await?;
            }
            Ok(Some(id))
        }
        Err(e) if e.is_terminal() => {
            warn!(error = %e, "cannot resolve experiment template");
            sync.fail("TemplateNotResolved", e.to_string(), experiment.metadata.generation);
            sync.persist().await?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn client_token(experiment: &Experiment, slot: Option<DateTime<Utc>>) -> String {
    match (
        experiment.spec.client_token.as_deref().filter(|t| !t.is_empty()),
        slot,
    ) {
        (Some(token), Some(slot)) => format!("{}-{}", token, slot.timestamp()),
        (Some(token), None) => token.to_string(),
        (None, _) => uuid::Uuid::new_v4().to_string(),
    }
}

async fn start_run(
    experiment: &Experiment,
    ctx: &ExperimentContext,
    sync: &mut StatusSync<'_>,
    template_id: &str,
    slot: Option<DateTime<Utc>>,
) -> Result<ProviderExperiment, Error> {
    let request = build_start_request(
        template_id,
        client_token(experiment, slot),
        &experiment.name_any(),
        &experiment.spec.tags,
    );

    match ctx.fis.start_experiment(&request).await {
        Ok(run) => {
            info!(experiment_id = %run.id, %template_id, "experiment started");
            Ok(run)
        }
        Err(e) => {
            error!(error = %e, %template_id, "failed to start experiment");
            sync.fail("StartFailed", e.to_string(), None);
            sync.persist().await?;
            Err(e)
        }
    }
}

async fn run_once(
    experiment: &Experiment,
    ctx: &ExperimentContext,
    sync: &mut StatusSync<'_>,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let Some(experiment_id) = sync.status.experiment_id.clone() else {
        let Some(template_id) = resolve_template_id(experiment, ctx, sync).await? else {
            return Ok(Action::await_change());
        };
        let run = start_run(experiment, ctx, sync, &template_id, None).await?;
        sync.started(&run, now);
        sync.persist().await?;
        return Ok(Action::requeue(ACTIVE_POLL_INTERVAL));
    };

    if sync.status.state.is_some_and(|s| s.is_terminal()) {
        return Ok(Action::await_change());
    }

    let run = ctx.fis.get_experiment(&experiment_id).await?;
    sync.observe(&run);
    sync.persist().await?;

    Ok(match run.state {
        None => Action::requeue(UNKNOWN_STATE_POLL_INTERVAL),
        Some(state) if state.is_terminal() => {
            info!(%experiment_id, %state, "experiment finished");
            Action::await_change()
        }
        Some(_) => Action::requeue(ACTIVE_POLL_INTERVAL),
    })
}

async fn run_scheduled(
    experiment: &Experiment,
    ctx: &ExperimentContext,
    sync: &mut StatusSync<'_>,
    expression: &str,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let schedule = match CronSchedule::parse(expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(error = %e, schedule = %expression, "invalid schedule");
            let generation = experiment.metadata.generation;
            sync.fail("InvalidSchedule", e.to_string(), generation);
            let mut stalled = Condition::new(
                CONDITION_STALLED,
                ConditionStatus::True,
                "InvalidSchedule",
                e.to_string(),
            );
            if let Some(generation) = generation {
                stalled = stalled.with_generation(generation);
            }
            set_condition(&mut sync.status.conditions, stalled);
            sync.persist().await?;
            return Ok(Action::await_change());
        }
    };

    if sync.status.has_active_run() {
        if let Some(id) = sync.status.experiment_id.clone() {
            match ctx.fis.get_experiment(&id).await {
                Ok(run) => sync.observe(&run),
                Err(e) => warn!(experiment_id = %id, error = %e, "failed to poll scheduled run"),
            }
        }
    }

    let Some(template_id) = resolve_template_id(experiment, ctx, sync).await? else {
        return Ok(Action::await_change());
    };

    let anchor = sync
        .status
        .last_schedule_time
        .or_else(|| experiment.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or(now);

    match schedule.next_due(anchor, now) {
        Some(due) => {
            if due.missed > MISSED_SLOTS_WARNING {
                warn!(missed = due.missed, "many schedule slots missed; running only the latest");
            }
            info!(slot = %due.at, "starting scheduled run");

            let run = start_run(experiment, ctx, sync, &template_id, Some(due.at)).await?;
            sync.started(&run, now);
            sync.status.last_schedule_time = Some(due.at);
            sync.status.next_schedule_time = schedule.next_after(due.at);
            sync.persist().await?;

            if let Err(e) = record_history(ctx.fis.as_ref(), &template_id, &experiment.spec).await {
                warn!(error = %e, "experiment history bookkeeping failed");
            }
        }
        None => {
            sync.status.next_schedule_time = schedule.next_after(anchor);
            sync.persist().await?;
        }
    }

    Ok(schedule_requeue(&sync.status, now))
}

/// Requeue at the next slot, or sooner while a run needs polling
fn schedule_requeue(status: &ExperimentStatus, now: DateTime<Utc>) -> Action {
    let until_next = status
        .next_schedule_time
        .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO).max(Duration::from_secs(1)));

    match (until_next, status.has_active_run()) {
        (Some(delay), true) => Action::requeue(delay.min(ACTIVE_POLL_INTERVAL)),
        (Some(delay), false) => Action::requeue(delay),
        (None, true) => Action::requeue(ACTIVE_POLL_INTERVAL),
        (None, false) => Action::await_change(),
    }
}

async fn delete(experiment: &Experiment, ctx: &ExperimentContext) -> Result<Action, Error> {
    if !has_finalizer(experiment, EXPERIMENT_FINALIZER) {
        return Ok(Action::await_change());
    }

    if let Some(status) = &experiment.status {
        if let (Some(id), Some(state)) = (&status.experiment_id, status.state) {
            if state.is_stoppable() {
                match ctx.fis.stop_experiment(id).await {
                    Ok(()) => info!(experiment_id = %id, "stopped running experiment"),
                    Err(e) => warn!(experiment_id = %id, error = %e, "failed to stop experiment"),
                }
            }
        }
    }

    ctx.store.remove_finalizer(&experiment.name_any()).await?;
    Ok(Action::await_change())
}

/// Requeue policy for failed experiment reconciles
pub fn error_policy(
    experiment: Arc<Experiment>,
    error: &Error,
    _ctx: Arc<ExperimentContext>,
) -> Action {
    error!(
        ?error,
        experiment = %experiment.name_any(),
        retryable = error.is_retryable(),
        "experiment reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::requeue(PERMANENT_ERROR_DELAY)
    }
}
