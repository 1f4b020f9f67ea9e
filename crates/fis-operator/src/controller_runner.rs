//! Controller runner: builds the two controller futures

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use fis_common::crd::{Experiment, ExperimentTemplate};
use fis_experiment::ExperimentContext;
use fis_template::TemplateContext;

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// ExperimentTemplate controller
pub fn build_template_controller(
    client: Client,
    ctx: Arc<TemplateContext>,
    concurrency: u16,
) -> ControllerFuture {
    let templates: Api<ExperimentTemplate> = Api::all(client);

    tracing::info!("- ExperimentTemplate controller");

    Box::pin(
        Controller::new(templates, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(fis_template::reconcile, fis_template::error_policy, ctx)
            .for_each(log_reconcile_result("ExperimentTemplate")),
    )
}

/// Experiment controller; also re-triggers experiments when a template they
/// reference by name changes
pub fn build_experiment_controller(
    client: Client,
    ctx: Arc<ExperimentContext>,
    concurrency: u16,
) -> ControllerFuture {
    let experiments: Api<Experiment> = Api::all(client.clone());
    let templates: Api<ExperimentTemplate> = Api::all(client);

    let controller = Controller::new(
        experiments,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let cache = controller.store();

    tracing::info!("- Experiment controller");

    Box::pin(
        controller
            .watches(
                templates,
                WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
                move |template| {
                    let name = template.name_any();
                    let affected = referencing_experiments(&cache.state(), &name);
                    if !affected.is_empty() {
                        tracing::debug!(
                            template = %name,
                            affected_count = affected.len(),
                            "re-triggering experiments referencing template"
                        );
                    }
                    affected
                },
            )
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(fis_experiment::reconcile, fis_experiment::error_policy, ctx)
            .for_each(log_reconcile_result("Experiment")),
    )
}

/// Experiments whose template reference names `template`
fn referencing_experiments(
    experiments: &[Arc<Experiment>],
    template: &str,
) -> Vec<ObjectRef<Experiment>> {
    experiments
        .iter()
        .filter(|exp| exp.spec.experiment_template.name.as_deref() == Some(template))
        .map(|exp| ObjectRef::new(&exp.name_any()))
        .collect()
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
