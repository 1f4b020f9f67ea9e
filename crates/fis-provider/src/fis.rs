//! AWS Fault Injection Service client

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_fis::primitives::DateTime as AwsDateTime;
use aws_sdk_fis::types::{
    AccountTargeting, CreateExperimentTemplateActionInput,
    CreateExperimentTemplateExperimentOptionsInput, CreateExperimentTemplateLogConfigurationInput,
    CreateExperimentTemplateReportConfigurationInput, CreateExperimentTemplateStopConditionInput,
    CreateExperimentTemplateTargetInput, EmptyTargetResolutionMode,
    ExperimentTemplateCloudWatchLogsLogConfigurationInput, ExperimentTemplateS3LogConfigurationInput,
    ExperimentTemplateTargetInputFilter, UpdateExperimentTemplateActionInputItem,
    UpdateExperimentTemplateExperimentOptionsInput, UpdateExperimentTemplateLogConfigurationInput,
    UpdateExperimentTemplateReportConfigurationInput, UpdateExperimentTemplateStopConditionInput,
    UpdateExperimentTemplateTargetInput,
};
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tracing::{debug, info};

use fis_common::crd::ExperimentState;
use fis_common::Error;

use crate::aws::{build_error, sdk_error};
use crate::converter::{
    ActionRequest, LogConfigurationRequest, StartRequest, StopConditionRequest, TargetRequest,
    TemplateRequest,
};

const SERVICE: &str = "fis";

/// A FIS experiment template as seen by the provider
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderTemplate {
    /// Template id
    pub id: String,
    /// Template description
    pub description: Option<String>,
}

/// A FIS experiment as seen by the provider
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderExperiment {
    /// Experiment id
    pub id: String,
    /// Parsed state; `None` when FIS reports a status this operator does not know
    pub state: Option<ExperimentState>,
    /// Status string exactly as FIS reported it
    pub raw_status: String,
    /// Reason attached to the status
    pub reason: Option<String>,
    /// When the run started
    pub start_time: Option<DateTime<Utc>>,
    /// When the run ended
    pub end_time: Option<DateTime<Utc>>,
    /// Accounts targeted by the run
    pub target_account_configurations_count: Option<i64>,
}

/// Summary entry from ListExperiments
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentSummary {
    /// Experiment id
    pub id: String,
    /// Parsed state
    pub state: Option<ExperimentState>,
    /// When the run was created
    pub start_time: Option<DateTime<Utc>>,
}

/// Operations the controllers need from FIS
///
/// Not-found responses on delete and stop are treated as success.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait FisApi: Send + Sync {
    /// Create a template, returning its id
    async fn create_template(&self, request: &TemplateRequest) -> Result<String, Error>;

    /// Update a template in place
    async fn update_template(&self, id: &str, request: &TemplateRequest) -> Result<(), Error>;

    /// Delete a template
    async fn delete_template(&self, id: &str) -> Result<(), Error>;

    /// Fetch a template; `None` when it no longer exists
    async fn get_template(&self, id: &str) -> Result<Option<ProviderTemplate>, Error>;

    /// Start an experiment run
    async fn start_experiment(&self, request: &StartRequest) -> Result<ProviderExperiment, Error>;

    /// Fetch the current state of a run
    async fn get_experiment(&self, id: &str) -> Result<ProviderExperiment, Error>;

    /// Stop a run
    async fn stop_experiment(&self, id: &str) -> Result<(), Error>;

    /// List every run of a template
    async fn list_experiments(&self, template_id: &str) -> Result<Vec<ExperimentSummary>, Error>;
}

/// [`FisApi`] backed by the AWS SDK
#[derive(Clone, Debug)]
pub struct FisClient {
    client: aws_sdk_fis::Client,
}

impl FisClient {
    /// Create a client from shared SDK configuration
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_fis::Client::new(config),
        }
    }
}

#[async_trait]
impl FisApi for FisClient {
    async fn create_template(&self, request: &TemplateRequest) -> Result<String, Error> {
        const OP: &str = "CreateExperimentTemplate";

        let mut op = self
            .client
            .create_experiment_template()
            .client_token(uuid::Uuid::new_v4().to_string())
            .description(&request.description)
            .role_arn(&request.role_arn);

        for (name, target) in &request.targets {
            op = op.targets(name, create_target(target).map_err(|e| build_error(SERVICE, OP, e))?);
        }
        for (name, action) in &request.actions {
            op = op.actions(name, create_action(action).map_err(|e| build_error(SERVICE, OP, e))?);
        }
        for stop in &request.stop_conditions {
            op = op.stop_conditions(
                create_stop_condition(stop).map_err(|e| build_error(SERVICE, OP, e))?,
            );
        }
        for (key, value) in &request.tags {
            op = op.tags(key, value);
        }
        if let Some(options) = &request.experiment_options {
            op = op.experiment_options(
                CreateExperimentTemplateExperimentOptionsInput::builder()
                    .set_account_targeting(
                        options.account_targeting.as_deref().map(AccountTargeting::from),
                    )
                    .set_empty_target_resolution_mode(
                        options
                            .empty_target_resolution_mode
                            .as_deref()
                            .map(EmptyTargetResolutionMode::from),
                    )
                    .build(),
            );
        }
        if let Some(logs) = &request.log_configuration {
            op = op.log_configuration(
                create_log_configuration(logs).map_err(|e| build_error(SERVICE, OP, e))?,
            );
        }
        if let Some(report) = &request.report_configuration {
            op = op.experiment_report_configuration(
                CreateExperimentTemplateReportConfigurationInput::builder()
                    .set_pre_experiment_duration(report.pre_experiment_duration.clone())
                    .set_post_experiment_duration(report.post_experiment_duration.clone())
                    .build(),
            );
        }

        let output = op.send().await.map_err(|e| sdk_error(SERVICE, OP, e))?;
        let id = output
            .experiment_template()
            .and_then(|t| t.id())
            .map(str::to_string)
            .ok_or_else(|| Error::provider(SERVICE, OP, "response did not include a template id"))?;

        info!(template_id = %id, "created FIS experiment template");
        Ok(id)
    }

    async fn update_template(&self, id: &str, request: &TemplateRequest) -> Result<(), Error> {
        const OP: &str = "UpdateExperimentTemplate";

        let mut op = self
            .client
            .update_experiment_template()
            .id(id)
            .description(&request.description)
            .role_arn(&request.role_arn);

        for (name, target) in &request.targets {
            op = op.targets(name, update_target(target).map_err(|e| build_error(SERVICE, OP, e))?);
        }
        for (name, action) in &request.actions {
            op = op.actions(name, update_action(action));
        }
        for stop in &request.stop_conditions {
            op = op.stop_conditions(
                update_stop_condition(stop).map_err(|e| build_error(SERVICE, OP, e))?,
            );
        }
        // account targeting cannot change after creation
        if let Some(mode) = request
            .experiment_options
            .as_ref()
            .and_then(|o| o.empty_target_resolution_mode.as_deref())
        {
            op = op.experiment_options(
                UpdateExperimentTemplateExperimentOptionsInput::builder()
                    .empty_target_resolution_mode(EmptyTargetResolutionMode::from(mode))
                    .build(),
            );
        }
        if let Some(logs) = &request.log_configuration {
            op = op.log_configuration(
                update_log_configuration(logs).map_err(|e| build_error(SERVICE, OP, e))?,
            );
        }
        if let Some(report) = &request.report_configuration {
            op = op.experiment_report_configuration(
                UpdateExperimentTemplateReportConfigurationInput::builder()
                    .set_pre_experiment_duration(report.pre_experiment_duration.clone())
                    .set_post_experiment_duration(report.post_experiment_duration.clone())
                    .build(),
            );
        }

        op.send().await.map_err(|e| sdk_error(SERVICE, OP, e))?;
        info!(template_id = %id, "updated FIS experiment template");
        Ok(())
    }

    async fn delete_template(&self, id: &str) -> Result<(), Error> {
        match self
            .client
            .delete_experiment_template()
            .id(id)
            .send()
            .await
        {
            Ok(_) => {
                info!(template_id = %id, "deleted FIS experiment template");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                debug!(template_id = %id, "FIS experiment template already gone");
                Ok(())
            }
            Err(e) => Err(sdk_error(SERVICE, "DeleteExperimentTemplate", e)),
        }
    }

    async fn get_template(&self, id: &str) -> Result<Option<ProviderTemplate>, Error> {
        match self.client.get_experiment_template().id(id).send().await {
            Ok(output) => Ok(output.experiment_template().map(|t| ProviderTemplate {
                id: t.id().unwrap_or(id).to_string(),
                description: t.description().map(str::to_string),
            })),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(sdk_error(SERVICE, "GetExperimentTemplate", e)),
        }
    }

    async fn start_experiment(&self, request: &StartRequest) -> Result<ProviderExperiment, Error> {
        const OP: &str = "StartExperiment";

        let mut op = self
            .client
            .start_experiment()
            .client_token(&request.client_token)
            .experiment_template_id(&request.template_id);
        for (key, value) in &request.tags {
            op = op.tags(key, value);
        }

        let output = op.send().await.map_err(|e| sdk_error(SERVICE, OP, e))?;
        let experiment = output
            .experiment()
            .ok_or_else(|| Error::provider(SERVICE, OP, "response did not include an experiment"))?;
        let experiment = provider_experiment(experiment, OP)?;

        info!(
            experiment_id = %experiment.id,
            template_id = %request.template_id,
            "started FIS experiment"
        );
        Ok(experiment)
    }

    async fn get_experiment(&self, id: &str) -> Result<ProviderExperiment, Error> {
        const OP: &str = "GetExperiment";

        let output = self
            .client
            .get_experiment()
            .id(id)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, OP, e))?;
        let experiment = output
            .experiment()
            .ok_or_else(|| Error::provider(SERVICE, OP, "response did not include an experiment"))?;
        provider_experiment(experiment, OP)
    }

    async fn stop_experiment(&self, id: &str) -> Result<(), Error> {
        match self.client.stop_experiment().id(id).send().await {
            Ok(_) => {
                info!(experiment_id = %id, "stopped FIS experiment");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error(SERVICE, "StopExperiment", e)),
        }
    }

    async fn list_experiments(&self, template_id: &str) -> Result<Vec<ExperimentSummary>, Error> {
        let mut summaries = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_experiments()
                .experiment_template_id(template_id)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| sdk_error(SERVICE, "ListExperiments", e))?;

            for summary in output.experiments() {
                if summary.experiment_template_id() != Some(template_id) {
                    continue;
                }
                let Some(id) = summary.id() else { continue };
                summaries.push(ExperimentSummary {
                    id: id.to_string(),
                    state: summary
                        .state()
                        .and_then(|s| s.status())
                        .and_then(|s| ExperimentState::from_provider(s.as_str())),
                    start_time: summary.creation_time().and_then(to_chrono),
                });
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(summaries)
    }
}

fn provider_experiment(
    experiment: &aws_sdk_fis::types::Experiment,
    operation: &str,
) -> Result<ProviderExperiment, Error> {
    let id = experiment
        .id()
        .ok_or_else(|| Error::provider(SERVICE, operation, "experiment has no id"))?;
    let raw_status = experiment
        .state()
        .and_then(|s| s.status())
        .map(|s| s.as_str().to_string())
        .unwrap_or_default();

    Ok(ProviderExperiment {
        id: id.to_string(),
        state: ExperimentState::from_provider(&raw_status),
        raw_status,
        reason: experiment
            .state()
            .and_then(|s| s.reason())
            .map(str::to_string),
        start_time: experiment.start_time().and_then(to_chrono),
        end_time: experiment.end_time().and_then(to_chrono),
        target_account_configurations_count: experiment.target_account_configurations_count(),
    })
}

fn to_chrono(value: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

type BuildResult<T> = Result<T, aws_sdk_fis::error::BuildError>;

fn create_target(target: &TargetRequest) -> BuildResult<CreateExperimentTemplateTargetInput> {
    let mut builder = CreateExperimentTemplateTargetInput::builder()
        .resource_type(&target.resource_type)
        .selection_mode(&target.selection_mode);
    for (key, value) in &target.parameters {
        builder = builder.parameters(key, value);
    }
    for filter in &target.filters {
        builder = builder.filters(
            ExperimentTemplateTargetInputFilter::builder()
                .path(&filter.path)
                .set_values(Some(filter.values.clone()))
                .build()?,
        );
    }
    builder.build()
}

fn update_target(target: &TargetRequest) -> BuildResult<UpdateExperimentTemplateTargetInput> {
    let mut builder = UpdateExperimentTemplateTargetInput::builder()
        .resource_type(&target.resource_type)
        .selection_mode(&target.selection_mode);
    for (key, value) in &target.parameters {
        builder = builder.parameters(key, value);
    }
    for filter in &target.filters {
        builder = builder.filters(
            ExperimentTemplateTargetInputFilter::builder()
                .path(&filter.path)
                .set_values(Some(filter.values.clone()))
                .build()?,
        );
    }
    builder.build()
}

fn create_action(action: &ActionRequest) -> BuildResult<CreateExperimentTemplateActionInput> {
    let mut builder = CreateExperimentTemplateActionInput::builder()
        .action_id(&action.action_id)
        .set_description(action.description.clone());
    for (key, value) in &action.parameters {
        builder = builder.parameters(key, value);
    }
    for (key, value) in &action.targets {
        builder = builder.targets(key, value);
    }
    if !action.start_after.is_empty() {
        builder = builder.set_start_after(Some(action.start_after.clone()));
    }
    builder.build()
}

fn update_action(action: &ActionRequest) -> UpdateExperimentTemplateActionInputItem {
    let mut builder = UpdateExperimentTemplateActionInputItem::builder()
        .action_id(&action.action_id)
        .set_description(action.description.clone());
    for (key, value) in &action.parameters {
        builder = builder.parameters(key, value);
    }
    for (key, value) in &action.targets {
        builder = builder.targets(key, value);
    }
    if !action.start_after.is_empty() {
        builder = builder.set_start_after(Some(action.start_after.clone()));
    }
    builder.build()
}

fn create_stop_condition(
    stop: &StopConditionRequest,
) -> BuildResult<CreateExperimentTemplateStopConditionInput> {
    CreateExperimentTemplateStopConditionInput::builder()
        .source(&stop.source)
        .set_value(stop.value.clone())
        .build()
}

fn update_stop_condition(
    stop: &StopConditionRequest,
) -> BuildResult<UpdateExperimentTemplateStopConditionInput> {
    UpdateExperimentTemplateStopConditionInput::builder()
        .source(&stop.source)
        .set_value(stop.value.clone())
        .build()
}

fn log_destinations(
    logs: &LogConfigurationRequest,
) -> BuildResult<(
    Option<ExperimentTemplateCloudWatchLogsLogConfigurationInput>,
    Option<ExperimentTemplateS3LogConfigurationInput>,
)> {
    let cloud_watch = logs
        .cloud_watch_log_group_arn
        .as_ref()
        .map(|arn| {
            ExperimentTemplateCloudWatchLogsLogConfigurationInput::builder()
                .log_group_arn(arn)
                .build()
        })
        .transpose()?;
    let s3 = logs
        .s3
        .as_ref()
        .map(|s3| {
            ExperimentTemplateS3LogConfigurationInput::builder()
                .bucket_name(&s3.bucket_name)
                .set_prefix(s3.prefix.clone())
                .build()
        })
        .transpose()?;
    Ok((cloud_watch, s3))
}

fn create_log_configuration(
    logs: &LogConfigurationRequest,
) -> BuildResult<CreateExperimentTemplateLogConfigurationInput> {
    let (cloud_watch, s3) = log_destinations(logs)?;
    CreateExperimentTemplateLogConfigurationInput::builder()
        .log_schema_version(logs.log_schema_version)
        .set_cloud_watch_logs_configuration(cloud_watch)
        .set_s3_configuration(s3)
        .build()
}

fn update_log_configuration(
    logs: &LogConfigurationRequest,
) -> BuildResult<UpdateExperimentTemplateLogConfigurationInput> {
    let (cloud_watch, s3) = log_destinations(logs)?;
    Ok(UpdateExperimentTemplateLogConfigurationInput::builder()
        .log_schema_version(logs.log_schema_version)
        .set_cloud_watch_logs_configuration(cloud_watch)
        .set_s3_configuration(s3)
        .build())
}
