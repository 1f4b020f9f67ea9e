//! Resource converter: ExperimentTemplate/Experiment specs to FIS request models
//!
//! Everything here is pure. The output types are provider-neutral plain
//! structs; [`crate::fis::FisClient`] maps them onto the SDK builders.

use std::collections::BTreeMap;

use fis_common::crd::{
    ActionSpec, ActionType, ExperimentTemplateSpec, SelectionScope, StopCondition, Tag, TargetSpec,
};
use fis_common::{Error, MANAGED_BY_VALUE};

/// FIS resource type for EKS pods
pub const EKS_POD_RESOURCE_TYPE: &str = "aws:eks:pod";

/// Key under which an action references its target
pub const POD_TARGET_KEY: &str = "Pods";

/// Log schema version used when the spec leaves it unset
pub const DEFAULT_LOG_SCHEMA_VERSION: i32 = 2;

/// Tag key marking FIS resources created by this operator
pub const MANAGED_BY_TAG: &str = "managed-by";

/// Inputs resolved by the reconciler that the spec alone does not carry
#[derive(Clone, Copy, Debug)]
pub struct ConversionInputs<'a> {
    /// EKS cluster name or ARN
    pub cluster_identifier: &'a str,
    /// Kubernetes service account FIS uses inside target namespaces
    pub service_account: &'a str,
    /// IAM role FIS assumes
    pub role_arn: &'a str,
}

/// Everything needed to create or update a FIS experiment template
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateRequest {
    /// Template description (FIS requires one)
    pub description: String,
    /// IAM role ARN
    pub role_arn: String,
    /// Targets keyed by name
    pub targets: BTreeMap<String, TargetRequest>,
    /// Actions keyed by name
    pub actions: BTreeMap<String, ActionRequest>,
    /// Stop conditions, never empty
    pub stop_conditions: Vec<StopConditionRequest>,
    /// Experiment options
    pub experiment_options: Option<ExperimentOptionsRequest>,
    /// Log configuration
    pub log_configuration: Option<LogConfigurationRequest>,
    /// Report configuration
    pub report_configuration: Option<ReportConfigurationRequest>,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

/// One FIS target
#[derive(Clone, Debug, PartialEq)]
pub struct TargetRequest {
    /// Always [`EKS_POD_RESOURCE_TYPE`]
    pub resource_type: String,
    /// `ALL`, `COUNT(n)` or `PERCENT(n)`
    pub selection_mode: String,
    /// Target parameters (cluster, namespace, selector)
    pub parameters: BTreeMap<String, String>,
    /// Resource filters
    pub filters: Vec<FilterRequest>,
}

/// FIS target filter
#[derive(Clone, Debug, PartialEq)]
pub struct FilterRequest {
    /// Attribute path
    pub path: String,
    /// Accepted values
    pub values: Vec<String>,
}

/// One FIS action
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    /// `aws:eks:<fault>`
    pub action_id: String,
    /// Optional description
    pub description: Option<String>,
    /// Action parameters
    pub parameters: BTreeMap<String, String>,
    /// Target references (`Pods` -> target name)
    pub targets: BTreeMap<String, String>,
    /// Actions that must finish first
    pub start_after: Vec<String>,
}

/// FIS stop condition
#[derive(Clone, Debug, PartialEq)]
pub struct StopConditionRequest {
    /// `none` or `aws:cloudwatch:alarm`
    pub source: String,
    /// Alarm ARN
    pub value: Option<String>,
}

/// FIS experiment options
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentOptionsRequest {
    /// Only accepted on create
    pub account_targeting: Option<String>,
    /// Accepted on create and update
    pub empty_target_resolution_mode: Option<String>,
}

/// FIS log configuration
#[derive(Clone, Debug, PartialEq)]
pub struct LogConfigurationRequest {
    /// Log schema version
    pub log_schema_version: i32,
    /// CloudWatch Logs group ARN
    pub cloud_watch_log_group_arn: Option<String>,
    /// S3 destination
    pub s3: Option<S3LogRequest>,
}

/// S3 log destination
#[derive(Clone, Debug, PartialEq)]
pub struct S3LogRequest {
    /// Bucket
    pub bucket_name: String,
    /// Key prefix
    pub prefix: Option<String>,
}

/// FIS report configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ReportConfigurationRequest {
    /// ISO-8601 pre-experiment window
    pub pre_experiment_duration: Option<String>,
    /// ISO-8601 post-experiment window
    pub post_experiment_duration: Option<String>,
}

/// Everything needed to start one experiment run
#[derive(Clone, Debug, PartialEq)]
pub struct StartRequest {
    /// FIS template id
    pub template_id: String,
    /// Idempotency token
    pub client_token: String,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

/// Convert a scope expression to a FIS selection mode.
///
/// `"ALL"` -> `"ALL"`, `"3"` -> `"COUNT(3)"`, `"50%"` -> `"PERCENT(50)"`;
/// already-converted values are returned unchanged.
pub fn parse_scope(scope: &str) -> Result<String, Error> {
    scope
        .parse::<SelectionScope>()
        .map(|s| s.to_string())
        .map_err(Error::validation)
}

/// Convert a short duration ("5m") to ISO-8601 ("PT5M").
///
/// Values already starting with `PT` are returned unchanged.
pub fn convert_duration(duration: &str) -> String {
    let duration = duration.trim();
    if duration.starts_with("PT") {
        return duration.to_string();
    }
    format!("PT{}", duration.to_ascii_uppercase())
}

/// FIS stop condition source for a spec source
pub fn stop_condition_source(source: &str) -> String {
    match source.trim() {
        "cloudwatch-alarm" => "aws:cloudwatch:alarm".to_string(),
        other => other.to_string(),
    }
}

/// `k=v,k2=v2` in key order
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Tag list to map. Later duplicates win.
pub fn tags_to_map(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|t| (t.key.clone(), t.value.clone()))
        .collect()
}

/// Build the FIS target for one spec target
pub fn convert_target(target: &TargetSpec, cluster_identifier: &str) -> Result<TargetRequest, Error> {
    let mut parameters = BTreeMap::from([
        (
            "clusterIdentifier".to_string(),
            cluster_identifier.to_string(),
        ),
        ("namespace".to_string(), target.namespace().to_string()),
        ("selectorType".to_string(), "labelSelector".to_string()),
        (
            "selectorValue".to_string(),
            label_selector(&target.label_selector),
        ),
    ]);
    if let Some(container) = target
        .target_container_name
        .as_deref()
        .filter(|c| !c.is_empty())
    {
        parameters.insert("targetContainerName".to_string(), container.to_string());
    }

    Ok(TargetRequest {
        resource_type: EKS_POD_RESOURCE_TYPE.to_string(),
        selection_mode: parse_scope(target.scope.as_deref().unwrap_or_default())?,
        parameters,
        filters: target
            .filters
            .iter()
            .map(|f| FilterRequest {
                path: f.path.clone(),
                values: f.values.clone(),
            })
            .collect(),
    })
}

/// Build the FIS action for one spec action
pub fn convert_action(action: &ActionSpec, service_account: &str) -> ActionRequest {
    let mut parameters = BTreeMap::new();
    // pod-delete has no duration parameter in FIS
    if action.action_type != ActionType::PodDelete {
        parameters.insert("duration".to_string(), convert_duration(&action.duration));
    }
    if !service_account.is_empty() {
        parameters.insert(
            "kubernetesServiceAccount".to_string(),
            service_account.to_string(),
        );
    }
    parameters.extend(
        action
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    ActionRequest {
        action_id: action.action_type.provider_action_id(),
        description: action.description.clone().filter(|d| !d.is_empty()),
        parameters,
        targets: BTreeMap::from([(POD_TARGET_KEY.to_string(), action.target.clone())]),
        start_after: action.start_after.clone(),
    }
}

/// Stop conditions, defaulting to a single `none` condition
pub fn convert_stop_conditions(conditions: &[StopCondition]) -> Vec<StopConditionRequest> {
    if conditions.is_empty() {
        return vec![StopConditionRequest {
            source: "none".to_string(),
            value: None,
        }];
    }
    conditions
        .iter()
        .map(|c| StopConditionRequest {
            source: stop_condition_source(&c.source),
            value: c.value.clone().filter(|v| !v.is_empty()),
        })
        .collect()
}

/// Build the full create/update request for a template
pub fn build_template_request(
    name: &str,
    spec: &ExperimentTemplateSpec,
    inputs: &ConversionInputs<'_>,
) -> Result<TemplateRequest, Error> {
    let targets = spec
        .targets
        .iter()
        .map(|t| Ok((t.name.clone(), convert_target(t, inputs.cluster_identifier)?)))
        .collect::<Result<BTreeMap<_, _>, Error>>()?;

    let actions = spec
        .actions
        .iter()
        .map(|a| (a.name.clone(), convert_action(a, inputs.service_account)))
        .collect();

    let experiment_options = spec.experiment_options.as_ref().and_then(|o| {
        let account_targeting = o.account_targeting.clone().filter(|v| !v.is_empty());
        let empty_target_resolution_mode = o
            .empty_target_resolution_mode
            .clone()
            .filter(|v| !v.is_empty());
        (account_targeting.is_some() || empty_target_resolution_mode.is_some()).then_some(
            ExperimentOptionsRequest {
                account_targeting,
                empty_target_resolution_mode,
            },
        )
    });

    let log_configuration = spec
        .log_configuration
        .as_ref()
        .map(|l| LogConfigurationRequest {
            log_schema_version: l.log_schema_version.unwrap_or(DEFAULT_LOG_SCHEMA_VERSION),
            cloud_watch_log_group_arn: l
                .cloud_watch_logs_configuration
                .as_ref()
                .map(|c| c.log_group_arn.clone()),
            s3: l.s3_configuration.as_ref().map(|s| S3LogRequest {
                bucket_name: s.bucket_name.clone(),
                prefix: s.prefix.clone().filter(|p| !p.is_empty()),
            }),
        });

    let report_configuration =
        spec.experiment_report_configuration
            .as_ref()
            .map(|r| ReportConfigurationRequest {
                pre_experiment_duration: r.pre_experiment_duration.as_deref().map(convert_duration),
                post_experiment_duration: r
                    .post_experiment_duration
                    .as_deref()
                    .map(convert_duration),
            });

    let mut tags = tags_to_map(&spec.tags);
    tags.entry(MANAGED_BY_TAG.to_string())
        .or_insert_with(|| MANAGED_BY_VALUE.to_string());

    Ok(TemplateRequest {
        description: spec
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("ExperimentTemplate {} managed by fis-operator", name)),
        role_arn: inputs.role_arn.to_string(),
        targets,
        actions,
        stop_conditions: convert_stop_conditions(&spec.stop_conditions),
        experiment_options,
        log_configuration,
        report_configuration,
        tags,
    })
}

/// Build the start request for one run
pub fn build_start_request(
    template_id: &str,
    client_token: String,
    experiment_name: &str,
    tags: &[Tag],
) -> StartRequest {
    let mut tags = tags_to_map(tags);
    tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());
    tags.insert("fis.dev/experiment".to_string(), experiment_name.to_string());
    StartRequest {
        template_id: template_id.to_string(),
        client_token,
        tags,
    }
}
