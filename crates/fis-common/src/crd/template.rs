//! ExperimentTemplate CRD
//!
//! A cluster-scoped, declarative FIS experiment template targeting EKS pods.
//! The controller keeps an AWS FIS template, an IAM role, an EKS access entry
//! and per-namespace RBAC in sync with it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionStatus, Tag, CONDITION_STALLED};
use crate::Error;

/// Namespace used when a target does not name one
pub const DEFAULT_TARGET_NAMESPACE: &str = "default";

/// ExperimentTemplate describes what to break, for how long, and when to stop.
///
/// Example:
/// ```yaml
/// apiVersion: fis.dev/v1alpha1
/// kind: ExperimentTemplate
/// metadata:
///   name: web-cpu-stress
/// spec:
///   description: Stress half of the web pods
///   targets:
///     - name: web
///       namespace: shop
///       labelSelector:
///         app: web
///       scope: 50%
///   actions:
///     - name: cpu
///       type: pod-cpu-stress
///       duration: 5m
///       target: web
///       parameters:
///         percent: "80"
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fis.dev",
    version = "v1alpha1",
    kind = "ExperimentTemplate",
    status = "ExperimentTemplateStatus",
    shortname = "fistpl",
    printcolumn = r#"{"name":"Template ID","type":"string","jsonPath":".status.templateId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentTemplateSpec {
    /// Free-form description forwarded to FIS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Pod groups the actions act on
    pub targets: Vec<TargetSpec>,

    /// Fault actions to run
    pub actions: Vec<ActionSpec>,

    /// Conditions that halt a running experiment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_conditions: Vec<StopCondition>,

    /// FIS experiment options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_options: Option<ExperimentOptions>,

    /// Where FIS writes experiment logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_configuration: Option<LogConfiguration>,

    /// Experiment report settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_report_configuration: Option<ExperimentReportConfiguration>,

    /// Tags applied to the FIS template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,

    /// Create a dedicated IAM role when no role is supplied
    #[serde(default = "default_true")]
    pub auto_create_role: bool,

    /// Caller-owned IAM role for FIS to assume. Never deleted by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A group of pods selected by labels in one namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Target name referenced by actions
    pub name: String,

    /// Namespace holding the pods (defaults to "default")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Pod label selector
    pub label_selector: BTreeMap<String, String>,

    /// How many matching pods to act on: ALL, a count ("3") or a percentage ("50%")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Container to inject faults into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_container_name: Option<String>,

    /// Additional FIS resource filters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<TargetFilter>,
}

impl TargetSpec {
    /// Namespace with the default applied
    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_TARGET_NAMESPACE)
    }
}

/// FIS target filter
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TargetFilter {
    /// Attribute path
    pub path: String,
    /// Accepted values
    pub values: Vec<String>,
}

/// A single fault injection step
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Action name, unique within the template
    pub name: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Fault to inject
    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// How long the fault lasts ("5m", "30s", or ISO-8601 "PT5M")
    pub duration: String,

    /// Name of the target this action acts on
    pub target: String,

    /// Action-specific parameters passed through to FIS
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Actions that must finish before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_after: Vec<String>,
}

/// Supported EKS pod faults
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    /// Stress CPU in the target pods
    PodCpuStress,
    /// Stress memory in the target pods
    PodMemoryStress,
    /// Stress disk I/O in the target pods
    PodIoStress,
    /// Add network latency
    PodNetworkLatency,
    /// Drop network packets
    PodNetworkPacketLoss,
    /// Delete the target pods
    PodDelete,
}

impl ActionType {
    /// Name as written in the CRD
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::PodCpuStress => "pod-cpu-stress",
            ActionType::PodMemoryStress => "pod-memory-stress",
            ActionType::PodIoStress => "pod-io-stress",
            ActionType::PodNetworkLatency => "pod-network-latency",
            ActionType::PodNetworkPacketLoss => "pod-network-packet-loss",
            ActionType::PodDelete => "pod-delete",
        }
    }

    /// FIS action identifier
    pub fn provider_action_id(&self) -> String {
        format!("aws:eks:{}", self.as_str())
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition that stops a running experiment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StopCondition {
    /// Source: "none" or "cloudwatch-alarm"
    pub source: String,
    /// Alarm ARN when the source is an alarm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// FIS experiment options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentOptions {
    /// "single-account" or "multi-account"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_targeting: Option<String>,
    /// "fail" or "skip"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_target_resolution_mode: Option<String>,
}

/// Experiment log destinations
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogConfiguration {
    /// Log schema version (defaults to 2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_schema_version: Option<i32>,
    /// CloudWatch Logs destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_watch_logs_configuration: Option<CloudWatchLogsConfiguration>,
    /// S3 destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_configuration: Option<S3Configuration>,
}

/// CloudWatch Logs destination
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudWatchLogsConfiguration {
    /// Log group ARN
    pub log_group_arn: String,
}

/// S3 destination
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Configuration {
    /// Bucket name
    pub bucket_name: String,
    /// Key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Experiment report window
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentReportConfiguration {
    /// Window captured before the experiment ("10m" or "PT10M")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_experiment_duration: Option<String>,
    /// Window captured after the experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_experiment_duration: Option<String>,
}

/// How many of the selected pods an action affects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionScope {
    /// Every matching pod
    All,
    /// A fixed number of pods
    Count(u32),
    /// A percentage of pods
    Percent(u32),
}

impl FromStr for SelectionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("ALL") {
            return Ok(SelectionScope::All);
        }

        let upper = trimmed.to_ascii_uppercase();
        let parse = |n: &str| -> Result<u32, String> {
            n.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid scope '{}': expected ALL, N or N%", s))
        };

        if let Some(n) = trimmed.strip_suffix('%') {
            return percent(parse(n)?, s);
        }
        if let Some(n) = upper
            .strip_prefix("PERCENT(")
            .and_then(|r| r.strip_suffix(')'))
        {
            return percent(parse(n)?, s);
        }
        let count = match upper.strip_prefix("COUNT(").and_then(|r| r.strip_suffix(')')) {
            Some(n) => parse(n)?,
            None => parse(trimmed)?,
        };
        if count == 0 {
            return Err(format!("invalid scope '{}': count must be at least 1", s));
        }
        Ok(SelectionScope::Count(count))
    }
}

fn percent(value: u32, raw: &str) -> Result<SelectionScope, String> {
    if value == 0 || value > 100 {
        return Err(format!(
            "invalid scope '{}': percentage must be between 1 and 100",
            raw
        ));
    }
    Ok(SelectionScope::Percent(value))
}

impl fmt::Display for SelectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionScope::All => f.write_str("ALL"),
            SelectionScope::Count(n) => write!(f, "COUNT({})", n),
            SelectionScope::Percent(n) => write!(f, "PERCENT({})", n),
        }
    }
}

/// Accepts "30s", "5m", "1h30m" (any case) or anything already in "PT..." form
fn is_valid_duration(duration: &str) -> bool {
    let duration = duration.trim();
    if let Some(rest) = duration.strip_prefix("PT") {
        return !rest.is_empty();
    }
    if duration.is_empty() {
        return false;
    }

    let mut saw_digit = false;
    for ch in duration.chars() {
        match ch {
            '0'..='9' => saw_digit = true,
            's' | 'S' | 'm' | 'M' | 'h' | 'H' if saw_digit => saw_digit = false,
            _ => return false,
        }
    }
    // must end on a unit
    !saw_digit
}

impl ExperimentTemplateSpec {
    /// Validate cross-field references the schema cannot express
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if self.targets.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.targets",
                "at least one target is required",
            ));
        }
        if self.actions.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.actions",
                "at least one action is required",
            ));
        }

        let mut target_names = HashSet::new();
        for (i, target) in self.targets.iter().enumerate() {
            if target.name.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.targets[{}].name", i),
                    "target name must not be empty",
                ));
            }
            if !target_names.insert(target.name.as_str()) {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.targets[{}].name", i),
                    format!("duplicate target name '{}'", target.name),
                ));
            }
            if target.label_selector.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.targets[{}].labelSelector", i),
                    "label selector must have at least one label",
                ));
            }
            if let Some(scope) = &target.scope {
                scope.parse::<SelectionScope>().map_err(|e| {
                    Error::validation_for_field(name, format!("spec.targets[{}].scope", i), e)
                })?;
            }
        }

        let action_names: HashSet<&str> = self.actions.iter().map(|a| a.name.as_str()).collect();
        if action_names.len() != self.actions.len() {
            return Err(Error::validation_for_field(
                name,
                "spec.actions",
                "action names must be unique",
            ));
        }

        for (i, action) in self.actions.iter().enumerate() {
            if action.name.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.actions[{}].name", i),
                    "action name must not be empty",
                ));
            }
            if !target_names.contains(action.target.as_str()) {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.actions[{}].target", i),
                    format!("target '{}' is not defined", action.target),
                ));
            }
            if !is_valid_duration(&action.duration) {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.actions[{}].duration", i),
                    format!("invalid duration '{}'", action.duration),
                ));
            }
            for dep in &action.start_after {
                if dep == &action.name || !action_names.contains(dep.as_str()) {
                    return Err(Error::validation_for_field(
                        name,
                        format!("spec.actions[{}].startAfter", i),
                        format!("startAfter references unknown action '{}'", dep),
                    ));
                }
            }
        }

        for (i, stop) in self.stop_conditions.iter().enumerate() {
            if stop.source.trim().is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    format!("spec.stopConditions[{}].source", i),
                    "stop condition source must not be empty",
                ));
            }
        }

        if let Some(report) = &self.experiment_report_configuration {
            for d in [
                &report.pre_experiment_duration,
                &report.post_experiment_duration,
            ]
            .into_iter()
            .flatten()
            {
                if !is_valid_duration(d) {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.experimentReportConfiguration",
                        format!("invalid duration '{}'", d),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Distinct target namespaces, sorted
    pub fn target_namespaces(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|t| t.namespace().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// ExperimentTemplate status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentTemplateStatus {
    /// FIS experiment template id, empty until created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// IAM role FIS assumes for this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,

    /// True when the operator created `role_arn` and owns its deletion
    #[serde(default)]
    pub role_managed: bool,

    /// Current phase
    #[serde(default)]
    pub phase: TemplatePhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation last pushed to FIS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Namespaces currently holding this template's RBAC objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_namespaces: Vec<String>,

    /// ServiceAccount provisioned in those namespaces and passed to FIS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Last successful write to FIS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ExperimentTemplateStatus {
    /// FIS already matches this generation of the spec
    pub fn is_synced(&self, generation: i64) -> bool {
        self.template_id.is_some()
            && self.phase == TemplatePhase::Ready
            && self.observed_generation == Some(generation)
    }

    /// A terminal failure was recorded for this generation
    pub fn is_stalled_at(&self, generation: i64) -> bool {
        self.conditions.iter().any(|c| {
            c.type_ == CONDITION_STALLED
                && c.status == ConditionStatus::True
                && c.observed_generation == Some(generation)
        })
    }
}

/// ExperimentTemplate lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TemplatePhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Provisioning or updating external resources
    Creating,
    /// FIS template matches the spec
    Ready,
    /// Unrecoverable error, see message
    Failed,
    /// Cleaning up external resources
    Deleting,
}

impl fmt::Display for TemplatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn target(name: &str, ns: Option<&str>) -> TargetSpec {
        TargetSpec {
            name: name.to_string(),
            namespace: ns.map(str::to_string),
            label_selector: BTreeMap::from([("app".to_string(), name.to_string())]),
            scope: None,
            target_container_name: None,
            filters: vec![],
        }
    }

    fn action(name: &str, target: &str) -> ActionSpec {
        ActionSpec {
            name: name.to_string(),
            description: None,
            action_type: ActionType::PodCpuStress,
            duration: "5m".to_string(),
            target: target.to_string(),
            parameters: BTreeMap::new(),
            start_after: vec![],
        }
    }

    fn spec() -> ExperimentTemplateSpec {
        ExperimentTemplateSpec {
            description: Some("cpu".to_string()),
            targets: vec![target("web", Some("shop"))],
            actions: vec![action("cpu", "web")],
            stop_conditions: vec![],
            experiment_options: None,
            log_configuration: None,
            experiment_report_configuration: None,
            tags: vec![],
            auto_create_role: true,
            role_arn: None,
        }
    }

    mod scope {
        use super::*;

        #[test]
        fn test_all_variants() {
            assert_eq!("ALL".parse(), Ok(SelectionScope::All));
            assert_eq!("all".parse(), Ok(SelectionScope::All));
            assert_eq!("".parse(), Ok(SelectionScope::All));
            assert_eq!(" 3 ".parse(), Ok(SelectionScope::Count(3)));
            assert_eq!("50%".parse(), Ok(SelectionScope::Percent(50)));
            assert_eq!("COUNT(2)".parse(), Ok(SelectionScope::Count(2)));
            assert_eq!("percent(25)".parse(), Ok(SelectionScope::Percent(25)));
        }

        #[test]
        fn test_rejects_garbage_and_out_of_range() {
            assert!("some".parse::<SelectionScope>().is_err());
            assert!("0".parse::<SelectionScope>().is_err());
            assert!("0%".parse::<SelectionScope>().is_err());
            assert!("150%".parse::<SelectionScope>().is_err());
        }

        #[test]
        fn test_display_is_fis_selection_mode() {
            assert_eq!(SelectionScope::All.to_string(), "ALL");
            assert_eq!(SelectionScope::Count(3).to_string(), "COUNT(3)");
            assert_eq!(SelectionScope::Percent(50).to_string(), "PERCENT(50)");
        }
    }

    #[test]
    fn test_duration_validation() {
        assert!(is_valid_duration("5m"));
        assert!(is_valid_duration("1h30m"));
        assert!(is_valid_duration("30S"));
        assert!(is_valid_duration("PT5M"));
        assert!(!is_valid_duration(""));
        assert!(!is_valid_duration("5"));
        assert!(!is_valid_duration("m5"));
        assert!(!is_valid_duration("5 minutes"));
    }

    #[test]
    fn test_action_type_serializes_kebab_case() {
        let json = serde_json::to_string(&ActionType::PodNetworkPacketLoss).unwrap();
        assert_eq!(json, "\"pod-network-packet-loss\"");
        assert_eq!(
            ActionType::PodDelete.provider_action_id(),
            "aws:eks:pod-delete"
        );
    }

    mod validation {
        use super::*;

        #[test]
        fn test_valid_spec_passes() {
            assert!(spec().validate("t").is_ok());
        }

        #[test]
        fn test_action_must_reference_existing_target() {
            let mut s = spec();
            s.actions[0].target = "db".to_string();
            let err = s.validate("t").unwrap_err();
            assert!(err.to_string().contains("target 'db' is not defined"));
        }

        #[test]
        fn test_start_after_must_reference_other_action() {
            let mut s = spec();
            s.actions[0].start_after = vec!["cpu".to_string()];
            assert!(s.validate("t").is_err());

            s.actions.push(action("mem", "web"));
            s.actions[0].start_after = vec!["mem".to_string()];
            assert!(s.validate("t").is_ok());
        }

        #[test]
        fn test_empty_collections_rejected() {
            let mut s = spec();
            s.targets.clear();
            assert!(s.validate("t").is_err());

            let mut s = spec();
            s.actions.clear();
            assert!(s.validate("t").is_err());
        }

        #[test]
        fn test_duplicate_names_rejected() {
            let mut s = spec();
            s.targets.push(target("web", None));
            assert!(s.validate("t").is_err());

            let mut s = spec();
            s.actions.push(action("cpu", "web"));
            assert!(s.validate("t").is_err());
        }

        #[test]
        fn test_bad_scope_and_duration_rejected() {
            let mut s = spec();
            s.targets[0].scope = Some("lots".to_string());
            assert!(s.validate("t").is_err());

            let mut s = spec();
            s.actions[0].duration = "forever".to_string();
            assert!(s.validate("t").is_err());
        }
    }

    #[test]
    fn test_target_namespaces_are_distinct_sorted_and_defaulted() {
        let mut s = spec();
        s.targets.push(target("api", Some("shop")));
        s.targets.push(target("cache", None));
        s.targets.push(target("edge", Some("")));
        assert_eq!(s.target_namespaces(), vec!["default", "shop"]);
    }

    #[test]
    fn test_spec_defaults_when_deserialized() {
        let yaml = r#"
targets:
  - name: web
    labelSelector:
      app: web
actions:
  - name: kill
    type: pod-delete
    duration: 1m
    target: web
"#;
        let s: ExperimentTemplateSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(s.auto_create_role);
        assert_eq!(s.targets[0].namespace(), "default");
        assert_eq!(s.actions[0].action_type, ActionType::PodDelete);
    }

    #[test]
    fn test_status_sync_and_stall_checks() {
        let mut status = ExperimentTemplateStatus {
            template_id: Some("EXT123".to_string()),
            phase: TemplatePhase::Ready,
            observed_generation: Some(2),
            ..Default::default()
        };
        assert!(status.is_synced(2));
        assert!(!status.is_synced(3));

        status.conditions.push(
            Condition::new(CONDITION_STALLED, ConditionStatus::True, "InvalidSpec", "bad")
                .with_generation(3),
        );
        assert!(status.is_stalled_at(3));
        assert!(!status.is_stalled_at(4));
    }

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = ExperimentTemplate::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "fis.dev");
    }
}
