//! Experiment CRD
//!
//! An Experiment is one run (or a cron-scheduled series of runs) of an
//! ExperimentTemplate. History of previous scheduled runs lives in FIS only.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, Tag};

/// Successful runs kept before older ones are reported for cleanup
pub const DEFAULT_SUCCESSFUL_HISTORY_LIMIT: i32 = 3;

/// Failed or stopped runs kept before older ones are reported for cleanup
pub const DEFAULT_FAILED_HISTORY_LIMIT: i32 = 1;

/// Experiment starts an ExperimentTemplate once, or on a cron schedule.
///
/// Example:
/// ```yaml
/// apiVersion: fis.dev/v1alpha1
/// kind: Experiment
/// metadata:
///   name: nightly-cpu
/// spec:
///   experimentTemplate:
///     name: web-cpu-stress
///   schedule: "0 3 * * *"
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fis.dev",
    version = "v1alpha1",
    kind = "Experiment",
    status = "ExperimentStatus",
    shortname = "fisexp",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Experiment ID","type":"string","jsonPath":".status.experimentId"}"#,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Next","type":"date","jsonPath":".status.nextScheduleTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Template to run, by FIS id or by ExperimentTemplate name
    pub experiment_template: ExperimentTemplateRef,

    /// Standard 5-field cron expression; unset means run once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Stop starting new runs
    #[serde(default)]
    pub suspend: bool,

    /// Completed runs to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_experiments_history_limit: Option<i32>,

    /// Failed or stopped runs to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_experiments_history_limit: Option<i32>,

    /// Tags applied to each FIS experiment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,

    /// Idempotency token for StartExperiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl ExperimentSpec {
    /// Schedule with blank values treated as unset
    pub fn schedule(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Successful history limit with the default applied
    pub fn successful_history_limit(&self) -> usize {
        limit(
            self.successful_experiments_history_limit,
            DEFAULT_SUCCESSFUL_HISTORY_LIMIT,
        )
    }

    /// Failed history limit with the default applied
    pub fn failed_history_limit(&self) -> usize {
        limit(
            self.failed_experiments_history_limit,
            DEFAULT_FAILED_HISTORY_LIMIT,
        )
    }
}

fn limit(value: Option<i32>, default: i32) -> usize {
    usize::try_from(value.unwrap_or(default)).unwrap_or(0)
}

/// Reference to a template by FIS id or by ExperimentTemplate name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExperimentTemplateRef {
    /// FIS experiment template id; takes precedence over `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of an ExperimentTemplate in this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// State of a FIS experiment run
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentState {
    /// Starting up
    Initiating,
    /// Waiting to run
    Pending,
    /// Actions are running
    Running,
    /// Finished successfully
    Completed,
    /// Being stopped
    Stopping,
    /// Stopped by a stop condition or a user
    Stopped,
    /// Failed
    Failed,
}

impl ExperimentState {
    /// Map a FIS status string. FIS "cancelled" is reported as stopped.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "initiating" => Some(Self::Initiating),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "stopping" => Some(Self::Stopping),
            "stopped" | "cancelled" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// A run in this state can still be stopped
    pub fn is_stoppable(&self) -> bool {
        matches!(self, Self::Initiating | Self::Pending | Self::Running)
    }

    /// Terminal success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiating => "initiating",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Experiment status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// FIS id of the current (or last) run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,

    /// Resolved FIS template id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// State of the current run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExperimentState>,

    /// Reason reported with the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the current run started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the current run ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Schedule slot of the most recent scheduled run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,

    /// Next schedule slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<DateTime<Utc>>,

    /// Number of runs in a non-terminal state (0 or 1)
    #[serde(default)]
    pub active: i32,

    /// Accounts targeted by the current run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_account_configurations_count: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ExperimentStatus {
    /// The recorded run may still change state
    pub fn has_active_run(&self) -> bool {
        self.experiment_id.is_some() && self.state.is_some_and(|s| !s.is_terminal())
    }
}
