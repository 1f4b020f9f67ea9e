//! Custom Resource Definitions for the FIS operator

mod experiment;
mod template;
mod types;

pub use experiment::{
    Experiment, ExperimentSpec, ExperimentState, ExperimentStatus, ExperimentTemplateRef,
    DEFAULT_FAILED_HISTORY_LIMIT, DEFAULT_SUCCESSFUL_HISTORY_LIMIT,
};
pub use template::{
    ActionSpec, ActionType, CloudWatchLogsConfiguration, ExperimentOptions,
    ExperimentReportConfiguration, ExperimentTemplate, ExperimentTemplateSpec,
    ExperimentTemplateStatus, LogConfiguration, S3Configuration, SelectionScope, StopCondition,
    TargetFilter, TargetSpec, TemplatePhase, DEFAULT_TARGET_NAMESPACE,
};
pub use types::{
    set_condition, Condition, ConditionStatus, Tag, CONDITION_READY, CONDITION_STALLED,
};
