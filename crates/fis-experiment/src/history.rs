//! Bookkeeping of finished scheduled runs
//!
//! FIS has no API to delete an experiment; records expire on their own after
//! 120 days. Runs beyond the configured limits are only reported.

use fis_common::crd::ExperimentSpec;
use fis_common::Error;
use fis_provider::{ExperimentSummary, FisApi};
use tracing::info;

/// How long FIS keeps experiment records
pub const PROVIDER_RETENTION_DAYS: u32 = 120;

/// Finished runs split by outcome, newest first, with everything over the limits
#[derive(Clone, Debug, Default, PartialEq)]
pub struct History {
    /// Completed runs
    pub successful: Vec<ExperimentSummary>,
    /// Failed or stopped runs
    pub failed: Vec<ExperimentSummary>,
    /// Runs beyond the history limits
    pub expired: Vec<ExperimentSummary>,
}

/// Partition runs by outcome and mark those beyond the limits.
///
/// Runs still in flight are ignored.
pub fn partition_history(
    runs: Vec<ExperimentSummary>,
    successful_limit: usize,
    failed_limit: usize,
) -> History {
    let (mut successful, mut failed): (Vec<_>, Vec<_>) = runs
        .into_iter()
        .filter(|r| r.state.is_some_and(|s| s.is_terminal()))
        .partition(|r| r.state.is_some_and(|s| s.is_success()));

    // newest first; runs without a start time sort last
    successful.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    failed.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    let mut expired = Vec::new();
    if successful.len() > successful_limit {
        expired.extend(successful.split_off(successful_limit));
    }
    if failed.len() > failed_limit {
        expired.extend(failed.split_off(failed_limit));
    }

    History {
        successful,
        failed,
        expired,
    }
}

/// List the template's runs and report those beyond the history limits
pub async fn record_history(
    fis: &dyn FisApi,
    template_id: &str,
    spec: &ExperimentSpec,
) -> Result<History, Error> {
    let runs = fis.list_experiments(template_id).await?;
    let history = partition_history(
        runs,
        spec.successful_history_limit(),
        spec.failed_history_limit(),
    );

    for run in &history.expired {
        info!(
            experiment_id = %run.id,
            state = ?run.state,
            retention_days = PROVIDER_RETENTION_DAYS,
            "experiment beyond history limit; left for provider expiry"
        );
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fis_common::crd::ExperimentState;
    use fis_provider::MockFisApi;

    fn run(id: &str, state: ExperimentState, minute: u32) -> ExperimentSummary {
        ExperimentSummary {
            id: id.to_string(),
            state: Some(state),
            start_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()),
        }
    }

    fn ids(runs: &[ExperimentSummary]) -> Vec<&str> {
        runs.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_partition_keeps_newest_within_limits() {
        let runs = vec![
            run("ok-1", ExperimentState::Completed, 1),
            run("ok-3", ExperimentState::Completed, 3),
            run("ok-2", ExperimentState::Completed, 2),
            run("bad-1", ExperimentState::Failed, 4),
            run("stop-1", ExperimentState::Stopped, 5),
            run("live", ExperimentState::Running, 6),
        ];

        let history = partition_history(runs, 2, 1);
        assert_eq!(ids(&history.successful), ["ok-3", "ok-2"]);
        assert_eq!(ids(&history.failed), ["stop-1"]);
        assert_eq!(ids(&history.expired), ["ok-1", "bad-1"]);
    }

    #[test]
    fn test_zero_limit_expires_everything_finished() {
        let runs = vec![run("ok-1", ExperimentState::Completed, 1)];
        let history = partition_history(runs, 0, 0);
        assert!(history.successful.is_empty());
        assert_eq!(ids(&history.expired), ["ok-1"]);
    }

    /// Story: bookkeeping lists runs but never deletes or stops anything
    #[tokio::test]
    async fn story_history_never_deletes() {
        let mut fis = MockFisApi::new();
        fis.expect_list_experiments().times(1).returning(|_| {
            Ok((0..5)
                .map(|i| run(&format!("ok-{}", i), ExperimentState::Completed, i))
                .collect())
        });
        fis.expect_stop_experiment().never();
        fis.expect_delete_template().never();

        let spec: ExperimentSpec = serde_json::from_value(serde_json::json!({
            "experimentTemplate": {"id": "EXT1"},
            "schedule": "* * * * *"
        }))
        .unwrap();

        let history = record_history(&fis, "EXT1", &spec).await.unwrap();
        assert_eq!(history.successful.len(), 3);
        assert_eq!(history.expired.len(), 2);
    }
}
