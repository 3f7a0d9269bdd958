// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, SlurmRestTransport};
use crate::app::runner::CommandRunner;
use crate::app::types::{
    ClusterConfig, Identity, Job, JobFilter, JobSpec, SchedulerKind, TimeWindow,
};

pub mod pbs;
pub mod slurm_cli;
pub mod slurm_rest;
pub mod timestamps;

pub use pbs::OpenPbsAdapter;
pub use slurm_cli::SlurmCliAdapter;
pub use slurm_rest::SlurmRestAdapter;

/// Lookback applied by `list` when the caller gives no window.
pub const DEFAULT_LIST_WINDOW: TimeDuration = TimeDuration::days(7);

#[async_trait]
/// One batch scheduler behind the canonical job model.
/// Adapters report only states the backend returns; anything they cannot
/// map becomes `UNKNOWN`.
pub trait SchedulerAdapter: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    async fn submit(&self, spec: &JobSpec) -> AppResult<String>;

    async fn status(&self, filter: &JobFilter) -> AppResult<Vec<Job>>;

    async fn cancel(&self, job_id: &str) -> AppResult<()>;

    async fn list(&self, filter: &JobFilter, window: Option<TimeWindow>) -> AppResult<Vec<Job>>;

    /// Cheap responsiveness check used by the health monitor.
    async fn ping(&self) -> AppResult<()>;

    async fn job(&self, job_id: &str) -> AppResult<Job> {
        self.status(&JobFilter::for_job(job_id))
            .await?
            .into_iter()
            .find(|job| job.job_id == job_id)
            .ok_or_else(|| job_not_found(job_id))
    }
}

/// Caller window, or the last seven days ending now.
pub fn resolve_window(window: Option<TimeWindow>, now: OffsetDateTime) -> TimeWindow {
    window.unwrap_or(TimeWindow {
        since: now - DEFAULT_LIST_WINDOW,
        until: None,
    })
}

/// Drops records submitted outside the window. Records without a submit time
/// are kept.
pub fn retain_window(jobs: &mut Vec<Job>, window: &TimeWindow) {
    jobs.retain(|job| job.submit_time.is_none_or(|submitted| window.contains(submitted)));
}

/// Job ids are passed to remote shells, so only a conservative alphabet is
/// accepted: digits, letters, `_`, `.`, `-`, `[` and `]` (array ids).
pub fn validate_job_id(job_id: &str) -> AppResult<&str> {
    let trimmed = job_id.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= 128
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '[' | ']'))
        && !trimmed.starts_with('-');
    if valid {
        Ok(trimmed)
    } else {
        Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("invalid job id '{job_id}'"),
        ))
    }
}

pub fn job_not_found(job_id: &str) -> AppError {
    AppError::with_message(
        AppErrorKind::NotFound,
        codes::NOT_FOUND,
        format!("job '{job_id}' not found"),
    )
}

pub(crate) fn parse_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::ParseFailed, codes::PARSE_FAILED, message)
}

/// Everything an adapter needs to serve one (cluster, identity) pair.
#[derive(Clone)]
pub struct AdapterContext {
    pub cluster: Arc<ClusterConfig>,
    pub identity: Identity,
    pub runner: Arc<dyn CommandRunner>,
    pub clock: Arc<dyn ClockPort>,
}

/// Picks the adapter for the cluster's configured scheduler.
pub fn build_adapter(
    ctx: AdapterContext,
    rest: Option<Arc<dyn SlurmRestTransport>>,
) -> AppResult<Arc<dyn SchedulerAdapter>> {
    match ctx.cluster.scheduler.kind {
        SchedulerKind::SlurmCli => Ok(Arc::new(SlurmCliAdapter::new(ctx))),
        SchedulerKind::OpenPbs => Ok(Arc::new(OpenPbsAdapter::new(ctx))),
        SchedulerKind::SlurmRest => {
            let transport = rest.ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    "slurm REST transport is not configured",
                )
                .with_context(format!("cluster={}", ctx.cluster.name))
            })?;
            Ok(Arc::new(SlurmRestAdapter::new(ctx, transport)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::JobState;
    use time::macros::datetime;

    fn job(id: &str, submitted: Option<OffsetDateTime>) -> Job {
        Job {
            submit_time: submitted,
            ..Job::unknown(id, "PENDING")
        }
    }

    #[test]
    fn default_window_is_seven_days() {
        let now = datetime!(2024-03-10 12:00:00 UTC);
        let window = resolve_window(None, now);
        assert_eq!(window.since, datetime!(2024-03-03 12:00:00 UTC));
        assert_eq!(window.until, None);
    }

    #[test]
    fn retain_window_drops_old_records_only() {
        let window = resolve_window(None, datetime!(2024-03-10 12:00:00 UTC));
        let mut jobs = vec![
            job("old", Some(datetime!(2024-03-02 12:00:00 UTC))),
            job("recent", Some(datetime!(2024-03-09 12:00:00 UTC))),
            job("undated", None),
        ];
        retain_window(&mut jobs, &window);
        let ids: Vec<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
        assert_eq!(ids, ["recent", "undated"]);
        assert!(jobs.iter().all(|job| job.state == JobState::Unknown));
    }

    #[test]
    fn job_ids_are_validated() {
        assert_eq!(validate_job_id(" 12345 ").unwrap(), "12345");
        assert!(validate_job_id("123.pbs01").is_ok());
        assert!(validate_job_id("77[1]").is_ok());
        assert!(validate_job_id("1; rm -rf /").is_err());
        assert!(validate_job_id("-1").is_err());
        assert!(validate_job_id("").is_err());
    }
}
