// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::watch;

use crate::app::errors::{AppError, AppResult};

/// Caller identity as resolved by the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub username: String,
    /// Bearer token forwarded to REST backends; never used for SSH.
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            access_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    SlurmRest,
    SlurmCli,
    OpenPbs,
}

impl SchedulerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerKind::SlurmRest => "slurm-rest",
            SchedulerKind::SlurmCli => "slurm-cli",
            SchedulerKind::OpenPbs => "openpbs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTimeouts {
    pub connection: Duration,
    pub login: Duration,
    pub command_execution: Duration,
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for SshTimeouts {
    fn default() -> Self {
        Self {
            connection: Duration::from_secs(5),
            login: Duration::from_secs(5),
            command_execution: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            keep_alive: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    /// Login nodes, tried in order.
    pub hosts: Vec<String>,
    pub port: u16,
    pub max_clients: usize,
    pub timeouts: SshTimeouts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub kind: SchedulerKind,
    pub version: Option<String>,
    pub api_url: Option<String>,
    pub api_version: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbingSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Service account the monitor connects as.
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemSettings {
    pub path: String,
    pub data_type: String,
    pub default_work_dir: bool,
}

/// Immutable description of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub name: String,
    pub ssh: SshSettings,
    pub scheduler: SchedulerSettings,
    pub probing: ProbingSettings,
    pub file_systems: Vec<FileSystemSettings>,
    /// Offset applied to scheduler timestamps that carry none.
    pub timezone: UtcOffset,
}

impl ClusterConfig {
    pub fn key(&self) -> String {
        cluster_key(&self.name)
    }

    pub fn default_work_dir(&self) -> Option<&str> {
        self.file_systems
            .iter()
            .find(|fs| fs.default_work_dir)
            .map(|fs| fs.path.as_str())
    }
}

pub fn cluster_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Cancellation side held by the caller of an execution.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelSignal>,
    /// Running the command twice is not harmless (submissions, removals).
    pub side_effects: bool,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Signal name when the process was killed by a signal.
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Turns a non-zero exit into `CommandFailed`, keeping status and stderr.
    pub fn into_success(self) -> AppResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppError::command_failed(self.exit_code, self.stderr))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Unknown,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical job record. A fresh value is produced on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub job_id: String,
    pub state: JobState,
    pub raw_state: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub submit_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
    pub owner: String,
    pub partition: String,
    pub name: String,
}

impl Job {
    /// Placeholder for a record the backend returned but that could not be read.
    pub fn unknown(job_id: impl Into<String>, raw_state: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Unknown,
            raw_state: raw_state.into(),
            submit_time: None,
            start_time: None,
            end_time: None,
            exit_code: None,
            owner: String::new(),
            partition: String::new(),
            name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    pub script: String,
    pub working_dir: Option<String>,
    pub name: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Extra scheduler directives passed through verbatim.
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub job_ids: Vec<String>,
    pub allusers: bool,
    pub include_hidden: bool,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            job_ids: Vec::new(),
            allusers: false,
            include_hidden: true,
        }
    }
}

impl JobFilter {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_ids: vec![job_id.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: OffsetDateTime,
    pub until: Option<OffsetDateTime>,
}

impl TimeWindow {
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        instant >= self.since && self.until.is_none_or(|until| instant <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterHealth {
    pub cluster: String,
    pub status: HealthStatus,
    pub reachable: bool,
    pub scheduler_ok: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_checked: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn job_serializes_to_canonical_shape() {
        let job = Job {
            job_id: "12345".into(),
            state: JobState::Completed,
            raw_state: "COMPLETED".into(),
            submit_time: Some(datetime!(2024-03-01 10:00:00 UTC)),
            start_time: Some(datetime!(2024-03-01 10:00:05 UTC)),
            end_time: None,
            exit_code: None,
            owner: "alice".into(),
            partition: "normal".into(),
            name: "train".into(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["job_id"], "12345");
        assert_eq!(value["state"], "COMPLETED");
        assert_eq!(value["submit_time"], "2024-03-01T10:00:00Z");
        assert!(value["end_time"].is_null());
        assert!(value["exit_code"].is_null());
        assert_eq!(value.as_object().unwrap().len(), 10);
    }

    #[test]
    fn health_omits_empty_detail() {
        let health = ClusterHealth {
            cluster: "alps".into(),
            status: HealthStatus::Skip,
            reachable: false,
            scheduler_ok: false,
            last_checked: datetime!(2024-03-01 10:00:00 UTC),
            latency_ms: None,
            detail: None,
        };
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["status"], "skip");
        assert!(value.get("detail").is_none());
    }

    #[tokio::test]
    async fn cancel_signal_resolves_after_cancel() {
        let (handle, mut signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[test]
    fn cluster_key_is_case_insensitive() {
        assert_eq!(cluster_key("GPU-Cluster "), "gpu-cluster");
    }
}
