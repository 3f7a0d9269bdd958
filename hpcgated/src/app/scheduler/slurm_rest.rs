// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! slurmrestd client. Payload shapes changed across API versions
//! (plain integers became `{set, infinite, number}` objects, `job_state`
//! became an array), so the wire types accept every form seen so far.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use time::{OffsetDateTime, UtcOffset};

use super::slurm_cli::map_slurm_state;
use super::timestamps::{from_epoch_secs, parse_timestamp};
use super::{
    AdapterContext, SchedulerAdapter, job_not_found, parse_error, resolve_window, retain_window,
    validate_job_id,
};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{RestRequest, RestResponse, SlurmRestTransport};
use crate::app::services::shell::is_env_name;
use crate::app::types::{Job, JobFilter, JobSpec, SchedulerKind, TimeWindow};

const FALLBACK_ENVIRONMENT: &str = "PATH=/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestNumber {
    Plain(i64),
    Wrapped {
        #[serde(default = "yes")]
        set: bool,
        #[serde(default)]
        infinite: bool,
        number: i64,
    },
}

fn yes() -> bool {
    true
}

impl RestNumber {
    fn value(&self) -> Option<i64> {
        match self {
            RestNumber::Plain(n) => Some(*n),
            RestNumber::Wrapped {
                set: true,
                infinite: false,
                number,
            } => Some(*number),
            RestNumber::Wrapped { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestTime {
    Number(RestNumber),
    Text(String),
}

impl RestTime {
    fn resolve(&self, tz: UtcOffset) -> AppResult<Option<OffsetDateTime>> {
        match self {
            RestTime::Number(number) => Ok(number.value().and_then(from_epoch_secs)),
            RestTime::Text(text) => parse_timestamp(text, tz),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestState {
    One(String),
    Many(Vec<String>),
}

impl RestState {
    fn primary(&self) -> &str {
        match self {
            RestState::One(state) => state,
            RestState::Many(states) => states.first().map(String::as_str).unwrap_or(""),
        }
    }

    fn raw(&self) -> String {
        match self {
            RestState::One(state) => state.clone(),
            RestState::Many(states) => states.join(","),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestExitCode {
    Number(RestNumber),
    /// `{status: [...], return_code: {...}}`; the status list is ignored.
    Detailed { return_code: Option<RestNumber> },
}

impl RestExitCode {
    fn value(&self) -> Option<i32> {
        let number = match self {
            RestExitCode::Number(number) => number.value(),
            RestExitCode::Detailed { return_code, .. } => {
                return_code.as_ref().and_then(RestNumber::value)
            }
        };
        number.and_then(|n| i32::try_from(n).ok())
    }
}

#[derive(Debug, Deserialize)]
struct RestJob {
    job_id: RestNumber,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    partition: String,
    #[serde(default)]
    name: String,
    job_state: Option<RestState>,
    exit_code: Option<RestExitCode>,
    submit_time: Option<RestTime>,
    start_time: Option<RestTime>,
    end_time: Option<RestTime>,
}

impl RestJob {
    fn into_job(self, tz: UtcOffset) -> AppResult<Job> {
        let job_id = self
            .job_id
            .value()
            .ok_or_else(|| parse_error("job record without job_id"))?;
        let (state, raw_state) = match &self.job_state {
            Some(state) => (map_slurm_state(state.primary()), state.raw()),
            None => (map_slurm_state(""), String::new()),
        };
        let resolve = |time: &Option<RestTime>| match time {
            Some(time) => time.resolve(tz),
            None => Ok(None),
        };
        Ok(Job {
            job_id: job_id.to_string(),
            state,
            raw_state,
            submit_time: resolve(&self.submit_time)?,
            start_time: resolve(&self.start_time)?,
            end_time: resolve(&self.end_time)?,
            exit_code: self.exit_code.as_ref().and_then(RestExitCode::value),
            owner: self.user_name,
            partition: self.partition,
            name: self.name,
        })
    }
}

/// Reads `jobs` from a response body. Records that do not fit the wire types
/// become UNKNOWN placeholders.
fn jobs_from_body(body: &Value, tz: UtcOffset) -> AppResult<Vec<Job>> {
    let records = body
        .get("jobs")
        .and_then(Value::as_array)
        .ok_or_else(|| parse_error("response has no jobs array"))?;
    Ok(records
        .iter()
        .map(|record| {
            serde_json::from_value::<RestJob>(record.clone())
                .map_err(|err| parse_error(err.to_string()))
                .and_then(|job| job.into_job(tz))
                .unwrap_or_else(|err| {
                    tracing::warn!("unreadable slurmrestd job record: {err}");
                    let mut job = Job::unknown(
                        scalar_text(record.get("job_id")),
                        scalar_text(record.get("job_state")),
                    );
                    job.owner = scalar_text(record.get("user_name"));
                    job
                })
        })
        .collect())
}

fn scalar_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(map)) => scalar_text(map.get("number")),
        _ => String::new(),
    }
}

/// Text of the `errors` array slurmrestd attaches to failed calls.
fn error_text(body: &Value) -> String {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|err| {
                    err.get("description")
                        .and_then(Value::as_str)
                        .filter(|text| !text.is_empty())
                        .or_else(|| err.get("error").and_then(Value::as_str))
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default()
}

fn is_invalid_job(response: &RestResponse) -> bool {
    response.status == 404 || error_text(&response.body).to_ascii_lowercase().contains("invalid job id")
}

fn check_status(response: RestResponse, what: &str) -> AppResult<RestResponse> {
    if (200..300).contains(&response.status) {
        return Ok(response);
    }
    let detail = error_text(&response.body);
    let message = format!("slurmrestd {what} returned {}: {detail}", response.status);
    let err = match response.status {
        401 | 403 => AppError::with_message(
            AppErrorKind::AuthenticationFailed,
            codes::AUTHENTICATION_FAILED,
            message,
        ),
        502..=504 => {
            AppError::with_message(AppErrorKind::ConnectFailed, codes::NETWORK_ERROR, message)
        }
        _ => AppError::with_message(AppErrorKind::CommandFailed, codes::REMOTE_ERROR, message),
    };
    Err(err)
}

/// `v0.0.41` -> (0, 0, 41)
fn api_version_tuple(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

/// Places directive tokens as `#SBATCH` lines right after the shebang.
fn script_with_directives(script: &str, directives: &[String]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for token in directives {
        match lines.last_mut() {
            Some(line) if !token.starts_with('-') => {
                line.push(' ');
                line.push_str(token);
            }
            _ => lines.push(format!("#SBATCH {token}")),
        }
    }
    if lines.is_empty() {
        return script.to_string();
    }
    let block = lines.join("\n");
    match script.split_once('\n') {
        Some((first, rest)) if first.starts_with("#!") => format!("{first}\n{block}\n{rest}"),
        _ if script.starts_with("#!") => format!("{script}\n{block}\n"),
        _ => format!("{block}\n{script}"),
    }
}

/// Slurm through slurmrestd, authenticated with the caller's token.
pub struct SlurmRestAdapter {
    ctx: AdapterContext,
    transport: Arc<dyn SlurmRestTransport>,
}

impl SlurmRestAdapter {
    pub fn new(ctx: AdapterContext, transport: Arc<dyn SlurmRestTransport>) -> Self {
        Self { ctx, transport }
    }

    fn path(&self, suffix: &str) -> String {
        format!("/slurm/{}/{suffix}", self.ctx.cluster.scheduler.api_version)
    }

    fn tz(&self) -> UtcOffset {
        self.ctx.cluster.timezone
    }

    async fn send(&self, request: RestRequest) -> AppResult<RestResponse> {
        self.transport
            .send(&self.ctx.cluster, &self.ctx.identity, request)
            .await
    }

    async fn all_jobs(&self, filter: &JobFilter, since: Option<OffsetDateTime>) -> AppResult<Vec<Job>> {
        let mut request = RestRequest::get(self.path("jobs"));
        if filter.include_hidden {
            request = request.with_query("flags", "SHOW_ALL");
        }
        if let Some(since) = since {
            request = request.with_query("update_time", since.unix_timestamp().to_string());
        }
        let response = check_status(self.send(request).await?, "jobs")?;
        let mut jobs = jobs_from_body(&response.body, self.tz())?;
        if !filter.allusers {
            let user = &self.ctx.identity.username;
            jobs.retain(|job| &job.owner == user);
        }
        Ok(jobs)
    }

    fn submit_body(&self, spec: &JobSpec) -> AppResult<Value> {
        let mut environment = Vec::with_capacity(spec.env.len());
        for (name, value) in &spec.env {
            if !is_env_name(name) {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    format!("invalid environment variable name '{name}'"),
                ));
            }
            environment.push(format!("{name}={value}"));
        }
        if environment.is_empty() {
            environment.push(FALLBACK_ENVIRONMENT.to_string());
        }

        let script = script_with_directives(&spec.script, &spec.directives);
        let mut job = json!({ "environment": environment });
        if let Some(name) = &spec.name {
            job["name"] = json!(name);
        }
        let workdir = spec
            .working_dir
            .as_deref()
            .or_else(|| self.ctx.cluster.default_work_dir());
        if let Some(dir) = workdir {
            job["current_working_directory"] = json!(dir);
        }

        let nested = api_version_tuple(&self.ctx.cluster.scheduler.api_version)
            .is_some_and(|version| version >= (0, 0, 41));
        if nested {
            job["script"] = json!(script);
            Ok(json!({ "job": job }))
        } else {
            Ok(json!({ "script": script, "job": job }))
        }
    }
}

#[async_trait]
impl SchedulerAdapter for SlurmRestAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::SlurmRest
    }

    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, spec),
        fields(op = "submit", kind = "slurm-rest", cluster = %self.ctx.cluster.name)
    )]
    async fn submit(&self, spec: &JobSpec) -> AppResult<String> {
        if spec.script.trim().is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "job script is empty",
            ));
        }
        let body = self.submit_body(spec)?;
        let response = self
            .send(RestRequest::post(self.path("job/submit"), body))
            .await?;
        let response = check_status(response, "submit")?;
        let job_id = response
            .body
            .get("job_id")
            .map(|id| scalar_text(Some(id)))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                parse_error(format!("submit response without job_id: {}", error_text(&response.body)))
            })?;
        tracing::info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    async fn status(&self, filter: &JobFilter) -> AppResult<Vec<Job>> {
        if filter.job_ids.is_empty() {
            return self.all_jobs(filter, None).await;
        }
        let mut jobs = Vec::new();
        for id in &filter.job_ids {
            let id = validate_job_id(id)?;
            let response = self.send(RestRequest::get(self.path(&format!("job/{id}")))).await?;
            if is_invalid_job(&response) {
                continue;
            }
            let response = check_status(response, "job")?;
            jobs.extend(jobs_from_body(&response.body, self.tz())?);
        }
        Ok(jobs)
    }

    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self),
        fields(op = "cancel", kind = "slurm-rest", cluster = %self.ctx.cluster.name)
    )]
    async fn cancel(&self, job_id: &str) -> AppResult<()> {
        let job_id = validate_job_id(job_id)?;
        let response = self
            .send(RestRequest::delete(self.path(&format!("job/{job_id}"))))
            .await?;
        if is_invalid_job(&response) {
            return Err(job_not_found(job_id));
        }
        check_status(response, "cancel")?;
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, window: Option<TimeWindow>) -> AppResult<Vec<Job>> {
        let window = resolve_window(window, self.ctx.clock.now_utc());
        let mut jobs = self.all_jobs(filter, Some(window.since)).await?;
        if !filter.job_ids.is_empty() {
            jobs.retain(|job| filter.job_ids.iter().any(|id| id == &job.job_id));
        }
        retain_window(&mut jobs, &window);
        Ok(jobs)
    }

    async fn ping(&self) -> AppResult<()> {
        let response = check_status(self.send(RestRequest::get(self.path("ping"))).await?, "ping")?;
        let pings = response
            .body
            .get("pings")
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error("ping response has no pings array"))?;
        let up = pings.iter().any(|ping| {
            ping.get("responding").and_then(Value::as_bool) == Some(true)
                || ping.get("pinged").and_then(Value::as_str) == Some("UP")
        });
        if up {
            Ok(())
        } else {
            Err(AppError::with_message(
                AppErrorKind::CommandFailed,
                codes::REMOTE_ERROR,
                "slurmctld not responding",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::RestMethod;
    use crate::app::test_support::{FixedClock, ScriptedRunner, cluster};
    use crate::app::types::{ClusterConfig, Identity, JobState};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use time::macros::datetime;

    #[derive(Default)]
    struct FakeTransport {
        replies: Mutex<VecDeque<RestResponse>>,
        seen: Mutex<Vec<RestRequest>>,
    }

    impl FakeTransport {
        fn reply(self, status: u16, body: Value) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(RestResponse { status, body });
            self
        }

        fn seen(&self) -> Vec<RestRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SlurmRestTransport for FakeTransport {
        async fn send(
            &self,
            _cluster: &ClusterConfig,
            identity: &Identity,
            request: RestRequest,
        ) -> AppResult<RestResponse> {
            assert_eq!(identity.access_token.as_deref(), Some("tok"));
            self.seen.lock().unwrap().push(request);
            Ok(self.replies.lock().unwrap().pop_front().expect("no reply queued"))
        }
    }

    fn adapter(transport: Arc<FakeTransport>, api_version: &str) -> SlurmRestAdapter {
        let mut config = cluster("daint");
        config.scheduler.kind = SchedulerKind::SlurmRest;
        config.scheduler.api_version = api_version.to_string();
        SlurmRestAdapter::new(
            AdapterContext {
                cluster: Arc::new(config),
                identity: Identity::new("alice").with_token("tok"),
                runner: Arc::new(ScriptedRunner::new()),
                clock: Arc::new(FixedClock::new(datetime!(2024-03-10 12:00:00 UTC))),
            },
            transport,
        )
    }

    fn wrapped(number: i64) -> Value {
        json!({ "set": true, "infinite": false, "number": number })
    }

    fn unset() -> Value {
        json!({ "set": false, "infinite": false, "number": 0 })
    }

    #[tokio::test]
    async fn submit_then_poll_modern_payloads() {
        let transport = Arc::new(
            FakeTransport::default()
                .reply(200, json!({ "job_id": 12345, "errors": [] }))
                .reply(200, json!({ "jobs": [{
                    "job_id": 12345, "user_name": "alice", "partition": "normal", "name": "train",
                    "job_state": ["PENDING"],
                    "exit_code": { "status": ["PENDING"], "return_code": unset() },
                    "submit_time": wrapped(1_710_064_800), "start_time": wrapped(0), "end_time": wrapped(0)
                }]}))
                .reply(200, json!({ "jobs": [{
                    "job_id": 12345, "user_name": "alice", "partition": "normal", "name": "train",
                    "job_state": ["COMPLETED"],
                    "exit_code": { "status": ["SUCCESS"], "return_code": wrapped(0) },
                    "submit_time": wrapped(1_710_064_800),
                    "start_time": wrapped(1_710_064_860),
                    "end_time": wrapped(1_710_065_100)
                }]})),
        );
        let slurm = adapter(transport.clone(), "v0.0.40");
        let spec = JobSpec {
            script: "#!/bin/bash\nsrun hostname\n".into(),
            name: Some("train".into()),
            directives: vec!["--time".into(), "10".into(), "--partition=normal".into()],
            ..Default::default()
        };

        assert_eq!(slurm.submit(&spec).await.unwrap(), "12345");
        let pending = slurm.job("12345").await.unwrap();
        assert_eq!(pending.state, JobState::Pending);
        assert_eq!(pending.exit_code, None);
        assert_eq!(pending.start_time, None);
        assert_eq!(pending.submit_time, Some(datetime!(2024-03-10 10:00:00 UTC)));

        let done = slurm.job("12345").await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.end_time, Some(datetime!(2024-03-10 10:05:00 UTC)));

        let seen = transport.seen();
        assert_eq!(seen[0].method, RestMethod::Post);
        assert_eq!(seen[0].path, "/slurm/v0.0.40/job/submit");
        let body = seen[0].body.as_ref().unwrap();
        assert_eq!(
            body["script"],
            "#!/bin/bash\n#SBATCH --time 10\n#SBATCH --partition=normal\nsrun hostname\n"
        );
        assert_eq!(body["job"]["name"], "train");
        assert_eq!(body["job"]["environment"][0], FALLBACK_ENVIRONMENT);
        assert_eq!(seen[1].path, "/slurm/v0.0.40/job/12345");
    }

    #[tokio::test]
    async fn newer_api_nests_script_in_job() {
        let transport =
            Arc::new(FakeTransport::default().reply(200, json!({ "job_id": 7 })));
        let slurm = adapter(transport.clone(), "v0.0.42");
        let mut spec = JobSpec {
            script: "#!/bin/sh\ntrue\n".into(),
            working_dir: Some("/scratch/alice".into()),
            ..Default::default()
        };
        spec.env.insert("A".into(), "1".into());
        slurm.submit(&spec).await.unwrap();
        let body = transport.seen()[0].body.clone().unwrap();
        assert!(body.get("script").is_none());
        assert_eq!(body["job"]["script"], "#!/bin/sh\ntrue\n");
        assert_eq!(body["job"]["environment"], json!(["A=1"]));
        assert_eq!(body["job"]["current_working_directory"], "/scratch/alice");
    }

    #[tokio::test]
    async fn legacy_payloads_are_understood() {
        let transport = Arc::new(FakeTransport::default().reply(200, json!({ "jobs": [{
            "job_id": 9, "user_name": "alice", "partition": "debug", "name": "x",
            "job_state": "FAILED", "exit_code": 2,
            "submit_time": 1_710_064_800, "start_time": 1_710_064_801, "end_time": 1_710_064_802
        }]})));
        let job = adapter(transport, "v0.0.38").job("9").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.exit_code, Some(2));
        assert_eq!(job.raw_state, "FAILED");
    }

    #[tokio::test]
    async fn missing_exit_status_is_absent() {
        let transport = Arc::new(FakeTransport::default().reply(200, json!({ "jobs": [{
            "job_id": 10, "user_name": "alice", "job_state": ["RUNNING"]
        }]})));
        let job = adapter(transport, "v0.0.40").job("10").await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.exit_code, None);
        assert_eq!(job.submit_time, None);
    }

    #[tokio::test]
    async fn list_shows_hidden_partitions_and_filters_window_and_owner() {
        let transport = Arc::new(FakeTransport::default().reply(200, json!({ "jobs": [
            { "job_id": 1, "user_name": "alice", "job_state": ["COMPLETED"], "submit_time": wrapped(1_709_294_400) },
            { "job_id": 2, "user_name": "alice", "job_state": ["RUNNING"], "submit_time": wrapped(1_709_985_600) },
            { "job_id": 3, "user_name": "bob", "job_state": ["RUNNING"], "submit_time": wrapped(1_709_985_600) },
            { "job_id": 4, "user_name": "alice", "job_state": { "unexpected": true } },
            { "job_id": 5, "user_name": "bob", "job_state": { "unexpected": true } },
            { "job_id": 6, "job_state": { "unexpected": true } }
        ]})));
        let jobs = adapter(transport.clone(), "v0.0.40")
            .list(&JobFilter::default(), None)
            .await
            .unwrap();
        let ids: Vec<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
        assert_eq!(ids, ["2", "4"]);
        assert_eq!(jobs[1].state, JobState::Unknown);

        let request = &transport.seen()[0];
        assert!(request.query.contains(&("flags".into(), "SHOW_ALL".into())));
        assert!(
            request
                .query
                .contains(&("update_time".into(), "1709467200".into()))
        );
    }

    #[tokio::test]
    async fn unreadable_records_keep_their_owner() {
        let body = json!({ "jobs": [
            { "job_id": 2, "user_name": "alice", "job_state": ["RUNNING"] },
            { "job_id": 3, "user_name": "bob", "job_state": { "unexpected": true } }
        ]});
        let transport = Arc::new(
            FakeTransport::default()
                .reply(200, body.clone())
                .reply(200, body),
        );
        let slurm = adapter(transport, "v0.0.40");

        let own = slurm.status(&JobFilter::default()).await.unwrap();
        let ids: Vec<&str> = own.iter().map(|job| job.job_id.as_str()).collect();
        assert_eq!(ids, ["2"]);

        let everyone = slurm
            .status(&JobFilter {
                allusers: true,
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(everyone.len(), 2);
        assert_eq!(everyone[1].state, JobState::Unknown);
        assert_eq!(everyone[1].owner, "bob");
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let transport = Arc::new(
            FakeTransport::default()
                .reply(
                    500,
                    json!({ "errors": [{ "error": "Invalid job id specified", "error_number": 2017 }] }),
                )
                .reply(404, json!({})),
        );
        let slurm = adapter(transport, "v0.0.40");
        assert_eq!(
            slurm.job("404").await.unwrap_err().kind(),
            AppErrorKind::NotFound
        );
        assert_eq!(
            slurm.cancel("404").await.unwrap_err().kind(),
            AppErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn rejected_tokens_are_authentication_failures() {
        let transport = Arc::new(FakeTransport::default().reply(401, json!({})));
        let err = adapter(transport, "v0.0.40").ping().await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn ping_accepts_old_and_new_shapes() {
        let transport = Arc::new(
            FakeTransport::default()
                .reply(200, json!({ "pings": [{ "hostname": "ctl", "pinged": "UP" }] }))
                .reply(200, json!({ "pings": [{ "hostname": "ctl", "responding": true }] }))
                .reply(200, json!({ "pings": [{ "hostname": "ctl", "responding": false }] })),
        );
        let slurm = adapter(transport, "v0.0.40");
        assert!(slurm.ping().await.is_ok());
        assert!(slurm.ping().await.is_ok());
        assert!(slurm.ping().await.is_err());
    }

    #[test]
    fn directives_without_shebang_go_first() {
        let script = script_with_directives("echo hi\n", &["-N".into(), "2".into()]);
        assert_eq!(script, "#SBATCH -N 2\necho hi\n");
        assert_eq!(script_with_directives("echo hi\n", &[]), "echo hi\n");
    }
}
