// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::timestamps::parse_timestamp;
use super::{
    AdapterContext, SchedulerAdapter, job_not_found, parse_error, resolve_window, retain_window,
    validate_job_id,
};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::shell::{is_env_name, sh_escape, sh_join};
use crate::app::types::{
    ExecutionRequest, Job, JobFilter, JobSpec, JobState, SchedulerKind, TimeWindow,
};

/// Makes sacct/squeue print ISO timestamps with their offset.
const TIME_FORMAT_ENV: &str = "SLURM_TIME_FORMAT='%Y-%m-%dT%H:%M:%S%z'";
/// JobName goes last: it is the only field that may contain the delimiter.
const SACCT_FIELDS: &str = "JobIDRaw,User,Partition,State,ExitCode,Submit,Start,End,JobName";
const SQUEUE_FORMAT: &str = "%i|%u|%P|%T|%V|%S|%j";

/// Slurm through its command-line tools over SSH.
pub struct SlurmCliAdapter {
    ctx: AdapterContext,
}

impl SlurmCliAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    fn tz(&self) -> UtcOffset {
        self.ctx.cluster.timezone
    }

    async fn sacct(&self, selection: &str, allusers: bool) -> AppResult<Vec<Job>> {
        let users = if allusers { " --allusers" } else { "" };
        let command = format!(
            "{TIME_FORMAT_ENV} sacct -X --noheader --parsable2 --format={SACCT_FIELDS}{users} {selection}"
        );
        let result = self
            .ctx
            .runner
            .run(ExecutionRequest::new(command))
            .await?
            .into_success()?;
        Ok(parse_records(&result.stdout, |line| {
            parse_sacct_line(line, self.tz())
        }))
    }

    async fn squeue(&self, filter: &JobFilter, job_ids: &[&str]) -> AppResult<Vec<Job>> {
        let mut command = format!("{TIME_FORMAT_ENV} squeue --noheader --format='{SQUEUE_FORMAT}'");
        if filter.include_hidden {
            command.push_str(" --all");
        }
        if !job_ids.is_empty() {
            command.push_str(&format!(" --jobs={}", job_ids.join(",")));
        } else if !filter.allusers {
            command.push_str(&format!(
                " --user={}",
                sh_escape(&self.ctx.identity.username)
            ));
        }
        let result = self.ctx.runner.run(ExecutionRequest::new(command)).await?;
        if !result.success() && is_invalid_job_id(&result.stderr) {
            return Ok(Vec::new());
        }
        let result = result.into_success()?;
        Ok(parse_records(&result.stdout, |line| {
            parse_squeue_line(line, self.tz())
        }))
    }

    fn window_selection(&self, window: &TimeWindow, filter: &JobFilter) -> AppResult<String> {
        let mut selection = format!("--starttime={}", self.slurm_time(window.since)?);
        if let Some(until) = window.until {
            selection.push_str(&format!(" --endtime={}", self.slurm_time(until)?));
        }
        if !filter.allusers {
            selection.push_str(&format!(
                " --user={}",
                sh_escape(&self.ctx.identity.username)
            ));
        }
        if !filter.job_ids.is_empty() {
            selection.push_str(&format!(" --jobs={}", valid_ids(&filter.job_ids)?.join(",")));
        }
        Ok(selection)
    }

    fn slurm_time(&self, instant: OffsetDateTime) -> AppResult<String> {
        let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
        instant.to_offset(self.tz()).format(format).map_err(|err| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("cannot format time window: {err}"),
            )
        })
    }
}

#[async_trait]
impl SchedulerAdapter for SlurmCliAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::SlurmCli
    }

    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, spec),
        fields(op = "submit", kind = "slurm-cli", cluster = %self.ctx.cluster.name)
    )]
    async fn submit(&self, spec: &JobSpec) -> AppResult<String> {
        if spec.script.trim().is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "job script is empty",
            ));
        }
        let mut args = vec!["sbatch".to_string(), "--parsable".to_string()];
        if let Some(name) = &spec.name {
            args.push(format!("--job-name={name}"));
        }
        let workdir = spec
            .working_dir
            .as_deref()
            .or_else(|| self.ctx.cluster.default_work_dir());
        if let Some(dir) = workdir {
            args.push(format!("--chdir={dir}"));
        }
        args.extend(spec.directives.iter().cloned());

        let command = format!(
            "printf '%s' {} | {}{}",
            sh_escape(&spec.script),
            env_prefix(spec)?,
            sh_join(&args)
        );
        let mut request = ExecutionRequest::new(command).with_side_effects();
        if let Some(dir) = workdir {
            request = request.in_dir(dir);
        }
        let result = self.ctx.runner.run(request).await?.into_success()?;
        let job_id = parse_sbatch_output(&result.stdout)?;
        tracing::info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    async fn status(&self, filter: &JobFilter) -> AppResult<Vec<Job>> {
        if filter.job_ids.is_empty() {
            return self.squeue(filter, &[]).await;
        }
        let ids = valid_ids(&filter.job_ids)?;
        let selection = format!("--jobs={}", ids.join(","));
        let mut jobs = match self.sacct(&selection, filter.allusers).await {
            Ok(jobs) => jobs,
            Err(err) if err.kind() == AppErrorKind::CommandFailed => {
                tracing::debug!("sacct unavailable, falling back to squeue: {err}");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        let missing: Vec<&str> = ids
            .iter()
            .copied()
            .filter(|id| !jobs.iter().any(|job| job.job_id == *id))
            .collect();
        if !missing.is_empty() {
            jobs.extend(self.squeue(filter, &missing).await?);
        }
        Ok(jobs)
    }

    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self),
        fields(op = "cancel", kind = "slurm-cli", cluster = %self.ctx.cluster.name)
    )]
    async fn cancel(&self, job_id: &str) -> AppResult<()> {
        let job_id = validate_job_id(job_id)?;
        let result = self
            .ctx
            .runner
            .run(ExecutionRequest::new(format!("scancel {job_id}")))
            .await?;
        if is_invalid_job_id(&result.stderr) {
            return Err(job_not_found(job_id));
        }
        result.into_success()?;
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, window: Option<TimeWindow>) -> AppResult<Vec<Job>> {
        let window = resolve_window(window, self.ctx.clock.now_utc());
        let selection = self.window_selection(&window, filter)?;
        let mut jobs = self.sacct(&selection, filter.allusers).await?;
        retain_window(&mut jobs, &window);
        Ok(jobs)
    }

    async fn ping(&self) -> AppResult<()> {
        let result = self
            .ctx
            .runner
            .run(ExecutionRequest::new("scontrol ping"))
            .await?
            .into_success()?;
        if result.stdout.contains("UP") {
            Ok(())
        } else {
            Err(AppError::with_message(
                AppErrorKind::CommandFailed,
                codes::REMOTE_ERROR,
                format!("slurmctld not responding: {}", result.stdout.trim()),
            ))
        }
    }
}

fn valid_ids(ids: &[String]) -> AppResult<Vec<&str>> {
    ids.iter().map(|id| validate_job_id(id)).collect()
}

fn env_prefix(spec: &JobSpec) -> AppResult<String> {
    if spec.env.is_empty() {
        return Ok(String::new());
    }
    let mut out = String::from("env ");
    for (name, value) in &spec.env {
        if !is_env_name(name) {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("invalid environment variable name '{name}'"),
            ));
        }
        out.push_str(&format!("{name}={} ", sh_escape(value)));
    }
    Ok(out)
}

pub(crate) fn is_invalid_job_id(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("invalid job id")
}

/// Accepts `--parsable` output (`12345` or `12345;cluster`) and the classic
/// `Submitted batch job 12345`.
pub fn parse_sbatch_output(stdout: &str) -> AppResult<String> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| parse_error("sbatch printed no job id"))?;
    let candidate = line
        .strip_prefix("Submitted batch job ")
        .unwrap_or(line)
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    if !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit()) {
        Ok(candidate.to_string())
    } else {
        Err(parse_error(format!("unexpected sbatch output '{line}'")))
    }
}

/// Maps a Slurm job state, long or decorated (`CANCELLED by 1000`), to the
/// canonical state.
pub fn map_slurm_state(raw: &str) -> JobState {
    let base = raw
        .trim()
        .split(|c: char| c.is_whitespace() || c == '+' || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match base.as_str() {
        "PENDING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" | "CONFIGURING"
        | "RESV_DEL_HOLD" => JobState::Pending,
        "RUNNING" | "RESIZING" | "SIGNALING" => JobState::Running,
        "SUSPENDED" | "STOPPED" => JobState::Suspended,
        "COMPLETING" | "STAGE_OUT" => JobState::Completing,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" | "SPECIAL_EXIT" => {
            JobState::Failed
        }
        "TIMEOUT" | "DEADLINE" => JobState::Timeout,
        "CANCELLED" | "PREEMPTED" | "REVOKED" => JobState::Cancelled,
        _ => JobState::Unknown,
    }
}

/// `N:S` from sacct; an empty field means the status is not reported.
pub fn parse_exit_code(raw: &str) -> AppResult<Option<i32>> {
    let code = raw.trim().split(':').next().unwrap_or("").trim();
    if code.is_empty() {
        return Ok(None);
    }
    code.parse()
        .map(Some)
        .map_err(|_| parse_error(format!("invalid exit code '{raw}'")))
}

fn parse_sacct_line(line: &str, tz: UtcOffset) -> AppResult<Job> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 9 {
        return Err(parse_error(format!("expected 9 sacct fields, got {}", fields.len())));
    }
    let raw_state = fields[3].trim();
    Ok(Job {
        job_id: fields[0].trim().to_string(),
        state: map_slurm_state(raw_state),
        raw_state: raw_state.to_string(),
        submit_time: parse_timestamp(fields[5], tz)?,
        start_time: parse_timestamp(fields[6], tz)?,
        end_time: parse_timestamp(fields[7], tz)?,
        exit_code: parse_exit_code(fields[4])?,
        owner: fields[1].trim().to_string(),
        partition: fields[2].trim().to_string(),
        name: fields[8..].join("|"),
    })
}

fn parse_squeue_line(line: &str, tz: UtcOffset) -> AppResult<Job> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 7 {
        return Err(parse_error(format!("expected 7 squeue fields, got {}", fields.len())));
    }
    let raw_state = fields[3].trim();
    let state = map_slurm_state(raw_state);
    // squeue reports an expected start time for pending jobs.
    let start_time = if state == JobState::Pending {
        None
    } else {
        parse_timestamp(fields[5], tz)?
    };
    Ok(Job {
        job_id: fields[0].trim().to_string(),
        state,
        raw_state: raw_state.to_string(),
        submit_time: parse_timestamp(fields[4], tz)?,
        start_time,
        end_time: None,
        exit_code: None,
        owner: fields[1].trim().to_string(),
        partition: fields[2].trim().to_string(),
        name: fields[6..].join("|"),
    })
}

/// Parses one record per line; a record that cannot be read becomes UNKNOWN
/// instead of failing the whole listing.
fn parse_records(stdout: &str, parse: impl Fn(&str) -> AppResult<Job>) -> Vec<Job> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            parse(line).unwrap_or_else(|err| {
                tracing::warn!(record = line, "unreadable slurm record: {err}");
                let mut fields = line.split('|');
                let job_id = fields.next().unwrap_or("").trim();
                let owner = fields.next().unwrap_or("").trim().to_string();
                let raw_state = fields.nth(1).unwrap_or("").trim();
                Job {
                    owner,
                    ..Job::unknown(job_id, raw_state)
                }
            })
        })
        .collect()
}
