// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use async_trait::async_trait;
use time::UtcOffset;

use super::timestamps::parse_timestamp;
use super::{
    AdapterContext, SchedulerAdapter, job_not_found, parse_error, resolve_window, retain_window,
    validate_job_id,
};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::shell::{is_env_name, sh_escape, sh_join};
use crate::app::types::{
    ExecutionRequest, ExecutionResult, Job, JobFilter, JobSpec, JobState, SchedulerKind,
    TimeWindow,
};

/// `Exit_status` PBS assigns when the walltime limit killed the job.
const EXIT_WALLTIME: i32 = -29;
/// Exit statuses above this encode `256 + signal`.
const SIGNAL_BASE: i32 = 256;

/// OpenPBS through qsub/qstat/qdel over SSH.
pub struct OpenPbsAdapter {
    ctx: AdapterContext,
}

impl OpenPbsAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    fn tz(&self) -> UtcOffset {
        self.ctx.cluster.timezone
    }

    /// `qstat -f`, tolerating ids the server no longer knows.
    async fn qstat(&self, history: bool, ids: &[&str]) -> AppResult<Vec<Job>> {
        let mut command = String::from("qstat -f");
        if history {
            command.push_str(" -x");
        }
        for id in ids {
            command.push(' ');
            command.push_str(id);
        }
        let result = self.ctx.runner.run(ExecutionRequest::new(command)).await?;
        let result = tolerate_unknown_jobs(result)?;
        Ok(parse_qstat_full(&result.stdout, self.tz()))
    }

    fn keep_own(&self, jobs: &mut Vec<Job>, filter: &JobFilter) {
        if !filter.allusers {
            let user = &self.ctx.identity.username;
            jobs.retain(|job| &job.owner == user);
        }
    }
}

#[async_trait]
impl SchedulerAdapter for OpenPbsAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::OpenPbs
    }

    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self, spec),
        fields(op = "submit", kind = "openpbs", cluster = %self.ctx.cluster.name)
    )]
    async fn submit(&self, spec: &JobSpec) -> AppResult<String> {
        if spec.script.trim().is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "job script is empty",
            ));
        }
        let mut args = vec!["qsub".to_string()];
        if let Some(name) = &spec.name {
            args.push("-N".to_string());
            args.push(name.clone());
        }
        if let Some(vars) = variable_list(spec)? {
            args.push("-v".to_string());
            args.push(vars);
        }
        args.extend(spec.directives.iter().cloned());

        let command = format!("printf '%s' {} | {}", sh_escape(&spec.script), sh_join(&args));
        let mut request = ExecutionRequest::new(command).with_side_effects();
        // qsub records the submission directory as PBS_O_WORKDIR.
        if let Some(dir) = spec
            .working_dir
            .as_deref()
            .or_else(|| self.ctx.cluster.default_work_dir())
        {
            request = request.in_dir(dir);
        }
        let result = self.ctx.runner.run(request).await?.into_success()?;
        let job_id = result
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| parse_error("qsub printed no job id"))?;
        let job_id = validate_job_id(job_id)
            .map_err(|_| parse_error(format!("unexpected qsub output '{job_id}'")))?
            .to_string();
        tracing::info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    async fn status(&self, filter: &JobFilter) -> AppResult<Vec<Job>> {
        if filter.job_ids.is_empty() {
            let mut jobs = self.qstat(false, &[]).await?;
            self.keep_own(&mut jobs, filter);
            return Ok(jobs);
        }
        let ids = filter
            .job_ids
            .iter()
            .map(|id| validate_job_id(id))
            .collect::<AppResult<Vec<_>>>()?;
        self.qstat(true, &ids).await
    }

    #[tracing::instrument(
        name = "scheduler",
        level = "debug",
        skip(self),
        fields(op = "cancel", kind = "openpbs", cluster = %self.ctx.cluster.name)
    )]
    async fn cancel(&self, job_id: &str) -> AppResult<()> {
        let job_id = validate_job_id(job_id)?;
        let result = self
            .ctx
            .runner
            .run(ExecutionRequest::new(format!("qdel {job_id}")))
            .await?;
        if is_unknown_job(&result.stderr) {
            return Err(job_not_found(job_id));
        }
        result.into_success()?;
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, window: Option<TimeWindow>) -> AppResult<Vec<Job>> {
        let window = resolve_window(window, self.ctx.clock.now_utc());
        let mut jobs = self.qstat(true, &[]).await?;
        self.keep_own(&mut jobs, filter);
        if !filter.job_ids.is_empty() {
            jobs.retain(|job| filter.job_ids.iter().any(|id| id == &job.job_id));
        }
        retain_window(&mut jobs, &window);
        Ok(jobs)
    }

    async fn ping(&self) -> AppResult<()> {
        self.ctx
            .runner
            .run(ExecutionRequest::new("qstat -B"))
            .await?
            .into_success()?;
        Ok(())
    }
}

fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Unknown Job Id")
}

/// qstat exits non-zero when any requested id is unknown but still prints the
/// others; that case is not a failure.
fn tolerate_unknown_jobs(result: ExecutionResult) -> AppResult<ExecutionResult> {
    if result.success() {
        return Ok(result);
    }
    let only_unknown = !result.stderr.trim().is_empty()
        && result
            .stderr
            .lines()
            .filter(|line| !line.trim().is_empty())
            .all(is_unknown_job);
    if only_unknown {
        Ok(result)
    } else {
        result.into_success()
    }
}

/// `-v` argument: `K=V,K2=V2`, quoting values that contain commas.
fn variable_list(spec: &JobSpec) -> AppResult<Option<String>> {
    if spec.env.is_empty() {
        return Ok(None);
    }
    let mut vars = Vec::with_capacity(spec.env.len());
    for (name, value) in &spec.env {
        if !is_env_name(name) {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("invalid environment variable name '{name}'"),
            ));
        }
        if value.contains(',') {
            if value.contains('\'') {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    format!("value of '{name}' cannot contain both a comma and a single quote"),
                ));
            }
            vars.push(format!("{name}='{value}'"));
        } else {
            vars.push(format!("{name}={value}"));
        }
    }
    Ok(Some(vars.join(",")))
}

/// Splits `qstat -f` output into one attribute map per job. Long values are
/// wrapped onto tab-indented continuation lines.
fn split_records(stdout: &str) -> Vec<(String, HashMap<String, String>)> {
    let mut records = Vec::new();
    let mut current: Option<(String, HashMap<String, String>)> = None;
    let mut last_key: Option<String> = None;

    for line in stdout.lines() {
        if let Some(id) = line.strip_prefix("Job Id:") {
            if let Some(record) = current.take() {
                records.push(record);
            }
            current = Some((id.trim().to_string(), HashMap::new()));
            last_key = None;
            continue;
        }
        let Some((_, attrs)) = current.as_mut() else {
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        let continuation = line.starts_with('\t') || !line.contains(" = ");
        if continuation {
            if let Some(value) = last_key.as_ref().and_then(|key| attrs.get_mut(key)) {
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(" = ") {
            let key = key.trim().to_string();
            attrs.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }
    }
    if let Some(record) = current {
        records.push(record);
    }
    records
}

fn parse_qstat_full(stdout: &str, tz: UtcOffset) -> Vec<Job> {
    split_records(stdout)
        .into_iter()
        .map(|(job_id, attrs)| {
            job_from_attrs(&job_id, &attrs, tz).unwrap_or_else(|err| {
                tracing::warn!(job_id = %job_id, "unreadable pbs record: {err}");
                let raw_state = attrs.get("job_state").cloned().unwrap_or_default();
                Job {
                    owner: owner_of(&attrs),
                    ..Job::unknown(job_id, raw_state)
                }
            })
        })
        .collect()
}

fn job_from_attrs(job_id: &str, attrs: &HashMap<String, String>, tz: UtcOffset) -> AppResult<Job> {
    let attr = |key: &str| attrs.get(key).map(String::as_str).unwrap_or("");
    let raw_state = attr("job_state").to_string();
    if raw_state.is_empty() {
        return Err(parse_error("record has no job_state"));
    }
    let exit_code = match attr("Exit_status") {
        "" => None,
        raw => Some(
            raw.parse::<i32>()
                .map_err(|_| parse_error(format!("invalid Exit_status '{raw}'")))?,
        ),
    };
    let end_raw = match attr("obittime") {
        "" => attr("mtime").to_string(),
        obit => obit.to_string(),
    };
    let state = map_pbs_state(&raw_state, exit_code);
    let end_time = if state.is_terminal() {
        parse_timestamp(&end_raw, tz)?
    } else {
        None
    };
    Ok(Job {
        job_id: job_id.to_string(),
        state,
        raw_state,
        submit_time: parse_timestamp(attr("ctime"), tz)?,
        start_time: parse_timestamp(attr("stime"), tz)?,
        end_time,
        exit_code,
        owner: owner_of(attrs),
        partition: attr("queue").to_string(),
        name: attr("Job_Name").to_string(),
    })
}

/// `Job_Owner` is `user@submit-host`.
fn owner_of(attrs: &HashMap<String, String>) -> String {
    attrs
        .get("Job_Owner")
        .and_then(|owner| owner.split('@').next())
        .unwrap_or("")
        .to_string()
}

/// PBS state letters. Finished jobs (`F`, `X`) are classified by their
/// `Exit_status`.
pub fn map_pbs_state(raw: &str, exit_code: Option<i32>) -> JobState {
    match raw.trim() {
        "Q" | "H" | "W" | "T" | "M" => JobState::Pending,
        "R" | "B" => JobState::Running,
        "S" | "U" => JobState::Suspended,
        "E" => JobState::Completing,
        "F" | "X" => match exit_code {
            Some(0) => JobState::Completed,
            Some(EXIT_WALLTIME) => JobState::Timeout,
            Some(code) if code > SIGNAL_BASE && matches!(code - SIGNAL_BASE, 9 | 15) => {
                JobState::Cancelled
            }
            Some(_) => JobState::Failed,
            None => JobState::Unknown,
        },
        _ => JobState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{FixedClock, ScriptedRunner, cluster, output, stdout};
    use crate::app::types::Identity;
    use std::sync::Arc;
    use time::macros::{datetime, offset};

    const FINISHED: &str = "Job Id: 101.pbs01
    Job_Name = train
    Job_Owner = alice@login01.example.org
    job_state = F
    queue = workq
    ctime = Sat Mar  9 10:00:00 2024
    stime = Sat Mar  9 10:01:00 2024
    obittime = Sat Mar  9 10:05:00 2024
    Exit_status = 0
    Variable_List = PBS_O_HOME=/home/alice,PBS_O_LANG=en_US.UTF-8,
\tPBS_O_LOGNAME=alice,PBS_O_WORKDIR=/scratch/alice

Job Id: 102.pbs01
    Job_Name = walltime
    Job_Owner = bob@login01.example.org
    job_state = F
    queue = long
    ctime = Sat Mar  9 11:00:00 2024
    Exit_status = -29

";

    fn adapter(runner: Arc<ScriptedRunner>) -> OpenPbsAdapter {
        let mut config = cluster("pbs");
        config.scheduler.kind = SchedulerKind::OpenPbs;
        config.timezone = offset!(+01:00);
        OpenPbsAdapter::new(AdapterContext {
            cluster: Arc::new(config),
            identity: Identity::new("alice"),
            runner,
            clock: Arc::new(FixedClock::new(datetime!(2024-03-10 12:00:00 UTC))),
        })
    }

    #[tokio::test]
    async fn submit_and_follow_job() {
        let running = "Job Id: 103.pbs01
    Job_Name = train
    Job_Owner = alice@login01
    job_state = R
    queue = workq
    ctime = Sun Mar 10 12:00:00 2024
    stime = Sun Mar 10 12:00:30 2024
";
        let runner = Arc::new(
            ScriptedRunner::new()
                .expect("| 'qsub' '-N' 'train'", stdout("103.pbs01\n"))
                .expect("qstat -f -x 103.pbs01", stdout(running)),
        );
        let pbs = adapter(runner.clone());
        let spec = JobSpec {
            script: "#!/bin/sh\nsleep 60\n".into(),
            name: Some("train".into()),
            working_dir: Some("/scratch/alice".into()),
            ..Default::default()
        };
        let id = pbs.submit(&spec).await.unwrap();
        assert_eq!(id, "103.pbs01");

        let job = pbs.job(&id).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.owner, "alice");
        assert_eq!(job.partition, "workq");
        assert_eq!(job.exit_code, None);
        assert_eq!(job.end_time, None);
        assert_eq!(job.start_time, Some(datetime!(2024-03-10 11:00:30 UTC)));
        assert_eq!(
            runner.requests()[0].working_dir.as_deref(),
            Some("/scratch/alice")
        );
    }

    #[tokio::test]
    async fn finished_jobs_are_classified_by_exit_status() {
        let runner = Arc::new(
            ScriptedRunner::new().expect("qstat -f -x", stdout(FINISHED)),
        );
        let filter = JobFilter {
            allusers: true,
            ..JobFilter::default()
        };
        let jobs = adapter(runner).list(&filter, None).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].state, JobState::Completed);
        assert_eq!(jobs[0].exit_code, Some(0));
        assert_eq!(jobs[0].submit_time, Some(datetime!(2024-03-09 09:00:00 UTC)));
        assert_eq!(jobs[0].end_time, Some(datetime!(2024-03-09 09:05:00 UTC)));
        assert_eq!(jobs[1].state, JobState::Timeout);
        assert_eq!(jobs[1].start_time, None);
        assert_eq!(jobs[1].end_time, None);
    }

    #[tokio::test]
    async fn list_keeps_own_recent_jobs() {
        let old = "Job Id: 90.pbs01
    Job_Owner = alice@login01
    job_state = F
    queue = workq
    ctime = Fri Mar  1 10:00:00 2024
    Exit_status = 1
";
        let runner = Arc::new(
            ScriptedRunner::new().expect("qstat -f -x", stdout(&format!("{FINISHED}{old}"))),
        );
        let jobs = adapter(runner)
            .list(&JobFilter::default(), None)
            .await
            .unwrap();
        let ids: Vec<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
        assert_eq!(ids, ["101.pbs01"]);
    }

    #[tokio::test]
    async fn unreadable_record_is_unknown() {
        let broken = "Job Id: 7.pbs01
    Job_Owner = alice@login01
    job_state = R
    ctime = sometime last week
Job Id: 8.pbs01
    Job_Owner = alice@login01
    Job_Name = fine
";
        let runner = Arc::new(ScriptedRunner::new().expect("qstat -f", stdout(broken)));
        let jobs = adapter(runner)
            .status(&JobFilter::default())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].state, JobState::Unknown);
        assert_eq!(jobs[0].raw_state, "R");
        assert_eq!(jobs[1].state, JobState::Unknown);
        assert_eq!(jobs[1].job_id, "8.pbs01");
    }

    #[tokio::test]
    async fn partially_unknown_ids_still_return_known_jobs() {
        let runner = Arc::new(ScriptedRunner::new().expect(
            "qstat -f -x 101.pbs01 999.pbs01",
            output(153, FINISHED, "qstat: Unknown Job Id 999.pbs01\n"),
        ));
        let filter = JobFilter {
            job_ids: vec!["101.pbs01".into(), "999.pbs01".into()],
            ..JobFilter::default()
        };
        let jobs = adapter(runner).status(&filter).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "101.pbs01");
    }

    #[tokio::test]
    async fn qstat_failures_are_surfaced() {
        let runner = Arc::new(ScriptedRunner::new().expect(
            "qstat -f",
            output(2, "", "Connection refused\nqstat: cannot connect to server pbs01\n"),
        ));
        let err = adapter(runner)
            .status(&JobFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::CommandFailed);
        assert_eq!(err.exit_code(), Some(2));
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let runner = Arc::new(ScriptedRunner::new().expect(
            "qdel 5.pbs01",
            output(153, "", "qdel: Unknown Job Id 5.pbs01\n"),
        ));
        let err = adapter(runner).cancel("5.pbs01").await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);
    }

    #[tokio::test]
    async fn environment_goes_through_variable_list() {
        let runner = Arc::new(ScriptedRunner::new().expect("qsub", stdout("1.pbs01\n")));
        let mut spec = JobSpec {
            script: "#!/bin/sh\ntrue\n".into(),
            directives: vec!["-l".into(), "walltime=01:00:00".into()],
            ..Default::default()
        };
        spec.env.insert("A".into(), "1".into());
        spec.env.insert("LIST".into(), "x,y".into());
        adapter(runner.clone()).submit(&spec).await.unwrap();
        assert!(
            runner.commands()[0]
                .ends_with(r"'qsub' '-v' 'A=1,LIST='\''x,y'\''' '-l' 'walltime=01:00:00'")
        );
        assert!(runner.requests()[0].side_effects);
    }

    #[test]
    fn state_letters() {
        assert_eq!(map_pbs_state("Q", None), JobState::Pending);
        assert_eq!(map_pbs_state("H", None), JobState::Pending);
        assert_eq!(map_pbs_state("E", None), JobState::Completing);
        assert_eq!(map_pbs_state("S", None), JobState::Suspended);
        assert_eq!(map_pbs_state("F", Some(271)), JobState::Cancelled);
        assert_eq!(map_pbs_state("F", Some(265)), JobState::Cancelled);
        assert_eq!(map_pbs_state("F", Some(2)), JobState::Failed);
        assert_eq!(map_pbs_state("F", None), JobState::Unknown);
        assert_eq!(map_pbs_state("Z", None), JobState::Unknown);
    }

    #[test]
    fn continuation_lines_are_joined() {
        let records = split_records(FINISHED);
        assert_eq!(
            records[0].1["Variable_List"],
            "PBS_O_HOME=/home/alice,PBS_O_LANG=en_US.UTF-8,PBS_O_LOGNAME=alice,PBS_O_WORKDIR=/scratch/alice"
        );
    }
}
