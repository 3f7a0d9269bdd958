// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::pool::Connection;
use crate::app::ports::{ChannelEvent, ExecChannel, RemoteSession};
use crate::app::services::shell::sh_escape;
use crate::app::types::{CancelSignal, ClusterConfig, ExecutionRequest, ExecutionResult};

/// Prefix of the first stdout line printed by the exec wrapper; the rest of
/// the line is the remote process group id.
pub(crate) const PGID_MARKER: &str = "__HPCGATE_PGID__";

const MARKER_SCAN_LIMIT: usize = 8 * 1024;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_CONFIRM_ATTEMPTS: usize = 20;
/// How long an interrupted command may still take to report its process group.
const MARKER_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Upper bound for every command, whatever the cluster or caller asks for.
    pub timeout_ceiling: Duration,
    /// Per-stream cap; output beyond it is dropped and flagged.
    pub max_output_bytes: usize,
    /// Time between SIGTERM and SIGKILL when reclaiming a process group.
    pub kill_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_ceiling: Duration::from_secs(300),
            max_output_bytes: 5 * 1024 * 1024,
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Confirmed,
    Unconfirmed,
    /// The wrapper never reported its process group.
    GroupUnknown,
}

/// Runs one command over a borrowed connection. Never retries.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    settings: ExecutorSettings,
}

impl CommandExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Per-call override if given, else the cluster's execution timeout;
    /// both clamped to the global ceiling.
    pub fn effective_timeout(&self, cluster: &ClusterConfig, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(cluster.ssh.timeouts.command_execution)
            .min(self.settings.timeout_ceiling)
    }

    #[tracing::instrument(
        name = "exec",
        level = "debug",
        skip(self, conn, request),
        fields(cluster = %conn.key().cluster, user = %conn.key().username)
    )]
    pub async fn execute(
        &self,
        conn: &mut Connection,
        request: ExecutionRequest,
    ) -> AppResult<ExecutionResult> {
        let cluster = conn.cluster().clone();
        let timeout = self.effective_timeout(&cluster, request.timeout);
        let mut cancel = request.cancel.clone();
        if cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(cancelled_error(&cluster.name));
        }

        let started = Instant::now();
        let wrapped = wrap_command(&request.command, request.working_dir.as_deref());
        tracing::debug!(command = %request.command, timeout_ms = timeout.as_millis() as u64, "executing");

        let mut channel = match tokio::time::timeout(timeout, conn.session().open_exec(&wrapped)).await
        {
            Ok(channel) => channel?,
            Err(_) => {
                conn.poison();
                return Err(timeout_error(&cluster.name, timeout));
            }
        };
        let mut process = RemoteProcess::new(
            conn.session().clone(),
            conn.poison_flag(),
            self.settings.kill_grace,
            cluster.name.clone(),
        );

        let mut stdout = CappedOutput::new(self.settings.max_output_bytes);
        let mut stderr = CappedOutput::new(self.settings.max_output_bytes);
        let mut scanner = MarkerScanner::default();
        let mut exit_code = None;
        let mut signal = None;

        let deadline = tokio::time::sleep_until(started + timeout);
        tokio::pin!(deadline);
        let interrupt = loop {
            tokio::select! {
                biased;
                _ = wait_for_cancel(&mut cancel) => break Some(Interrupt::Cancelled),
                _ = &mut deadline => break Some(Interrupt::TimedOut),
                event = channel.next_event() => match event {
                    Some(ChannelEvent::Stdout(data)) => {
                        scanner.feed(&data, &mut stdout);
                        if let Some(pgid) = scanner.pgid {
                            process.set_pgid(pgid);
                        }
                    }
                    Some(ChannelEvent::Stderr(data)) => stderr.push(&data),
                    Some(ChannelEvent::ExitStatus(code)) => exit_code = Some(code),
                    Some(ChannelEvent::ExitSignal(name)) => signal = Some(name),
                    Some(ChannelEvent::Eof) => {}
                    None => break None,
                },
            }
        };

        let Some(interrupt) = interrupt else {
            channel.close().await;
            process.disarm();
            scanner.finish(&mut stdout);
            if exit_code.is_none() && signal.is_none() {
                conn.poison();
                return Err(AppError::with_message(
                    AppErrorKind::ConnectFailed,
                    codes::CHANNEL_LOST,
                    "channel closed before the remote command reported its exit status",
                )
                .with_context(format!("cluster={}", cluster.name)));
            }
            let duration = started.elapsed();
            let truncated = stdout.truncated || stderr.truncated;
            tracing::debug!(
                exit_code = exit_code.unwrap_or(-1),
                signal = signal.as_deref().unwrap_or(""),
                duration_ms = duration.as_millis() as u64,
                truncated,
                "command finished"
            );
            return Ok(ExecutionResult {
                exit_code: exit_code.unwrap_or(-1),
                signal,
                stdout: stdout.into_string(),
                stderr: stderr.into_string(),
                duration,
                truncated,
            });
        };

        if process.pgid.is_none() && !scanner.done {
            match await_marker(channel.as_mut(), &mut scanner, &mut stdout, MARKER_WAIT).await {
                MarkerWait::Reported(pgid) => process.set_pgid(pgid),
                MarkerWait::Exited => {
                    // The wrapper is gone, so is its process group.
                    process.disarm();
                    channel.close().await;
                    return Err(interrupt.into_error(&cluster.name, timeout));
                }
                MarkerWait::Missing => {}
            }
        }
        channel.close().await;

        let outcome = process.terminate().await;
        tracing::debug!(?interrupt, ?outcome, "remote process reclaimed");
        if outcome == KillOutcome::GroupUnknown {
            return Err(interrupt.unconfirmed_error(&cluster.name, timeout));
        }
        Err(interrupt.into_error(&cluster.name, timeout))
    }
}

enum MarkerWait {
    Reported(i32),
    /// The channel closed first: the command has already exited.
    Exited,
    Missing,
}

/// Keeps reading an interrupted command's stdout until the wrapper reports its
/// process group, the channel closes or `window` runs out.
async fn await_marker(
    channel: &mut dyn ExecChannel,
    scanner: &mut MarkerScanner,
    stdout: &mut CappedOutput,
    window: Duration,
) -> MarkerWait {
    let read = async {
        while let Some(event) = channel.next_event().await {
            if let ChannelEvent::Stdout(data) = event {
                scanner.feed(&data, stdout);
                if let Some(pgid) = scanner.pgid {
                    return MarkerWait::Reported(pgid);
                }
                if scanner.done {
                    return MarkerWait::Missing;
                }
            }
        }
        MarkerWait::Exited
    };
    tokio::time::timeout(window, read)
        .await
        .unwrap_or(MarkerWait::Missing)
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    TimedOut,
    Cancelled,
}

impl Interrupt {
    fn into_error(self, cluster: &str, timeout: Duration) -> AppError {
        match self {
            Interrupt::TimedOut => timeout_error(cluster, timeout),
            Interrupt::Cancelled => cancelled_error(cluster),
        }
    }

    /// Same kind as `into_error`, but says the remote process may have survived.
    fn unconfirmed_error(self, cluster: &str, timeout: Duration) -> AppError {
        let (kind, reason) = match self {
            Interrupt::TimedOut => (
                AppErrorKind::CommandTimeout,
                format!("command did not finish within {timeout:?}"),
            ),
            Interrupt::Cancelled => (AppErrorKind::Cancelled, "command cancelled".to_string()),
        };
        AppError::with_message(
            kind,
            codes::PROCESS_UNCONFIRMED,
            format!("{reason}; its remote process group was never reported and may still be running"),
        )
        .with_context(format!("cluster={cluster}"))
    }
}

fn timeout_error(cluster: &str, timeout: Duration) -> AppError {
    AppError::with_message(
        AppErrorKind::CommandTimeout,
        codes::COMMAND_TIMEOUT,
        format!("command did not finish within {timeout:?}"),
    )
    .with_context(format!("cluster={cluster}"))
}

fn cancelled_error(cluster: &str) -> AppError {
    AppError::with_message(AppErrorKind::Cancelled, codes::CANCELLED, "command cancelled")
        .with_context(format!("cluster={cluster}"))
}

async fn wait_for_cancel(cancel: &mut Option<CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Wraps `command` so it runs as the leader of a new process group whose id
/// is printed first on stdout.
pub fn wrap_command(command: &str, working_dir: Option<&str>) -> String {
    let mut script = format!("printf '%s%s\\n' {} \"$$\"; ", sh_escape(PGID_MARKER));
    if let Some(dir) = working_dir {
        script.push_str(&format!("cd -- {} || exit 1; ", sh_escape(dir)));
    }
    script.push_str(&format!("exec sh -c {}", sh_escape(command)));
    format!("exec setsid -w sh -c {}", sh_escape(&script))
}

struct CappedOutput {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedOutput {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.bytes.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(data);
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Default)]
struct MarkerScanner {
    pending: Vec<u8>,
    scanned: usize,
    pgid: Option<i32>,
    done: bool,
}

impl MarkerScanner {
    fn feed(&mut self, data: &[u8], out: &mut CappedOutput) {
        if self.done {
            out.push(data);
            return;
        }
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.scanned += line.len();
            if let Some(pgid) = parse_marker(&line) {
                self.pgid = Some(pgid);
                self.finish(out);
                return;
            }
            out.push(&line);
            if self.scanned >= MARKER_SCAN_LIMIT {
                self.finish(out);
                return;
            }
        }
        if self.scanned + self.pending.len() >= MARKER_SCAN_LIMIT {
            self.finish(out);
        }
    }

    fn finish(&mut self, out: &mut CappedOutput) {
        if !self.pending.is_empty() {
            out.push(&self.pending);
            self.pending.clear();
        }
        self.done = true;
    }
}

fn parse_marker(line: &[u8]) -> Option<i32> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    text.strip_prefix(PGID_MARKER)?
        .parse()
        .ok()
        .filter(|pgid| *pgid > 1)
}

/// Owner of a running remote process group. Dropping it while armed
/// schedules the same termination `terminate` performs.
struct RemoteProcess {
    session: Arc<dyn RemoteSession>,
    poisoned: Arc<AtomicBool>,
    pgid: Option<i32>,
    grace: Duration,
    cluster: String,
    armed: bool,
}

impl RemoteProcess {
    fn new(
        session: Arc<dyn RemoteSession>,
        poisoned: Arc<AtomicBool>,
        grace: Duration,
        cluster: String,
    ) -> Self {
        Self {
            session,
            poisoned,
            pgid: None,
            grace,
            cluster,
            armed: true,
        }
    }

    fn set_pgid(&mut self, pgid: i32) {
        self.pgid = Some(pgid);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn terminate(&mut self) -> KillOutcome {
        self.armed = false;
        let outcome = terminate_group(self.session.as_ref(), self.pgid, self.grace).await;
        record_outcome(&self.poisoned, &self.cluster, self.pgid, outcome);
        outcome
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.poisoned.store(true, Ordering::SeqCst);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                cluster = %self.cluster,
                pgid = ?self.pgid,
                "remote process abandoned outside a runtime; it may still be running"
            );
            return;
        };
        let session = self.session.clone();
        let poisoned = self.poisoned.clone();
        let cluster = self.cluster.clone();
        let pgid = self.pgid;
        let grace = self.grace;
        runtime.spawn(async move {
            let outcome = terminate_group(session.as_ref(), pgid, grace).await;
            record_outcome(&poisoned, &cluster, pgid, outcome);
            session.close().await;
        });
    }
}

fn record_outcome(poisoned: &AtomicBool, cluster: &str, pgid: Option<i32>, outcome: KillOutcome) {
    match outcome {
        KillOutcome::Confirmed => {}
        KillOutcome::Unconfirmed => {
            poisoned.store(true, Ordering::SeqCst);
            tracing::error!(
                cluster,
                pgid = ?pgid,
                "remote process group survived SIGKILL; closing its connection"
            );
        }
        KillOutcome::GroupUnknown => {
            poisoned.store(true, Ordering::SeqCst);
            tracing::error!(
                cluster,
                "remote process group id was never reported; closing its connection"
            );
        }
    }
}

async fn terminate_group(
    session: &dyn RemoteSession,
    pgid: Option<i32>,
    grace: Duration,
) -> KillOutcome {
    let Some(pgid) = pgid else {
        return KillOutcome::GroupUnknown;
    };
    if let Err(err) = run_control(session, &format!("kill -TERM -{pgid}")).await {
        tracing::warn!(pgid, "failed to send SIGTERM: {err}");
    }
    let deadline = Instant::now() + grace;
    loop {
        if group_alive(session, pgid).await == Some(false) {
            return KillOutcome::Confirmed;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }
    if let Err(err) = run_control(session, &format!("kill -KILL -{pgid}")).await {
        tracing::warn!(pgid, "failed to send SIGKILL: {err}");
    }
    for _ in 0..KILL_CONFIRM_ATTEMPTS {
        if group_alive(session, pgid).await == Some(false) {
            return KillOutcome::Confirmed;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }
    KillOutcome::Unconfirmed
}

async fn group_alive(session: &dyn RemoteSession, pgid: i32) -> Option<bool> {
    match run_control(session, &format!("kill -0 -{pgid}")).await {
        Ok(0) => Some(true),
        Ok(_) => Some(false),
        Err(_) => None,
    }
}

/// Runs a short unwrapped command and returns its exit status.
async fn run_control(session: &dyn RemoteSession, command: &str) -> AppResult<i32> {
    let run = async {
        let mut channel = session.open_exec(command).await?;
        let mut code = None;
        while let Some(event) = channel.next_event().await {
            if let ChannelEvent::ExitStatus(status) = event {
                code = Some(status);
            }
        }
        channel.close().await;
        code.ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::ConnectFailed,
                codes::CONNECT_FAILED,
                "control command ended without exit status",
            )
        })
    };
    match tokio::time::timeout(CONTROL_TIMEOUT, run).await {
        Ok(result) => result,
        Err(_) => Err(AppError::with_message(
            AppErrorKind::CommandTimeout,
            codes::COMMAND_TIMEOUT,
            format!("control command `{command}` timed out"),
        )),
    }
}
