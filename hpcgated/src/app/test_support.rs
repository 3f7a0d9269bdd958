// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-memory stand-ins for login nodes, connectors and command runners.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::executor::PGID_MARKER;
use crate::app::ports::{ChannelEvent, ClockPort, Connector, ExecChannel, RemoteSession};
use crate::app::runner::CommandRunner;
use crate::app::types::{
    ClusterConfig, ExecutionRequest, ExecutionResult, Identity, ProbingSettings,
    SchedulerKind, SchedulerSettings, SshSettings, SshTimeouts,
};

pub fn cluster(name: &str) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        ssh: SshSettings {
            hosts: vec![format!("{}-login.example.org", name.to_ascii_lowercase())],
            port: 22,
            max_clients: 4,
            timeouts: SshTimeouts {
                command_execution: Duration::from_secs(10),
                ..SshTimeouts::default()
            },
        },
        scheduler: SchedulerSettings {
            kind: SchedulerKind::SlurmCli,
            version: None,
            api_url: None,
            api_version: "v0.0.40".to_string(),
            timeout: Duration::from_secs(10),
        },
        probing: ProbingSettings {
            enabled: true,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            username: Some("probe".to_string()),
        },
        file_systems: Vec::new(),
        timezone: UtcOffset::UTC,
    }
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> AppResult<ExecutionResult> {
    Ok(ExecutionResult {
        exit_code,
        signal: None,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration: Duration::from_millis(5),
        truncated: false,
    })
}

pub fn stdout(text: &str) -> AppResult<ExecutionResult> {
    output(0, text, "")
}

/// What a fake login node does when asked to run a command.
#[derive(Debug, Clone)]
pub struct FakeProgram {
    pub stdout: Vec<Vec<u8>>,
    pub stderr: Vec<u8>,
    pub exit: i32,
    pub runtime: Duration,
}

impl FakeProgram {
    pub fn quick(stdout: &str) -> Self {
        Self {
            stdout: vec![stdout.as_bytes().to_vec()],
            stderr: Vec::new(),
            exit: 0,
            runtime: Duration::ZERO,
        }
    }

    pub fn sleeping(runtime: Duration) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: 0,
            runtime,
        }
    }
}

type Behaviour = Arc<dyn Fn(&str) -> FakeProgram + Send + Sync>;

#[derive(Default)]
struct HostState {
    next_pgid: i32,
    alive: HashMap<i32, bool>,
    commands: Vec<String>,
    ignore_term: bool,
    kills_fail: bool,
    marker_delay: Duration,
}

/// A login node that tracks process groups started through the exec wrapper.
pub struct FakeHost {
    behaviour: Behaviour,
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new(behaviour: impl Fn(&str) -> FakeProgram + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Arc::new(behaviour),
            state: Mutex::new(HostState {
                next_pgid: 4000,
                ..Default::default()
            }),
        })
    }

    pub fn set_ignore_term(&self, value: bool) {
        self.state.lock().expect("host lock").ignore_term = value;
    }

    pub fn set_kills_fail(&self, value: bool) {
        self.state.lock().expect("host lock").kills_fail = value;
    }

    /// Holds back the process-group line, as a slow link would.
    pub fn set_marker_delay(&self, delay: Duration) {
        self.state.lock().expect("host lock").marker_delay = delay;
    }

    pub fn alive_groups(&self) -> Vec<i32> {
        let state = self.state.lock().expect("host lock");
        let mut alive: Vec<i32> = state
            .alive
            .iter()
            .filter(|(_, alive)| **alive)
            .map(|(pgid, _)| *pgid)
            .collect();
        alive.sort();
        alive
    }

    pub fn spawned_groups(&self) -> usize {
        self.state.lock().expect("host lock").alive.len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().expect("host lock").commands.clone()
    }

    fn spawn(&self) -> i32 {
        let mut state = self.state.lock().expect("host lock");
        state.next_pgid += 1;
        let pgid = state.next_pgid;
        state.alive.insert(pgid, true);
        pgid
    }

    fn finish(&self, pgid: i32) -> bool {
        let mut state = self.state.lock().expect("host lock");
        let was_alive = state.alive.get(&pgid).copied().unwrap_or(false);
        state.alive.insert(pgid, false);
        was_alive
    }

    fn kill(&self, command: &str) -> i32 {
        let mut parts = command.split_whitespace().skip(1);
        let signal = parts.next().unwrap_or_default().trim_start_matches('-');
        let pgid: i32 = parts
            .next()
            .and_then(|raw| raw.trim_start_matches('-').parse().ok())
            .unwrap_or(-1);
        let mut state = self.state.lock().expect("host lock");
        let alive = state.alive.get(&pgid).copied().unwrap_or(false);
        match signal {
            "0" => {
                if alive {
                    0
                } else {
                    1
                }
            }
            "TERM" if alive && !state.ignore_term => {
                state.alive.insert(pgid, false);
                0
            }
            "KILL" if alive && !state.kills_fail => {
                state.alive.insert(pgid, false);
                0
            }
            _ if alive => 0,
            _ => 1,
        }
    }
}

pub struct FakeSession {
    pub id: u64,
    host: Arc<FakeHost>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn drop_link(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn open_exec(&self, command: &str) -> AppResult<Box<dyn ExecChannel>> {
        if self.closed() {
            return Err(AppError::with_message(
                AppErrorKind::ConnectFailed,
                codes::CONNECT_FAILED,
                "session closed",
            ));
        }
        self.host
            .state
            .lock()
            .expect("host lock")
            .commands
            .push(command.to_string());

        if command.starts_with("kill ") {
            let code = self.host.kill(command);
            return Ok(Box::new(FakeExecChannel::immediate(
                self.host.clone(),
                vec![ChannelEvent::ExitStatus(code), ChannelEvent::Eof],
            )));
        }

        let program = (self.host.behaviour)(command);
        let mut prelude = VecDeque::new();
        let mut pgid = None;
        let mut marker_at = None;
        if command.contains(PGID_MARKER) {
            let delay = self.host.state.lock().expect("host lock").marker_delay;
            if !delay.is_zero() {
                marker_at = Some(Instant::now() + delay);
            }
            let group = self.host.spawn();
            prelude.push_back(ChannelEvent::Stdout(
                format!("{PGID_MARKER}{group}\n").into_bytes(),
            ));
            pgid = Some(group);
        }
        let mut tail: VecDeque<ChannelEvent> = program
            .stdout
            .into_iter()
            .map(ChannelEvent::Stdout)
            .collect();
        if !program.stderr.is_empty() {
            tail.push_back(ChannelEvent::Stderr(program.stderr));
        }
        tail.push_back(ChannelEvent::ExitStatus(program.exit));
        tail.push_back(ChannelEvent::Eof);
        Ok(Box::new(FakeExecChannel {
            host: self.host.clone(),
            prelude,
            marker_at,
            finish_at: Some(Instant::now() + program.runtime),
            pgid,
            tail,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeExecChannel {
    host: Arc<FakeHost>,
    prelude: VecDeque<ChannelEvent>,
    marker_at: Option<Instant>,
    finish_at: Option<Instant>,
    pgid: Option<i32>,
    tail: VecDeque<ChannelEvent>,
}

impl FakeExecChannel {
    fn immediate(host: Arc<FakeHost>, events: Vec<ChannelEvent>) -> Self {
        Self {
            host,
            prelude: events.into(),
            marker_at: None,
            finish_at: None,
            pgid: None,
            tail: VecDeque::new(),
        }
    }
}

#[async_trait]
impl ExecChannel for FakeExecChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(at) = self.marker_at {
            tokio::time::sleep_until(at).await;
            self.marker_at = None;
        }
        if let Some(event) = self.prelude.pop_front() {
            return Some(event);
        }
        if let Some(at) = self.finish_at {
            tokio::time::sleep_until(at).await;
            self.finish_at = None;
            if let Some(pgid) = self.pgid {
                if !self.host.finish(pgid) {
                    self.tail = VecDeque::from([ChannelEvent::ExitSignal("TERM".to_string())]);
                }
            }
        }
        self.tail.pop_front()
    }

    async fn close(&mut self) {
        self.prelude.clear();
        self.marker_at = None;
        self.tail.clear();
        self.finish_at = None;
    }
}

/// Connector that hands out `FakeSession`s bound to one `FakeHost`.
pub struct FakeConnector {
    host: Arc<FakeHost>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    failure: Mutex<Option<AppError>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new(host: Arc<FakeHost>) -> Arc<Self> {
        Arc::new(Self {
            host,
            next_id: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
            failure: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn quick() -> Arc<Self> {
        Self::new(FakeHost::new(|_| FakeProgram::quick("")))
    }

    pub fn fail_with(&self, err: Option<AppError>) {
        *self.failure.lock().expect("failure lock") = err;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn session(&self, id: u64) -> Arc<FakeSession> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .find(|session| session.id == id)
            .cloned()
            .expect("session should exist")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _cluster: &ClusterConfig,
        _identity: &Identity,
    ) -> AppResult<Arc<dyn RemoteSession>> {
        if let Some(err) = self.failure.lock().expect("failure lock").clone() {
            return Err(err);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(FakeSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            host: self.host.clone(),
            closed: AtomicBool::new(false),
        });
        self.sessions
            .lock()
            .expect("sessions lock")
            .push(session.clone());
        Ok(session)
    }
}

/// Runner that replays canned results and checks each command it receives.
#[derive(Default)]
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<(String, AppResult<ExecutionResult>)>>,
    seen: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(self, needle: &str, result: AppResult<ExecutionResult>) -> Self {
        self.steps
            .lock()
            .expect("steps lock")
            .push_back((needle.to_string(), result));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("seen lock")
            .iter()
            .map(|request| request.command.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().expect("steps lock").len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, request: ExecutionRequest) -> AppResult<ExecutionResult> {
        let (needle, result) = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected command: {}", request.command));
        assert!(
            request.command.contains(&needle),
            "command `{}` does not contain `{}`",
            request.command,
            needle
        );
        self.seen.lock().expect("seen lock").push(request);
        result
    }
}

pub struct FixedClock(Mutex<OffsetDateTime>);

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.0.lock().expect("clock lock") = now;
    }
}

impl ClockPort for FixedClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.0.lock().expect("clock lock")
    }
}
