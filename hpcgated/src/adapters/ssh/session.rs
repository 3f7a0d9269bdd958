// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use russh::{ChannelMsg, Sig};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ChannelEvent, ExecChannel, RemoteSession};

mod auth;

pub(in crate::adapters::ssh) use auth::authenticate;

/// russh client handler that pins server keys through known_hosts.
#[derive(Clone, Debug)]
pub(super) struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts: Option<PathBuf>,
}

impl ClientHandler {
    pub(super) fn new(host: String, addr: SocketAddr, known_hosts: Option<PathBuf>) -> Self {
        Self {
            host,
            addr,
            known_hosts,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.addr,
            server_public_key,
            self.known_hosts.as_deref(),
        )
    }
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

fn learn_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<(), russh::keys::Error> {
    match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => learn_known_hosts(host, port, key),
    }
}

/// Accepts keys already in known_hosts (by name, then by IP) and learns unseen
/// ones. A mismatching key is an error.
fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, anyhow::Error> {
    let port = addr.port();
    let ip_host = addr.ip().to_string();
    let mut candidates = vec![host];
    if ip_host != host {
        candidates.push(ip_host.as_str());
    }
    for candidate in &candidates {
        match check_known_hosts_for(candidate, port, key, known_hosts_path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                log::warn!("server key validation failed for {host}:{port}: {err}");
                return Err(anyhow!(
                    "server key validation failed for {host}:{port}: {err}"
                ));
            }
        }
    }

    log::info!(
        "server key for {host}:{port} is not present in known_hosts (tried {}); learning",
        candidates.join(", ")
    );
    learn_known_hosts_for(host, port, key, known_hosts_path).map_err(|err| {
        log::warn!("failed to learn server key for {host}:{port}: {err}");
        anyhow!("failed to learn server key for {host}:{port}: {err}")
    })?;
    Ok(true)
}

/// One authenticated russh connection. Every exec opens its own channel.
pub struct SshSession {
    host: String,
    handle: russh::client::Handle<ClientHandler>,
}

impl SshSession {
    pub(super) fn new(host: String, handle: russh::client::Handle<ClientHandler>) -> Self {
        Self { host, handle }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

fn channel_error(host: &str, stage: &str, err: russh::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::ConnectFailed,
        codes::CONNECT_FAILED,
        format!("{stage} on {host} failed: {err}"),
    )
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn open_exec(&self, command: &str) -> AppResult<Box<dyn ExecChannel>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| channel_error(&self.host, "open session", err))?;
        channel
            .exec(true, command)
            .await
            .map_err(|err| channel_error(&self.host, "exec request", err))?;
        Ok(Box::new(SshExecChannel {
            channel,
            closed: false,
        }))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(err) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            log::debug!("disconnect from {} failed: {err}", self.host);
        }
    }
}

struct SshExecChannel {
    channel: russh::Channel<russh::client::Msg>,
    closed: bool,
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        while !self.closed {
            let Some(msg) = self.channel.wait().await else {
                self.closed = true;
                break;
            };
            if matches!(msg, ChannelMsg::Close) {
                self.closed = true;
                break;
            }
            if let Some(event) = channel_event(msg) {
                return Some(event);
            }
        }
        None
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.channel.close().await;
        }
    }
}

fn channel_event(msg: ChannelMsg) -> Option<ChannelEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(ChannelEvent::Stdout(data.to_vec())),
        ChannelMsg::ExtendedData { data, ext: 1 } => Some(ChannelEvent::Stderr(data.to_vec())),
        ChannelMsg::ExitStatus { exit_status } => Some(ChannelEvent::ExitStatus(exit_status as i32)),
        ChannelMsg::ExitSignal { signal_name, .. } => {
            Some(ChannelEvent::ExitSignal(signal_label(&signal_name)))
        }
        ChannelMsg::Eof => Some(ChannelEvent::Eof),
        _ => None,
    }
}

fn signal_label(signal: &Sig) -> String {
    let name = match signal {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(name) => name.as_str(),
    };
    name.to_string()
}
