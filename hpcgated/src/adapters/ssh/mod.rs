// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Config;
use russh::keys::PrivateKey;

use crate::adapters::network;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{Connector, CredentialsPort, RemoteSession, SshCredential, SshKey};
use crate::app::types::{ClusterConfig, Identity};

mod error;
mod session;

pub use error::AuthenticationFailure;
pub use session::SshSession;

use session::ClientHandler;

/// Opens russh sessions to a cluster's login nodes with the caller's key.
pub struct SshConnector {
    credentials: Arc<dyn CredentialsPort>,
    known_hosts: Option<PathBuf>,
}

impl SshConnector {
    pub fn new(credentials: Arc<dyn CredentialsPort>) -> Self {
        Self {
            credentials,
            known_hosts: None,
        }
    }

    /// Uses `path` instead of `~/.ssh/known_hosts`.
    pub fn with_known_hosts(mut self, path: Option<PathBuf>) -> Self {
        self.known_hosts = path;
        self
    }

    async fn connect_host(
        &self,
        host: &str,
        cluster: &ClusterConfig,
        username: &str,
        key: Arc<PrivateKey>,
    ) -> AppResult<SshSession> {
        let timeouts = &cluster.ssh.timeouts;
        let stream = network::open_stream(host, cluster.ssh.port, timeouts.connection).await?;
        let addr = stream.peer_addr().map_err(|err| {
            AppError::with_message(
                AppErrorKind::ConnectFailed,
                codes::NETWORK_ERROR,
                format!("{host}: {err}"),
            )
        })?;

        let handler = ClientHandler::new(host.to_string(), addr, self.known_hosts.clone());
        let login = async {
            let mut handle =
                russh::client::connect_stream(client_config(timeouts.keep_alive), stream, handler)
                    .await?;
            session::authenticate(&mut handle, username, key).await?;
            anyhow::Ok(handle)
        };
        let handle = tokio::time::timeout(timeouts.login, login)
            .await
            .map_err(|_| {
                AppError::with_message(
                    AppErrorKind::ConnectFailed,
                    codes::CONNECT_FAILED,
                    format!("{host}: login timed out after {}s", timeouts.login.as_secs()),
                )
            })?
            .map_err(|err| map_connect_error(host, err))?;
        Ok(SshSession::new(host.to_string(), handle))
    }
}

fn client_config(keep_alive: Duration) -> Arc<Config> {
    Arc::new(Config {
        // Pooled sessions sit idle between borrows; the pool decides when to drop them.
        inactivity_timeout: None,
        keepalive_interval: (!keep_alive.is_zero()).then_some(keep_alive),
        keepalive_max: 3,
        channel_buffer_size: 64,
        window_size: 1024 * 1024,
        ..Default::default()
    })
}

fn map_connect_error(host: &str, err: anyhow::Error) -> AppError {
    if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        AppError::with_message(
            AppErrorKind::AuthenticationFailed,
            codes::AUTHENTICATION_FAILED,
            format!("ssh authentication to {host} failed: {err}"),
        )
    } else {
        AppError::with_message(
            AppErrorKind::ConnectFailed,
            codes::CONNECT_FAILED,
            format!("ssh connect to {host} failed: {err}"),
        )
    }
}

fn load_key(credential: &SshCredential) -> AppResult<PrivateKey> {
    let passphrase = credential.passphrase.as_deref();
    let loaded = match &credential.private_key {
        SshKey::File(path) => russh::keys::load_secret_key(path, passphrase)
            .map_err(|err| format!("failed to load private key {}: {err}", path.display())),
        SshKey::Inline(text) => russh::keys::decode_secret_key(text, passphrase)
            .map_err(|err| format!("failed to decode inline private key: {err}")),
    };
    loaded.map_err(|message| {
        AppError::with_message(
            AppErrorKind::AuthenticationFailed,
            codes::AUTHENTICATION_FAILED,
            message,
        )
    })
}

#[async_trait]
impl Connector for SshConnector {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, cluster, identity),
        fields(op = "connect", cluster = %cluster.name, user = %identity.username, port = cluster.ssh.port)
    )]
    async fn connect(
        &self,
        cluster: &ClusterConfig,
        identity: &Identity,
    ) -> AppResult<Arc<dyn RemoteSession>> {
        let credential = self.credentials.ssh_credential(identity)?;
        let key = Arc::new(load_key(&credential)?);

        let mut last_err = None;
        for host in &cluster.ssh.hosts {
            match self
                .connect_host(host, cluster, &identity.username, key.clone())
                .await
            {
                Ok(session) => {
                    tracing::debug!(host = %host, "ssh session established");
                    return Ok(Arc::new(session));
                }
                // A rejected key will be rejected by every login node.
                Err(err) if err.kind() == AppErrorKind::AuthenticationFailed => return Err(err),
                Err(err) => {
                    tracing::warn!(host = %host, error = %err, "login node unavailable");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            AppError::with_message(
                AppErrorKind::ConnectFailed,
                codes::CONNECT_FAILED,
                format!("cluster {} has no login hosts", cluster.name),
            )
        }))
    }
}
