// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::net::NetError;

/// Connects to the first address that answers within `per_addr` each.
pub async fn connect_first(
    host: &str,
    addrs: &[SocketAddr],
    per_addr: Duration,
) -> Result<TcpStream, NetError> {
    for addr in addrs {
        match timeout(per_addr, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(err)) => tracing::debug!(%addr, error = %err, "tcp connect failed"),
            Err(_) => tracing::debug!(%addr, timeout_ms = per_addr.as_millis() as u64, "tcp connect timed out"),
        }
    }
    Err(NetError::Unreachable(host.to_owned()))
}
