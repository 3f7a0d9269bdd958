// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use tokio::net::TcpStream;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};

mod net;
mod reachability;

pub use net::NetError;

fn map_net_error(host: &str, err: NetError) -> AppError {
    AppError::with_message(
        AppErrorKind::ConnectFailed,
        codes::NETWORK_ERROR,
        format!("{host}: {err}"),
    )
}

/// Resolves `host` and opens a TCP stream to the first address that accepts.
pub async fn open_stream(host: &str, port: u16, per_addr: Duration) -> AppResult<TcpStream> {
    let addrs = net::lookup_addrs(host, port)
        .await
        .map_err(|err| map_net_error(host, err))?;
    reachability::connect_first(host, &addrs, per_addr)
        .await
        .map_err(|err| map_net_error(host, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_hosts_are_transient_connect_failures() {
        let err = open_stream("hpcgate-should-not-exist.invalid", 22, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::ConnectFailed);
        assert_eq!(err.code(), codes::NETWORK_ERROR);
        assert!(err.is_transient());
        assert!(err.message().starts_with("hpcgate-should-not-exist.invalid: "));
    }
}
