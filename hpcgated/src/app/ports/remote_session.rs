// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(i32),
    ExitSignal(String),
    Eof,
}

#[async_trait]
pub trait ExecChannel: Send {
    /// Next event from the remote side; `None` once the channel is closed.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    async fn close(&mut self);
}

#[async_trait]
/// One established, authenticated session to a login node.
/// Each exec gets its own channel; the session itself is never shared
/// between two borrowers by the pool.
pub trait RemoteSession: Send + Sync {
    async fn open_exec(&self, command: &str) -> AppResult<Box<dyn ExecChannel>>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}
