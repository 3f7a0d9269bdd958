// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::{AppErrorKind, AppResult};
use crate::app::executor::CommandExecutor;
use crate::app::pool::ConnectionPool;
use crate::app::types::{ClusterConfig, ExecutionRequest, ExecutionResult, Identity};

#[async_trait]
/// Runs commands on one cluster for one identity.
/// Scheduler adapters and filesystem operations depend only on this.
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> AppResult<ExecutionResult>;
}

/// Borrow, execute, return: the pool and executor glued together for one
/// (cluster, identity) pair.
#[derive(Clone)]
pub struct ClusterRunner {
    pool: Arc<ConnectionPool>,
    executor: Arc<CommandExecutor>,
    cluster: Arc<ClusterConfig>,
    identity: Identity,
    acquire_timeout: Duration,
}

impl ClusterRunner {
    pub fn new(
        pool: Arc<ConnectionPool>,
        executor: Arc<CommandExecutor>,
        cluster: Arc<ClusterConfig>,
        identity: Identity,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            executor,
            cluster,
            identity,
            acquire_timeout,
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterConfig> {
        &self.cluster
    }
}

#[async_trait]
impl CommandRunner for ClusterRunner {
    async fn run(&self, request: ExecutionRequest) -> AppResult<ExecutionResult> {
        let mut conn = self
            .pool
            .acquire(&self.cluster, &self.identity, self.acquire_timeout)
            .await?;
        let result = self.executor.execute(&mut conn, request).await;
        let healthy = match &result {
            Ok(_) => true,
            Err(err) => err.kind() != AppErrorKind::ConnectFailed,
        };
        self.pool.release(conn, healthy).await;
        result
    }
}
