// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::AppResult;
use crate::app::executor::CommandExecutor;
use crate::app::filesystem::FilesystemOps;
use crate::app::health::HealthMonitor;
use crate::app::pool::ConnectionPool;
use crate::app::ports::{ClockPort, SlurmRestTransport};
use crate::app::registry::{ClusterRegistry, ClusterSet};
use crate::app::retry::{RetryPolicy, RetryingRunner};
use crate::app::runner::{ClusterRunner, CommandRunner};
use crate::app::scheduler::{AdapterContext, SchedulerAdapter, build_adapter};
use crate::app::types::{ExecutionRequest, ExecutionResult, Identity};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// How long a caller waits for pool capacity.
    pub acquire_timeout: Duration,
    /// Opt-in retry of transient failures; `None` surfaces them directly.
    pub retry: Option<RetryPolicy>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            retry: None,
        }
    }
}

/// Entry point for the API layer: binds a cluster name and a caller identity
/// to a runner, a scheduler adapter or filesystem operations.
pub struct Gateway {
    registry: Arc<ClusterRegistry>,
    pool: Arc<ConnectionPool>,
    executor: Arc<CommandExecutor>,
    clock: Arc<dyn ClockPort>,
    rest: Option<Arc<dyn SlurmRestTransport>>,
    settings: GatewaySettings,
    monitor: Option<Arc<HealthMonitor>>,
}

impl Gateway {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        pool: Arc<ConnectionPool>,
        executor: Arc<CommandExecutor>,
        clock: Arc<dyn ClockPort>,
        rest: Option<Arc<dyn SlurmRestTransport>>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            registry,
            pool,
            executor,
            clock,
            rest,
            settings,
            monitor: None,
        }
    }

    /// Keeps the monitor's probe loops in step with reloads. The monitor must
    /// watch the same registry.
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn runner(&self, cluster: &str, identity: &Identity) -> AppResult<Arc<dyn CommandRunner>> {
        let cluster = self.registry.get(cluster)?;
        let runner = ClusterRunner::new(
            self.pool.clone(),
            self.executor.clone(),
            cluster,
            identity.clone(),
            self.settings.acquire_timeout,
        );
        Ok(match &self.settings.retry {
            Some(policy) => Arc::new(RetryingRunner::new(runner, policy.clone())),
            None => Arc::new(runner),
        })
    }

    pub async fn execute(
        &self,
        cluster: &str,
        identity: &Identity,
        request: ExecutionRequest,
    ) -> AppResult<ExecutionResult> {
        self.runner(cluster, identity)?.run(request).await
    }

    pub fn scheduler(
        &self,
        cluster: &str,
        identity: &Identity,
    ) -> AppResult<Arc<dyn SchedulerAdapter>> {
        let ctx = AdapterContext {
            cluster: self.registry.get(cluster)?,
            identity: identity.clone(),
            runner: self.runner(cluster, identity)?,
            clock: self.clock.clone(),
        };
        build_adapter(ctx, self.rest.clone())
    }

    pub fn filesystem(&self, cluster: &str, identity: &Identity) -> AppResult<FilesystemOps> {
        Ok(FilesystemOps::new(self.runner(cluster, identity)?))
    }

    /// Swaps in a new cluster generation. Pooled sessions of changed clusters
    /// are retired on their next use; idle ones go with the next reap.
    pub async fn reload(&self, set: ClusterSet) {
        let previous = self.registry.replace(set);
        let current = self.registry.snapshot();
        let removed: Vec<&str> = previous
            .iter()
            .filter(|cluster| current.get(&cluster.name).is_none())
            .map(|cluster| cluster.name.as_str())
            .collect();
        if !removed.is_empty() {
            tracing::info!(removed = ?removed, "clusters removed from configuration");
        }
        if let Some(monitor) = &self.monitor {
            monitor.reconcile();
        }
        self.pool.reap_idle().await;
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
