// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::app::errors::{AppError, AppErrorKind};
use crate::app::executor::CommandExecutor;
use crate::app::pool::{ConnectionPool, PoolSettings};
use crate::app::ports::{ClockPort, Connector, SlurmRestTransport};
use crate::app::registry::ClusterRegistry;
use crate::app::runner::{ClusterRunner, CommandRunner};
use crate::app::scheduler::{AdapterContext, build_adapter};
use crate::app::services::shell::sh_join;
use crate::app::types::{
    ClusterConfig, ClusterHealth, ExecutionRequest, HealthStatus, Identity, cluster_key,
};

/// Exit status the liveness script uses for a missing filesystem.
const MISSING_FS_EXIT: i32 = 3;
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic per-cluster probes over a dedicated pool (one session per
/// cluster) so probing never takes capacity from request traffic.
pub struct HealthMonitor {
    registry: Arc<ClusterRegistry>,
    pool: Arc<ConnectionPool>,
    executor: Arc<CommandExecutor>,
    clock: Arc<dyn ClockPort>,
    rest: Option<Arc<dyn SlurmRestTransport>>,
    state: RwLock<HashMap<String, Arc<ClusterHealth>>>,
    loops: Mutex<HashMap<String, ProbeLoop>>,
    running: AtomicBool,
}

struct ProbeLoop {
    every: Duration,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        connector: Arc<dyn Connector>,
        executor: Arc<CommandExecutor>,
        clock: Arc<dyn ClockPort>,
        rest: Option<Arc<dyn SlurmRestTransport>>,
    ) -> Self {
        let pool = ConnectionPool::new(
            "health",
            connector,
            PoolSettings {
                capacity: Some(1),
                idle_retention: None,
            },
        );
        Self {
            registry,
            pool: Arc::new(pool),
            executor,
            clock,
            rest,
            state: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Latest health of every cluster probed so far, in configuration order.
    pub fn snapshot(&self) -> Vec<Arc<ClusterHealth>> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        self.registry
            .snapshot()
            .iter()
            .filter_map(|cluster| state.get(&cluster.key()).cloned())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterHealth>> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        state.get(&cluster_key(name)).cloned()
    }

    /// One probe of every cluster, concurrently.
    pub async fn run_once(self: &Arc<Self>) {
        let mut probes = JoinSet::new();
        for cluster in self.registry.snapshot().iter().cloned() {
            let monitor = self.clone();
            probes.spawn(async move { monitor.check(&cluster).await });
        }
        while let Some(joined) = probes.join_next().await {
            if let Err(err) = joined {
                tracing::error!("health probe task failed: {err}");
            }
        }
    }

    /// Starts one probe loop per configured cluster, replacing running loops.
    pub fn start(self: &Arc<Self>) {
        self.stop_tasks();
        self.running.store(true, Ordering::SeqCst);
        self.reconcile();
        tracing::info!(clusters = self.loop_count(), "health monitor started");
    }

    /// Brings the probe loops in line with the current cluster generation:
    /// new clusters get a loop, removed ones lose theirs and a changed
    /// interval restarts the loop. Does nothing before `start`.
    pub fn reconcile(self: &Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let clusters = self.registry.snapshot();
        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        loops.retain(|key, probe| {
            let keep = clusters.get(key).is_some() && !probe.handle.is_finished();
            if !keep {
                probe.handle.abort();
            }
            keep
        });
        for cluster in clusters.iter() {
            let key = cluster.key();
            let every = cluster.probing.interval.max(MIN_INTERVAL);
            if loops.get(&key).is_some_and(|probe| probe.every == every) {
                continue;
            }
            if let Some(stale) = loops.remove(&key) {
                stale.handle.abort();
            }
            tracing::debug!(cluster = %cluster.name, interval_s = every.as_secs(), "probe loop started");
            let handle = self.spawn_loop(key.clone(), every);
            loops.insert(key, ProbeLoop { every, handle });
        }
    }

    fn spawn_loop(self: &Arc<Self>, key: String, every: Duration) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                let Some(cluster) = monitor.registry.snapshot().get(&key) else {
                    tracing::debug!(cluster = %key, "cluster removed; stopping probe loop");
                    break;
                };
                monitor.check(&cluster).await;
            }
        })
    }

    fn loop_count(&self) -> usize {
        self.loops.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Stops the probe loops and closes the probe sessions.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_tasks();
        self.pool.shutdown().await;
    }

    fn stop_tasks(&self) {
        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(|p| p.into_inner()));
        for probe in loops.into_values() {
            probe.handle.abort();
        }
    }

    async fn check(&self, cluster: &Arc<ClusterConfig>) {
        let health = self.probe(cluster).await;
        match health.status {
            HealthStatus::Unhealthy => tracing::warn!(
                cluster = %health.cluster,
                reachable = health.reachable,
                scheduler_ok = health.scheduler_ok,
                detail = health.detail.as_deref().unwrap_or(""),
                "cluster unhealthy"
            ),
            _ => tracing::debug!(cluster = %health.cluster, status = ?health.status, "probe finished"),
        }
        self.state
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(cluster.key(), Arc::new(health));
    }

    /// Probes one cluster. Failures are folded into the returned value.
    #[tracing::instrument(
        name = "health",
        level = "debug",
        skip(self, cluster),
        fields(cluster = %cluster.name)
    )]
    pub async fn probe(&self, cluster: &Arc<ClusterConfig>) -> ClusterHealth {
        let mut health = ClusterHealth {
            cluster: cluster.name.clone(),
            status: HealthStatus::Skip,
            reachable: false,
            scheduler_ok: false,
            last_checked: self.clock.now_utc(),
            latency_ms: None,
            detail: None,
        };
        if !cluster.probing.enabled {
            return health;
        }
        let Some(username) = cluster.probing.username.clone() else {
            health.status = HealthStatus::Unhealthy;
            health.detail = Some("no probing user configured".to_string());
            return health;
        };

        let started = Instant::now();
        let budget = cluster.probing.timeout;
        let outcome = tokio::time::timeout(budget, self.run_checks(cluster, Identity::new(username)))
            .await
            .unwrap_or_else(|_| Checks {
                reachable: false,
                scheduler_ok: false,
                detail: Some(format!("probe exceeded {}s", budget.as_secs())),
            });

        health.last_checked = self.clock.now_utc();
        health.latency_ms = Some(started.elapsed().as_millis() as u64);
        health.reachable = outcome.reachable;
        health.scheduler_ok = outcome.scheduler_ok;
        health.status = if outcome.reachable && outcome.scheduler_ok && outcome.detail.is_none() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        health.detail = outcome.detail;
        health
    }

    async fn run_checks(&self, cluster: &Arc<ClusterConfig>, identity: Identity) -> Checks {
        let runner: Arc<dyn CommandRunner> = Arc::new(ClusterRunner::new(
            self.pool.clone(),
            self.executor.clone(),
            cluster.clone(),
            identity.clone(),
            cluster.probing.timeout,
        ));
        let mut checks = Checks {
            reachable: false,
            scheduler_ok: false,
            detail: None,
        };

        let liveness = ExecutionRequest::new(liveness_command(cluster))
            .with_timeout(cluster.probing.timeout);
        match runner.run(liveness).await {
            Ok(result) if result.success() => checks.reachable = true,
            Ok(result) if result.exit_code == MISSING_FS_EXIT => {
                checks.reachable = true;
                checks.detail = Some(format!(
                    "filesystem not available: {}",
                    result.stdout.trim()
                ));
            }
            Ok(result) => {
                checks.reachable = true;
                checks.detail = Some(describe(&AppError::command_failed(
                    result.exit_code,
                    result.stderr,
                )));
            }
            Err(err) => {
                checks.detail = Some(describe(&err));
                return checks;
            }
        }

        let ctx = AdapterContext {
            cluster: cluster.clone(),
            identity,
            runner,
            clock: self.clock.clone(),
        };
        let ping = match build_adapter(ctx, self.rest.clone()) {
            Ok(adapter) => adapter.ping().await,
            Err(err) => Err(err),
        };
        match ping {
            Ok(()) => checks.scheduler_ok = true,
            Err(err) => {
                let scheduler = format!("scheduler: {}", describe(&err));
                checks.detail = Some(match checks.detail.take() {
                    Some(previous) => format!("{previous}; {scheduler}"),
                    None => scheduler,
                });
            }
        }
        checks
    }
}

struct Checks {
    reachable: bool,
    scheduler_ok: bool,
    detail: Option<String>,
}

fn describe(err: &AppError) -> String {
    match err.kind() {
        AppErrorKind::CommandFailed => err.message().to_string(),
        _ => format!("{}: {}", err.code(), err.message()),
    }
}

/// `true`, or a loop printing the first configured filesystem that is not a
/// directory.
fn liveness_command(cluster: &ClusterConfig) -> String {
    if cluster.file_systems.is_empty() {
        return "true".to_string();
    }
    let paths = sh_join(cluster.file_systems.iter().map(|fs| fs.path.as_str()));
    format!(
        "for p in {paths}; do test -d \"$p\" || {{ printf '%s\\n' \"$p\"; exit {MISSING_FS_EXIT}; }}; done"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::errors::codes;
    use crate::app::registry::ClusterSet;
    use crate::app::test_support::{FakeConnector, FakeHost, FakeProgram, FixedClock, cluster};
    use crate::app::types::FileSystemSettings;
    use time::macros::datetime;

    fn monitor(clusters: Vec<ClusterConfig>, connector: Arc<FakeConnector>) -> Arc<HealthMonitor> {
        let registry = Arc::new(ClusterRegistry::new(ClusterSet::new(clusters).unwrap()));
        Arc::new(HealthMonitor::new(
            registry,
            connector,
            Arc::new(CommandExecutor::default()),
            Arc::new(FixedClock::new(datetime!(2024-03-10 12:00:00 UTC))),
            None,
        ))
    }

    fn slurm_host(ping: &'static str, ping_exit: i32) -> Arc<FakeHost> {
        FakeHost::new(move |command| {
            if command.contains("scontrol ping") {
                FakeProgram {
                    exit: ping_exit,
                    ..FakeProgram::quick(ping)
                }
            } else {
                FakeProgram::quick("")
            }
        })
    }

    #[tokio::test]
    async fn disabled_cluster_reports_skip_every_cycle() {
        let mut config = cluster("quiet");
        config.probing.enabled = false;
        let connector = FakeConnector::quick();
        let monitor = monitor(vec![config], connector.clone());

        for _ in 0..3 {
            monitor.run_once().await;
            let health = monitor.get("QUIET").unwrap();
            assert_eq!(health.status, HealthStatus::Skip);
            assert!(!health.reachable);
        }
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn healthy_cluster_checks_filesystems_and_scheduler() {
        let mut config = cluster("alps");
        config.file_systems.push(FileSystemSettings {
            path: "/scratch".into(),
            data_type: "scratch".into(),
            default_work_dir: true,
        });
        let host = slurm_host("Slurmctld(primary) at ctl is UP\n", 0);
        let connector = FakeConnector::new(host.clone());
        let monitor = monitor(vec![config], connector.clone());

        monitor.run_once().await;
        monitor.run_once().await;
        let health = monitor.get("alps").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.reachable && health.scheduler_ok);
        assert!(health.latency_ms.is_some());
        assert_eq!(health.detail, None);
        assert!(host.commands().iter().any(|c| c.contains("test -d")));
        // The dedicated pool keeps a single session per cluster.
        assert_eq!(connector.connects(), 1);
        let stats = monitor
            .pool()
            .stats(&cluster("alps"), &Identity::new("probe"))
            .unwrap();
        assert_eq!((stats.capacity, stats.idle), (1, 1));
    }

    #[tokio::test]
    async fn unreachable_cluster_is_unhealthy_without_failing() {
        let connector = FakeConnector::quick();
        connector.fail_with(Some(AppError::with_message(
            AppErrorKind::ConnectFailed,
            codes::CONNECT_FAILED,
            "connection refused",
        )));
        let monitor = monitor(vec![cluster("alps")], connector);

        monitor.run_once().await;
        let health = monitor.get("alps").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.reachable);
        assert!(health.detail.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn scheduler_down_is_reported_separately() {
        let connector = FakeConnector::new(slurm_host("", 1));
        let monitor = monitor(vec![cluster("alps")], connector);

        monitor.run_once().await;
        let health = monitor.get("alps").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.reachable);
        assert!(!health.scheduler_ok);
        assert!(health.detail.as_deref().unwrap().starts_with("scheduler:"));
    }

    #[tokio::test]
    async fn missing_filesystem_is_named() {
        let mut config = cluster("alps");
        config.file_systems.push(FileSystemSettings {
            path: "/capstor".into(),
            data_type: "store".into(),
            default_work_dir: false,
        });
        let host = FakeHost::new(|command| {
            if command.contains("test -d") {
                FakeProgram {
                    exit: MISSING_FS_EXIT,
                    ..FakeProgram::quick("/capstor\n")
                }
            } else {
                FakeProgram::quick("Slurmctld(primary) at ctl is UP\n")
            }
        });
        let monitor = monitor(vec![config], FakeConnector::new(host));

        monitor.run_once().await;
        let health = monitor.get("alps").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.reachable && health.scheduler_ok);
        assert_eq!(
            health.detail.as_deref(),
            Some("filesystem not available: /capstor")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_bounded_by_probing_timeout() {
        let mut config = cluster("alps");
        config.probing.timeout = Duration::from_secs(2);
        let host = FakeHost::new(|command| {
            if command.contains("scontrol ping") {
                FakeProgram::sleeping(Duration::from_secs(30))
            } else {
                FakeProgram::quick("")
            }
        });
        let monitor = monitor(vec![config], FakeConnector::new(host));

        let started = Instant::now();
        monitor.run_once().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        let health = monitor.get("alps").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.scheduler_ok);
    }

    #[tokio::test(start_paused = true)]
    async fn background_loops_probe_every_cluster() {
        let mut quiet = cluster("quiet");
        quiet.probing.enabled = false;
        let connector = FakeConnector::new(slurm_host("Slurmctld(primary) at ctl is UP\n", 0));
        let monitor = monitor(vec![cluster("alps"), quiet], connector);

        monitor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let statuses: Vec<HealthStatus> =
            monitor.snapshot().iter().map(|health| health.status).collect();
        assert_eq!(statuses, [HealthStatus::Healthy, HealthStatus::Skip]);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_follows_the_registry() {
        let connector = FakeConnector::new(slurm_host("Slurmctld(primary) at ctl is UP\n", 0));
        let monitor = monitor(vec![cluster("alps")], connector);

        monitor.reconcile();
        assert_eq!(monitor.loop_count(), 0);

        monitor.start();
        assert_eq!(monitor.loop_count(), 1);
        monitor
            .registry
            .replace(ClusterSet::new(vec![cluster("eiger"), cluster("daint")]).unwrap());
        monitor.reconcile();
        assert_eq!(monitor.loop_count(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.get("eiger").unwrap().status, HealthStatus::Healthy);
        assert_eq!(monitor.get("daint").unwrap().status, HealthStatus::Healthy);

        monitor.stop().await;
        assert_eq!(monitor.loop_count(), 0);
    }

    #[test]
    fn liveness_command_quotes_paths() {
        let mut config = cluster("alps");
        assert_eq!(liveness_command(&config), "true");
        config.file_systems.push(FileSystemSettings {
            path: "/home/it's".into(),
            data_type: "users".into(),
            default_work_dir: false,
        });
        assert!(liveness_command(&config).starts_with(r"for p in '/home/it'\''s'; do test -d"));
    }
}
