// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use hpcgate::adapters;
use hpcgate::app::executor::{CommandExecutor, ExecutorSettings};
use hpcgate::app::gateway::{Gateway, GatewaySettings};
use hpcgate::app::health::HealthMonitor;
use hpcgate::app::pool::{ConnectionPool, PoolSettings};
use hpcgate::app::ports::{ClockPort, Connector, SlurmRestTransport};
use hpcgate::app::registry::{ClusterRegistry, ClusterSet};
use hpcgate::config;
use hpcgate::logging;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                path = %path.display(),
                source = source.as_str(),
                present = report.config_file_present,
                "config path"
            );
        }
        (Some(path), None) => {
            tracing::info!(path = %path.display(), present = report.config_file_present, "config path");
        }
        (None, _) => tracing::info!("config path: (none)"),
    }
    tracing::info!(
        value = report.command_timeout_ceiling_secs.value,
        source = report.command_timeout_ceiling_secs.source.as_str(),
        "config command_timeout_ceiling_secs"
    );
    tracing::info!(
        value = report.acquire_timeout_secs.value,
        source = report.acquire_timeout_secs.source.as_str(),
        "config acquire_timeout_secs"
    );
    tracing::info!(
        value = report.reaper_interval_secs.value,
        source = report.reaper_interval_secs.source.as_str(),
        "config reaper_interval_secs"
    );
    tracing::info!(
        value = report.max_output_bytes.value,
        source = report.max_output_bytes.source.as_str(),
        "config max_output_bytes"
    );
    tracing::info!(
        value = report.verbose.value,
        source = report.verbose.source.as_str(),
        "config verbose"
    );
    tracing::info!(
        clusters = ?report.cluster_names,
        credentials = ?report.credential_users,
        "config clusters"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            command_timeout_ceiling_secs: opts.command_timeout_ceiling_secs,
            acquire_timeout_secs: opts.acquire_timeout_secs,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);

    let registry = Arc::new(ClusterRegistry::new(ClusterSet::new(config.clusters)?));
    let credentials = Arc::new(adapters::credentials::StaticKeyStore::new(config.credentials));
    let connector: Arc<dyn Connector> = Arc::new(
        adapters::ssh::SshConnector::new(credentials).with_known_hosts(config.known_hosts_path),
    );
    let clock: Arc<dyn ClockPort> = Arc::new(adapters::time::SystemClock::new());
    let rest: Arc<dyn SlurmRestTransport> =
        Arc::new(adapters::http::ReqwestSlurmTransport::new(HTTP_CONNECT_TIMEOUT)?);
    let executor = Arc::new(CommandExecutor::new(ExecutorSettings {
        timeout_ceiling: config.command_timeout_ceiling,
        max_output_bytes: config.max_output_bytes,
        ..ExecutorSettings::default()
    }));

    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        connector.clone(),
        executor.clone(),
        clock.clone(),
        Some(rest.clone()),
    ));

    if opts.once {
        monitor.run_once().await;
        let snapshot = monitor.snapshot();
        let health: Vec<_> = snapshot.iter().map(|entry| entry.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&health)?);
        monitor.stop().await;
        return Ok(());
    }

    let pool = Arc::new(ConnectionPool::new(
        "requests",
        connector,
        PoolSettings::default(),
    ));
    pool.spawn_reaper(config.reaper_interval);
    monitor.pool().spawn_reaper(config.reaper_interval);
    let gateway = Gateway::new(
        registry.clone(),
        pool,
        executor,
        clock,
        Some(rest),
        GatewaySettings {
            acquire_timeout: config.acquire_timeout,
            retry: None,
        },
    )
    .with_monitor(monitor.clone());

    monitor.start();
    tracing::info!(clusters = registry.snapshot().len(), "hpcgated running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    monitor.stop().await;
    gateway.shutdown().await;
    Ok(())
}
