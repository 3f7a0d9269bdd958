// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};
use time::UtcOffset;
use time::macros::format_description;

use crate::app::ports::{SshCredential, SshKey};
use crate::app::types::{
    ClusterConfig, FileSystemSettings, ProbingSettings, SchedulerKind, SchedulerSettings,
    SshSettings, SshTimeouts,
};

const APP_DIR_NAME: &str = "hpcgate";
const CONFIG_FILE_NAME: &str = "hpcgate.toml";
const CONFIG_ENV_VAR: &str = "HPCGATE_CONFIG_PATH";
const SECRET_FILE_PREFIX: &str = "secret_file:";
const DEFAULT_COMMAND_TIMEOUT_CEILING_SECS: u64 = 300;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 15;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_MAX_CLIENTS: usize = 100;
const DEFAULT_SLURM_API_VERSION: &str = "v0.0.40";
const DEFAULT_SCHEDULER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROBING_INTERVAL_SECS: u64 = 60;
const DEFAULT_PROBING_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    command_timeout_ceiling_secs: Option<u64>,
    acquire_timeout_secs: Option<u64>,
    reaper_interval_secs: Option<u64>,
    max_output_bytes: Option<usize>,
    known_hosts_path: Option<String>,
    verbose: Option<bool>,
    #[serde(default)]
    ssh_credentials: BTreeMap<String, FileCredential>,
    #[serde(default)]
    clusters: Vec<FileCluster>,
}

#[derive(Debug, Deserialize)]
struct FileCredential {
    /// Key path, inline OpenSSH/PEM text, or `secret_file:<path>`.
    private_key: String,
    passphrase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileCluster {
    name: String,
    timezone: Option<String>,
    ssh: FileSsh,
    scheduler: FileScheduler,
    probing: Option<FileProbing>,
    #[serde(default)]
    file_systems: Vec<FileFileSystem>,
}

#[derive(Debug, Deserialize)]
struct FileSsh {
    host: Option<String>,
    #[serde(default)]
    hosts: Vec<String>,
    port: Option<u16>,
    max_clients: Option<usize>,
    #[serde(default)]
    timeout: FileSshTimeouts,
}

#[derive(Debug, Default, Deserialize)]
struct FileSshTimeouts {
    connection: Option<u64>,
    login: Option<u64>,
    command_execution: Option<u64>,
    idle_timeout: Option<u64>,
    keep_alive: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileScheduler {
    #[serde(rename = "type")]
    kind: String,
    version: Option<String>,
    api_url: Option<String>,
    api_version: Option<String>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileProbing {
    enabled: Option<bool>,
    interval: Option<u64>,
    timeout: Option<u64>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileFileSystem {
    path: String,
    data_type: Option<String>,
    #[serde(default)]
    default_work_dir: bool,
}

#[derive(Debug)]
pub struct Config {
    pub command_timeout_ceiling: Duration,
    pub acquire_timeout: Duration,
    pub reaper_interval: Duration,
    pub max_output_bytes: usize,
    pub known_hosts_path: Option<PathBuf>,
    pub verbose: bool,
    pub credentials: HashMap<String, SshCredential>,
    pub clusters: Vec<ClusterConfig>,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub command_timeout_ceiling_secs: ConfigValue<u64>,
    pub acquire_timeout_secs: ConfigValue<u64>,
    pub reaper_interval_secs: ConfigValue<u64>,
    pub max_output_bytes: ConfigValue<usize>,
    pub verbose: ConfigValue<bool>,
    pub cluster_names: Vec<String>,
    pub credential_users: Vec<String>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub command_timeout_ceiling_secs: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub verbose: Option<bool>,
}

fn pick<T>(
    override_value: Option<T>,
    file_value: Option<T>,
    default: T,
) -> (T, ConfigSource) {
    match (override_value, file_value) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default, ConfigSource::Default),
    }
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (ceiling_secs, ceiling_source) = pick(
        overrides.command_timeout_ceiling_secs,
        file_config.command_timeout_ceiling_secs,
        DEFAULT_COMMAND_TIMEOUT_CEILING_SECS,
    );
    if ceiling_secs == 0 {
        anyhow::bail!("command_timeout_ceiling_secs must be greater than zero");
    }
    let (acquire_secs, acquire_source) = pick(
        overrides.acquire_timeout_secs,
        file_config.acquire_timeout_secs,
        DEFAULT_ACQUIRE_TIMEOUT_SECS,
    );
    let (reaper_secs, reaper_source) = pick(
        None,
        file_config.reaper_interval_secs,
        DEFAULT_REAPER_INTERVAL_SECS,
    );
    if reaper_secs == 0 {
        anyhow::bail!("reaper_interval_secs must be greater than zero");
    }
    let (max_output_bytes, max_output_source) = pick(
        None,
        file_config.max_output_bytes,
        DEFAULT_MAX_OUTPUT_BYTES,
    );
    let (verbose, verbose_source) = pick(overrides.verbose, file_config.verbose, false);

    let mut credentials = HashMap::new();
    for (user, raw) in file_config.ssh_credentials {
        let credential = credential_from_file(raw, base_dir)
            .with_context(|| format!("invalid ssh_credentials.{user}"))?;
        credentials.insert(user, credential);
    }

    let mut clusters = Vec::with_capacity(file_config.clusters.len());
    for raw in file_config.clusters {
        let name = raw.name.clone();
        clusters.push(cluster_from_file(raw).with_context(|| format!("invalid cluster {name}"))?);
    }

    let config = Config {
        command_timeout_ceiling: Duration::from_secs(ceiling_secs),
        acquire_timeout: Duration::from_secs(acquire_secs),
        reaper_interval: Duration::from_secs(reaper_secs),
        max_output_bytes,
        known_hosts_path: file_config
            .known_hosts_path
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
        verbose,
        credentials,
        clusters,
        config_path: config_path.clone(),
    };

    let mut credential_users: Vec<String> = config.credentials.keys().cloned().collect();
    credential_users.sort();
    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        command_timeout_ceiling_secs: ConfigValue {
            value: ceiling_secs,
            source: ceiling_source,
        },
        acquire_timeout_secs: ConfigValue {
            value: acquire_secs,
            source: acquire_source,
        },
        reaper_interval_secs: ConfigValue {
            value: reaper_secs,
            source: reaper_source,
        },
        max_output_bytes: ConfigValue {
            value: max_output_bytes,
            source: max_output_source,
        },
        verbose: ConfigValue {
            value: verbose,
            source: verbose_source,
        },
        cluster_names: config.clusters.iter().map(|c| c.name.clone()).collect(),
        credential_users,
    };

    Ok(LoadResult { config, report })
}

fn cluster_from_file(raw: FileCluster) -> Result<ClusterConfig> {
    let mut hosts = raw.ssh.hosts;
    if let Some(host) = raw.ssh.host {
        hosts.insert(0, host);
    }
    hosts.retain(|host| !host.trim().is_empty());
    if hosts.is_empty() {
        anyhow::bail!("ssh.host or ssh.hosts is required");
    }
    let max_clients = raw.ssh.max_clients.unwrap_or(DEFAULT_MAX_CLIENTS);
    if max_clients == 0 {
        anyhow::bail!("ssh.max_clients must be greater than zero");
    }

    let defaults = SshTimeouts::default();
    let secs = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);
    let timeouts = SshTimeouts {
        connection: secs(raw.ssh.timeout.connection, defaults.connection),
        login: secs(raw.ssh.timeout.login, defaults.login),
        command_execution: secs(raw.ssh.timeout.command_execution, defaults.command_execution),
        idle_timeout: secs(raw.ssh.timeout.idle_timeout, defaults.idle_timeout),
        keep_alive: secs(raw.ssh.timeout.keep_alive, defaults.keep_alive),
    };

    let api_url = raw
        .scheduler
        .api_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    let kind = match raw.scheduler.kind.trim().to_ascii_lowercase().as_str() {
        "slurm" if api_url.is_some() => SchedulerKind::SlurmRest,
        "slurm" => SchedulerKind::SlurmCli,
        "pbs" | "openpbs" => SchedulerKind::OpenPbs,
        other => anyhow::bail!("unsupported scheduler type {other:?} (expected slurm or pbs)"),
    };
    let scheduler = SchedulerSettings {
        kind,
        version: raw.scheduler.version,
        api_url,
        api_version: raw
            .scheduler
            .api_version
            .unwrap_or_else(|| DEFAULT_SLURM_API_VERSION.to_string()),
        timeout: Duration::from_secs(
            raw.scheduler
                .timeout
                .unwrap_or(DEFAULT_SCHEDULER_TIMEOUT_SECS),
        ),
    };

    // A cluster without a probing section is not monitored.
    let probing = match raw.probing {
        Some(probing) => ProbingSettings {
            enabled: probing.enabled.unwrap_or(true),
            interval: Duration::from_secs(
                probing.interval.unwrap_or(DEFAULT_PROBING_INTERVAL_SECS).max(1),
            ),
            timeout: Duration::from_secs(
                probing.timeout.unwrap_or(DEFAULT_PROBING_TIMEOUT_SECS).max(1),
            ),
            username: probing.username.filter(|user| !user.trim().is_empty()),
        },
        None => ProbingSettings {
            enabled: false,
            interval: Duration::from_secs(DEFAULT_PROBING_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_PROBING_TIMEOUT_SECS),
            username: None,
        },
    };

    let file_systems = raw
        .file_systems
        .into_iter()
        .map(|fs| FileSystemSettings {
            path: fs.path,
            data_type: fs.data_type.unwrap_or_else(|| "scratch".to_string()),
            default_work_dir: fs.default_work_dir,
        })
        .collect();

    let timezone = match raw.timezone.as_deref() {
        Some(raw) => parse_timezone(raw)?,
        None => UtcOffset::UTC,
    };

    Ok(ClusterConfig {
        name: raw.name.trim().to_string(),
        ssh: SshSettings {
            hosts,
            port: raw.ssh.port.unwrap_or(DEFAULT_SSH_PORT),
            max_clients,
            timeouts,
        },
        scheduler,
        probing,
        file_systems,
        timezone,
    })
}

/// Accepts `UTC`, `Z` or a fixed offset such as `+01:00`.
fn parse_timezone(raw: &str) -> Result<UtcOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return Ok(UtcOffset::UTC);
    }
    let format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(trimmed, format)
        .with_context(|| format!("timezone {raw:?} is not UTC or a fixed offset like +01:00"))
}

fn credential_from_file(raw: FileCredential, base_dir: Option<&Path>) -> Result<SshCredential> {
    let key = raw.private_key.trim();
    let private_key = if let Some(path) = key.strip_prefix(SECRET_FILE_PREFIX) {
        SshKey::File(resolve_path(path.trim(), base_dir))
    } else if key.starts_with("-----BEGIN") {
        SshKey::Inline(format!("{key}\n"))
    } else if key.is_empty() {
        anyhow::bail!("private_key is empty");
    } else {
        SshKey::File(resolve_path(key, base_dir))
    };
    let passphrase = match raw.passphrase {
        Some(value) => Some(read_secret(&value, base_dir)?),
        None => None,
    };
    Ok(SshCredential {
        private_key,
        passphrase,
    })
}

/// Resolves `secret_file:<path>` to the file's trimmed contents.
fn read_secret(value: &str, base_dir: Option<&Path>) -> Result<String> {
    match value.strip_prefix(SECRET_FILE_PREFIX) {
        Some(path) => {
            let path = resolve_path(path.trim(), base_dir);
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("secret file {} not readable", path.display()))?;
            Ok(contents.trim().to_string())
        }
        None => Ok(value.to_string()),
    }
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}
