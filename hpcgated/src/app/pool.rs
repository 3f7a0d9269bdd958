// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{Connector, RemoteSession};
use crate::app::types::{ClusterConfig, Identity};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub cluster: String,
    pub username: String,
}

impl PoolKey {
    pub fn new(cluster: &ClusterConfig, identity: &Identity) -> Self {
        Self {
            cluster: cluster.key(),
            username: identity.username.clone(),
        }
    }
}

struct IdleEntry {
    session: Arc<dyn RemoteSession>,
    created_at: Instant,
    last_used: Instant,
}

struct Slot {
    cluster: Arc<ClusterConfig>,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
    retired: AtomicBool,
}

impl Slot {
    fn idle_entries(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleEntry>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_use(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }
}

/// A session on loan from the pool. Holds the key's capacity permit until
/// it is handed back through [`ConnectionPool::release`] or dropped.
pub struct Connection {
    key: PoolKey,
    identity: Identity,
    session: Arc<dyn RemoteSession>,
    slot: Arc<Slot>,
    created_at: Instant,
    last_used: Instant,
    poisoned: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn cluster(&self) -> &Arc<ClusterConfig> {
        &self.slot.cluster
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Marks the session as unfit for reuse; release will close it.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub(crate) fn poison_flag(&self) -> Arc<AtomicBool> {
        self.poisoned.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    /// Fixed per-key capacity; defaults to the cluster's `max_clients`.
    pub capacity: Option<usize>,
    /// Fixed idle retention; defaults to the cluster's idle timeout.
    pub idle_retention: Option<Duration>,
}

/// Sessions keyed by (cluster, identity), bounded per key.
pub struct ConnectionPool {
    name: &'static str,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    slots: Mutex<HashMap<PoolKey, Arc<Slot>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(name: &'static str, connector: Arc<dyn Connector>, settings: PoolSettings) -> Self {
        Self {
            name,
            connector,
            settings,
            slots: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, Arc<Slot>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot_for(&self, key: &PoolKey, cluster: &Arc<ClusterConfig>) -> Arc<Slot> {
        let mut slots = self.slots();
        if let Some(existing) = slots.get(key) {
            if existing.cluster.as_ref() == cluster.as_ref() {
                return existing.clone();
            }
            existing.retired.store(true, Ordering::SeqCst);
            tracing::info!(
                pool = self.name,
                cluster = %key.cluster,
                user = %key.username,
                "cluster configuration changed; retiring pooled sessions"
            );
        }
        let capacity = self
            .settings
            .capacity
            .unwrap_or(cluster.ssh.max_clients)
            .max(1);
        let slot = Arc::new(Slot {
            cluster: cluster.clone(),
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(VecDeque::new()),
            retired: AtomicBool::new(false),
        });
        slots.insert(key.clone(), slot.clone());
        slot
    }

    fn exhausted(key: &PoolKey, message: &str) -> AppError {
        AppError::with_message(AppErrorKind::PoolExhausted, codes::POOL_EXHAUSTED, message)
            .with_context(format!("cluster={} user={}", key.cluster, key.username))
    }

    /// Borrows a session for `identity` on `cluster`, waiting at most
    /// `timeout` for capacity.
    #[tracing::instrument(
        name = "pool",
        level = "debug",
        skip(self, cluster, identity, timeout),
        fields(op = "acquire", pool = self.name, cluster = %cluster.name, user = %identity.username)
    )]
    pub async fn acquire(
        &self,
        cluster: &Arc<ClusterConfig>,
        identity: &Identity,
        timeout: Duration,
    ) -> AppResult<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::exhausted(
                &PoolKey::new(cluster, identity),
                "connection pool is shut down",
            ));
        }
        let key = PoolKey::new(cluster, identity);
        let slot = self.slot_for(&key, cluster);

        let permit = match tokio::time::timeout(timeout, slot.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Self::exhausted(&key, "connection pool is shut down")),
            Err(_) => {
                tracing::warn!(
                    capacity = slot.capacity,
                    waited_ms = timeout.as_millis() as u64,
                    "no pooled session became available"
                );
                return Err(Self::exhausted(
                    &key,
                    &format!(
                        "all {} sessions are in use; timed out after {:?}",
                        slot.capacity, timeout
                    ),
                ));
            }
        };

        loop {
            let entry = slot.idle_entries().pop_back();
            let Some(entry) = entry else {
                break;
            };
            if entry.session.is_closed() {
                tracing::debug!("discarding closed idle session");
                continue;
            }
            tracing::debug!("reusing idle session");
            return Ok(Connection {
                key,
                identity: identity.clone(),
                session: entry.session,
                slot,
                created_at: entry.created_at,
                last_used: Instant::now(),
                poisoned: Arc::new(AtomicBool::new(false)),
                _permit: permit,
            });
        }

        let session = self.connector.connect(&slot.cluster, identity).await?;
        tracing::debug!("opened new session");
        let now = Instant::now();
        Ok(Connection {
            key,
            identity: identity.clone(),
            session,
            slot,
            created_at: now,
            last_used: now,
            poisoned: Arc::new(AtomicBool::new(false)),
            _permit: permit,
        })
    }

    /// Returns a borrowed session. Unhealthy, poisoned, closed or retired
    /// sessions are closed instead of being kept.
    pub async fn release(&self, conn: Connection, healthy: bool) {
        let Connection {
            key,
            session,
            slot,
            created_at,
            poisoned,
            _permit: permit,
            ..
        } = conn;
        let keep = healthy
            && !poisoned.load(Ordering::SeqCst)
            && !session.is_closed()
            && !slot.retired.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst);
        if keep {
            slot.idle_entries().push_back(IdleEntry {
                session,
                created_at,
                last_used: Instant::now(),
            });
            drop(permit);
            return;
        }
        tracing::debug!(
            pool = self.name,
            cluster = %key.cluster,
            user = %key.username,
            healthy,
            "closing released session"
        );
        drop(permit);
        session.close().await;
    }

    /// Closes idle sessions unused for longer than the retention window and
    /// forgets keys left with no sessions. Sessions on loan are never visited.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut slots = self.slots();
            for slot in slots.values() {
                let retention = self
                    .settings
                    .idle_retention
                    .unwrap_or(slot.cluster.ssh.timeouts.idle_timeout);
                let retired = slot.retired.load(Ordering::SeqCst);
                let mut idle = slot.idle_entries();
                let mut kept = VecDeque::with_capacity(idle.len());
                while let Some(entry) = idle.pop_front() {
                    let stale = now.saturating_duration_since(entry.last_used) >= retention;
                    if retired || stale || entry.session.is_closed() {
                        expired.push(entry.session);
                    } else {
                        kept.push_back(entry);
                    }
                }
                *idle = kept;
            }
            // The map holding the only reference means nothing is on loan
            // and no acquire is in flight for the key.
            slots.retain(|_, slot| {
                Arc::strong_count(slot) > 1 || !slot.idle_entries().is_empty()
            });
        }
        let count = expired.len();
        for session in expired {
            session.close().await;
        }
        if count > 0 {
            tracing::debug!(pool = self.name, closed = count, "reaped idle sessions");
        }
        count
    }

    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.reap_idle().await;
            }
        });
        let previous = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stats(&self, cluster: &ClusterConfig, identity: &Identity) -> Option<PoolStats> {
        let slots = self.slots();
        let slot = slots.get(&PoolKey::new(cluster, identity))?;
        Some(PoolStats {
            capacity: slot.capacity,
            in_use: slot.in_use(),
            idle: slot.idle_entries().len(),
        })
    }

    /// Stops the reaper, fails pending acquires and closes idle sessions.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
        let mut sessions = Vec::new();
        for slot in self.slots().values() {
            slot.permits.close();
            sessions.extend(slot.idle_entries().drain(..).map(|entry| entry.session));
        }
        for session in sessions {
            session.close().await;
        }
    }
}
