// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::types::{ClusterConfig, cluster_key};

/// One loaded generation of cluster configuration. Never mutated.
#[derive(Debug, Default)]
pub struct ClusterSet {
    by_key: HashMap<String, Arc<ClusterConfig>>,
    ordered: Vec<Arc<ClusterConfig>>,
}

impl ClusterSet {
    pub fn new(clusters: Vec<ClusterConfig>) -> AppResult<Self> {
        let mut by_key = HashMap::with_capacity(clusters.len());
        let mut ordered = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let key = cluster.key();
            if key.is_empty() {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    "cluster name cannot be empty",
                ));
            }
            let cluster = Arc::new(cluster);
            if by_key.insert(key, cluster.clone()).is_some() {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    format!("duplicate cluster name '{}'", cluster.name),
                ));
            }
            ordered.push(cluster);
        }
        Ok(Self { by_key, ordered })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterConfig>> {
        self.by_key.get(&cluster_key(name)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClusterConfig>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Process-wide holder of the current cluster snapshot.
/// Readers always see a whole generation; `replace` swaps it atomically.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    current: RwLock<Arc<ClusterSet>>,
}

impl ClusterRegistry {
    pub fn new(set: ClusterSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterSet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<ClusterConfig>> {
        self.snapshot().get(name).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("unknown cluster '{name}'"),
            )
        })
    }

    /// Installs a new generation and returns the previous one.
    pub fn replace(&self, set: ClusterSet) -> Arc<ClusterSet> {
        let next = Arc::new(set);
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::info!(clusters = next.len(), "cluster configuration replaced");
        std::mem::replace(&mut *guard, next)
    }
}
