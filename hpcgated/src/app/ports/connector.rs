// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::ports::RemoteSession;
use crate::app::types::{ClusterConfig, Identity};

#[async_trait]
/// Opens authenticated sessions to a cluster's login nodes.
/// Must report `AuthenticationFailed` and `ConnectFailed` distinctly.
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        cluster: &ClusterConfig,
        identity: &Identity,
    ) -> AppResult<Arc<dyn RemoteSession>>;
}
