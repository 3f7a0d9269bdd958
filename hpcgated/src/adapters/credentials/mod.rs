// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{CredentialsPort, SshCredential};
use crate::app::types::Identity;

/// Keys loaded from the daemon configuration, one per remote user name.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    keys: HashMap<String, SshCredential>,
}

impl StaticKeyStore {
    pub fn new(keys: HashMap<String, SshCredential>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl CredentialsPort for StaticKeyStore {
    fn ssh_credential(&self, identity: &Identity) -> AppResult<SshCredential> {
        self.keys.get(&identity.username).cloned().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::AuthenticationFailed,
                codes::AUTHENTICATION_FAILED,
                format!("no ssh credentials configured for {}", identity.username),
            )
        })
    }
}
