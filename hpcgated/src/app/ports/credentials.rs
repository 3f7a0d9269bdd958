// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use crate::app::errors::AppResult;
use crate::app::types::Identity;

/// Where the private key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshKey {
    File(PathBuf),
    /// OpenSSH/PEM text held in memory.
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredential {
    pub private_key: SshKey,
    pub passphrase: Option<String>,
}

/// Resolves the SSH key material used to log in on behalf of an identity.
pub trait CredentialsPort: Send + Sync {
    fn ssh_credential(&self, identity: &Identity) -> AppResult<SshCredential>;
}
