// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use anyhow::Result;
use russh::client::AuthResult;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};

use crate::adapters::ssh::AuthenticationFailure;

use super::ClientHandler;

#[derive(Debug, PartialEq, Eq)]
enum AuthDecision {
    Success,
    /// The key was accepted but the server wants another factor we cannot supply.
    NeedsSecondFactor,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            partial_success: true,
            ..
        } => AuthDecision::NeedsSecondFactor,
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

pub(in crate::adapters::ssh) async fn authenticate(
    handle: &mut russh::client::Handle<ClientHandler>,
    username: &str,
    key: Arc<PrivateKey>,
) -> Result<()> {
    // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
    let key = PrivateKeyWithHashAlg::new(key, handle.best_supported_rsa_hash().await?.flatten());
    let result = handle.authenticate_publickey(username, key).await?;
    match auth_decision(result) {
        AuthDecision::Success => Ok(()),
        AuthDecision::NeedsSecondFactor => Err(AuthenticationFailure(format!(
            "{username}: server requires an additional authentication factor"
        ))
        .into()),
        AuthDecision::Failure => {
            Err(AuthenticationFailure(format!("{username}: public key rejected")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthDecision, auth_decision};
    use russh::client::AuthResult;
    use russh::{MethodKind, MethodSet};

    #[test]
    fn auth_decision_success() {
        assert_eq!(auth_decision(AuthResult::Success), AuthDecision::Success);
    }

    #[test]
    fn partial_success_needs_another_factor() {
        let methods = [MethodKind::KeyboardInteractive];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: true,
        });
        assert_eq!(decision, AuthDecision::NeedsSecondFactor);
    }

    #[test]
    fn rejected_key_is_a_failure() {
        let methods = [MethodKind::PublicKey, MethodKind::KeyboardInteractive];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: false,
        });
        assert_eq!(decision, AuthDecision::Failure);
    }
}
