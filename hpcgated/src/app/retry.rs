// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::runner::CommandRunner;
use crate::app::types::{ExecutionRequest, ExecutionResult};

/// Exponential backoff with jitter. Only transient errors are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), with up to 20% jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = rand::rng().random_range(0.8..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.run_while(op, AppError::is_transient).await
    }

    /// Like `run`, retrying only the errors `retryable` accepts.
    pub async fn run_while<T, F, Fut, P>(&self, mut op: F, retryable: P) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        P: Fn(&AppError) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) && retry + 1 < attempts => {
                    let delay = self.backoff(retry);
                    tracing::debug!(
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code(),
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Whether a failed command never reached the remote shell. A timeout or a
/// dropped channel may follow a started command, so only pool exhaustion and
/// connection setup failures qualify.
pub fn never_started(err: &AppError) -> bool {
    match err.kind() {
        AppErrorKind::PoolExhausted => true,
        AppErrorKind::ConnectFailed => err.code() != codes::CHANNEL_LOST,
        _ => false,
    }
}

/// Opt-in wrapper that retries a runner's transient failures. Requests with
/// side effects are retried only when the command never started.
pub struct RetryingRunner<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R> RetryingRunner<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<R: CommandRunner> CommandRunner for RetryingRunner<R> {
    async fn run(&self, request: ExecutionRequest) -> AppResult<ExecutionResult> {
        let side_effects = request.side_effects;
        self.policy
            .run_while(
                || self.inner.run(request.clone()),
                |err| err.is_transient() && (!side_effects || never_started(err)),
            )
            .await
    }
}
