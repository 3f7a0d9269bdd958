// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const AUTHENTICATION_FAILED: &str = "authentication_failed";
    pub const CONNECT_FAILED: &str = "connect_failed";
    pub const POOL_EXHAUSTED: &str = "pool_exhausted";
    pub const COMMAND_TIMEOUT: &str = "command_timeout";
    pub const COMMAND_FAILED: &str = "command_failed";
    pub const PARSE_FAILED: &str = "parse_failed";
    pub const CANCELLED: &str = "cancelled";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
    /// The exec channel dropped after the command may already have started.
    pub const CHANNEL_LOST: &str = "channel_lost";
    /// An interrupted command whose process group could not be identified.
    pub const PROCESS_UNCONFIRMED: &str = "process_unconfirmed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    AuthenticationFailed,
    ConnectFailed,
    PoolExhausted,
    CommandTimeout,
    CommandFailed,
    ParseFailed,
    Cancelled,
    InvalidArgument,
    NotFound,
    Internal,
}

/// Details of a remote command that ran to completion with a non-zero status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub exit_code: i32,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
    failure: Option<CommandFailure>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
            failure: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
            failure: None,
        }
    }

    pub fn command_failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        let first_line = stderr.lines().next().unwrap_or("").trim();
        let message = if first_line.is_empty() {
            format!("remote command exited with status {exit_code}")
        } else {
            format!("remote command exited with status {exit_code}: {first_line}")
        };
        Self {
            kind: AppErrorKind::CommandFailed,
            code: codes::COMMAND_FAILED,
            message,
            context: None,
            failure: Some(CommandFailure { exit_code, stderr }),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.failure.as_ref().map(|failure| failure.exit_code)
    }

    pub fn stderr(&self) -> Option<&str> {
        self.failure.as_ref().map(|failure| failure.stderr.as_str())
    }

    /// Whether an opt-in retry wrapper may try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::ConnectFailed | AppErrorKind::PoolExhausted | AppErrorKind::CommandTimeout
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;
