// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod errors;
pub mod executor;
pub mod filesystem;
pub mod gateway;
pub mod health;
pub mod pool;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod services;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
