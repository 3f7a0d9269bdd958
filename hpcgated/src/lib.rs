// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Remote execution and scheduler abstraction layer for an HPC REST gateway.
//!
//! `app` holds the domain: the connection pool, command executor, scheduler
//! adapters, health monitor and filesystem operations, all written against the
//! ports in `app::ports`. `adapters` implements those ports with russh, reqwest
//! and the system clock.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;
