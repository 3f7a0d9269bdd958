// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod connector;
pub mod credentials;
pub mod remote_session;
pub mod slurm_rest;

pub use clock::ClockPort;
pub use connector::Connector;
pub use credentials::{CredentialsPort, SshCredential, SshKey};
pub use remote_session::{ChannelEvent, ExecChannel, RemoteSession};
pub use slurm_rest::{RestMethod, RestRequest, RestResponse, SlurmRestTransport};
