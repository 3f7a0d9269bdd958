// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{RestMethod, RestRequest, RestResponse, SlurmRestTransport};
use crate::app::types::{ClusterConfig, Identity};

const USER_AGENT: &str = concat!("hpcgated/", env!("CARGO_PKG_VERSION"));
const USER_NAME_HEADER: &str = "X-SLURM-USER-NAME";
const USER_TOKEN_HEADER: &str = "X-SLURM-USER-TOKEN";

/// slurmrestd client. Authenticates each request as the caller through the
/// slurmrestd user name and token headers.
#[derive(Clone)]
pub struct ReqwestSlurmTransport {
    client: Client,
}

impl std::fmt::Debug for ReqwestSlurmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestSlurmTransport").finish_non_exhaustive()
    }
}

impl ReqwestSlurmTransport {
    pub fn new(connect_timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| {
                AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    format!("failed to build http client: {err}"),
                )
            })?;
        Ok(Self { client })
    }
}

fn endpoint(cluster: &ClusterConfig, path: &str) -> AppResult<String> {
    let base = cluster.scheduler.api_url.as_deref().ok_or_else(|| {
        AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("cluster {} has no scheduler api_url", cluster.name),
        )
    })?;
    Ok(format!("{}{}", base.trim_end_matches('/'), path))
}

fn map_send_error(cluster: &ClusterConfig, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::with_message(
            AppErrorKind::ConnectFailed,
            codes::NETWORK_ERROR,
            format!(
                "slurmrestd on {} did not answer within {}s",
                cluster.name,
                cluster.scheduler.timeout.as_secs()
            ),
        )
    } else if err.is_connect() || err.is_request() {
        AppError::with_message(
            AppErrorKind::ConnectFailed,
            codes::NETWORK_ERROR,
            format!("slurmrestd on {} unreachable: {err}", cluster.name),
        )
    } else {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::REMOTE_ERROR,
            format!("slurmrestd request on {} failed: {err}", cluster.name),
        )
    }
}

/// Non-JSON bodies (proxies, HTML error pages) become `{"error": <text>}`.
fn body_value(text: &str) -> serde_json::Value {
    if text.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::json!({ "error": text.trim() }))
}

#[async_trait]
impl SlurmRestTransport for ReqwestSlurmTransport {
    #[tracing::instrument(
        name = "slurmrestd",
        level = "debug",
        skip(self, cluster, identity, request),
        fields(cluster = %cluster.name, user = %identity.username, method = ?request.method, path = %request.path)
    )]
    async fn send(
        &self,
        cluster: &ClusterConfig,
        identity: &Identity,
        request: RestRequest,
    ) -> AppResult<RestResponse> {
        let url = endpoint(cluster, &request.path)?;
        let builder = match request.method {
            RestMethod::Get => self.client.get(&url),
            RestMethod::Post => self.client.post(&url),
            RestMethod::Delete => self.client.delete(&url),
        };
        let mut builder = builder
            .timeout(cluster.scheduler.timeout)
            .header(USER_NAME_HEADER, &identity.username)
            .query(&request.query);
        if let Some(token) = &identity.access_token {
            builder = builder.header(USER_TOKEN_HEADER, token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| map_send_error(cluster, err))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| map_send_error(cluster, err))?;
        tracing::debug!(status, bytes = text.len(), "slurmrestd responded");
        Ok(RestResponse {
            status,
            body: body_value(&text),
        })
    }
}
