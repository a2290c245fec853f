//! reqwest-backed route executor

use super::{BackendError, ResolvedTarget, RouteExecutor};
use crate::http::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, HOST};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct RouteClientConfig {
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// How long idle pooled connections are kept, in seconds
    pub pool_idle_timeout_secs: u64,

    pub user_agent: Option<String>,
}

impl Default for RouteClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            user_agent: None,
        }
    }
}

impl RouteClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = Some(user_agent);
        self
    }
}

/// Sends step requests over HTTP with a pooled client
#[derive(Debug, Clone)]
pub struct HttpRouteExecutor {
    client: reqwest::Client,
}

impl HttpRouteExecutor {
    pub fn new(config: RouteClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs));
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl RouteExecutor for HttpRouteExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
        target: &ResolvedTarget,
    ) -> Result<HttpResponse, BackendError> {
        let url = target.outbound_url(&request)?;
        let method = target.method.clone().unwrap_or(request.method);

        let mut headers = request.headers;
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        debug!("{} {} ({})", method, url, target.name);

        let send = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body)
            .timeout(target.timeout)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            result = send => result.map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(target.timeout.as_secs())
                } else {
                    BackendError::from(e)
                }
            })?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(HttpResponse::new(status, headers, body))
    }
}
