//! Backend calls for route, query-proxy and literal-API steps

pub mod client;
pub mod response;

pub use client::{HttpRouteExecutor, RouteClientConfig};
pub use response::BackendError;

use crate::core::condition::OnErrorPolicy;
use crate::core::config::{QueryOutput, RouteConfig};
use crate::core::error::ExecutionError;
use crate::core::pipeline::PipelineRegistry;
use crate::core::step::{Step, StepTarget};
use crate::http::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use http::Method;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Trait for backend execution - allows for different transports
///
/// A response with an error status is still `Ok`; the caller applies the
/// route's error policy.
#[async_trait]
pub trait RouteExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
        target: &ResolvedTarget,
    ) -> Result<HttpResponse, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Route,
    QueryProxy,
    LiteralApi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHost {
    pub host: String,
    pub weight: u32,
}

/// Where and how a step's outbound request is sent
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    /// Route or query name, or the literal URL
    pub name: String,
    pub kind: TargetKind,
    pub hosts: Vec<TargetHost>,
    pub method: Option<Method>,
    pub path: String,
    /// Query parameters added on top of the request's own
    pub params: BTreeMap<String, String>,
    pub on_error: OnErrorPolicy,
    pub timeout: Duration,
}

fn parse_method(method: Option<&str>) -> Result<Option<Method>, ExecutionError> {
    method
        .filter(|m| !m.is_empty())
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| ExecutionError::Validation(format!("invalid method '{}'", m)))
        })
        .transpose()
}

impl ResolvedTarget {
    /// Resolve a step's target; `None` for nested-pipeline steps
    pub fn for_step(
        step: &Step,
        registry: &PipelineRegistry,
    ) -> Result<Option<Self>, ExecutionError> {
        let settings = registry.settings();
        let default_timeout = step.timeout_secs.unwrap_or(settings.default_timeout_secs);

        let target = match &step.target {
            StepTarget::Pipeline { .. } => return Ok(None),
            StepTarget::Route { route_name, path } => {
                let route: &RouteConfig = registry.route(route_name).ok_or_else(|| {
                    ExecutionError::Validation(format!("unknown route '{}'", route_name))
                })?;
                ResolvedTarget {
                    name: route_name.clone(),
                    kind: TargetKind::Route,
                    hosts: route
                        .target_hosts
                        .iter()
                        .map(|h| TargetHost {
                            host: h.host.clone(),
                            weight: h.weight,
                        })
                        .collect(),
                    method: parse_method(route.method.as_deref())?,
                    path: path
                        .clone()
                        .or_else(|| route.path.clone())
                        .unwrap_or_else(|| "/".to_string()),
                    params: BTreeMap::new(),
                    on_error: route.on_error,
                    timeout: Duration::from_secs(
                        step.timeout_secs
                            .or(route.timeout_secs)
                            .unwrap_or(settings.default_timeout_secs),
                    ),
                }
            }
            StepTarget::QueryProxy { query_name, output } => {
                let host = settings.query_host.clone().ok_or_else(|| {
                    ExecutionError::Validation(format!(
                        "query '{}' needs settings.query_host",
                        query_name
                    ))
                })?;
                let output = match output {
                    QueryOutput::Json => "json",
                    QueryOutput::Csv => "csv",
                };
                ResolvedTarget {
                    name: query_name.clone(),
                    kind: TargetKind::QueryProxy,
                    hosts: vec![TargetHost { host, weight: 1 }],
                    method: Some(Method::POST),
                    path: format!("/query/{}", query_name),
                    params: BTreeMap::from([("output".to_string(), output.to_string())]),
                    on_error: OnErrorPolicy::Stop,
                    timeout: Duration::from_secs(default_timeout),
                }
            }
            StepTarget::LiteralApi { api } => {
                let url = Url::parse(api).map_err(|e| {
                    ExecutionError::Validation(format!("invalid api url '{}': {}", api, e))
                })?;
                let host = url[..url::Position::BeforePath].to_string();
                ResolvedTarget {
                    name: api.clone(),
                    kind: TargetKind::LiteralApi,
                    hosts: vec![TargetHost { host, weight: 1 }],
                    method: None,
                    path: url.path().to_string(),
                    params: url.query_pairs().into_owned().collect(),
                    on_error: OnErrorPolicy::Stop,
                    timeout: Duration::from_secs(default_timeout),
                }
            }
        };

        Ok(Some(target))
    }

    /// Replace the host list with a single host
    pub fn set_host(&mut self, host: &str) {
        self.hosts = vec![TargetHost {
            host: host.to_string(),
            weight: 1,
        }];
    }

    /// Pick a host, weighted
    pub fn select_host(&self) -> Option<&str> {
        let total: u32 = self.hosts.iter().map(|h| h.weight.max(1)).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::rng().random_range(0..total);
        for host in &self.hosts {
            let weight = host.weight.max(1);
            if pick < weight {
                return Some(&host.host);
            }
            pick -= weight;
        }
        None
    }

    /// Absolute URL for a request: selected host, target path, merged query
    pub fn outbound_url(&self, request: &HttpRequest) -> Result<Url, BackendError> {
        let host = self
            .select_host()
            .ok_or_else(|| BackendError::NoTarget(self.name.clone()))?;
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let mut url = Url::parse(&format!("{}{}", host.trim_end_matches('/'), path))
            .map_err(|e| BackendError::InvalidUrl(format!("{}{}: {}", host, path, e)))?;

        let mut query = self.params.clone();
        query.extend(request.query_map());
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(query.iter());
        }
        Ok(url)
    }
}
