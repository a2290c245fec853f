//! Step domain model

use crate::core::{
    condition::StepCondition,
    config::{KeyValue, QueryOutput, StepConfig},
};
use anyhow::Result;
use std::collections::BTreeMap;

/// The backend a step calls
#[derive(Debug, Clone, PartialEq)]
pub enum StepTarget {
    /// A named route from the project's route table
    Route {
        route_name: String,
        path: Option<String>,
    },
    /// Another pipeline, run inline with this step's scope as parent
    Pipeline { function_name: String },
    /// A named query on the query host
    QueryProxy {
        query_name: String,
        output: QueryOutput,
    },
    /// A literal URL
    LiteralApi { api: String },
}

impl StepTarget {
    fn from_config(config: &StepConfig) -> Result<Self> {
        if let Some(route_name) = &config.route_name {
            return Ok(StepTarget::Route {
                route_name: route_name.clone(),
                path: config.path.clone(),
            });
        }
        if let Some(function_name) = &config.function_name {
            return Ok(StepTarget::Pipeline {
                function_name: function_name.clone(),
            });
        }
        if let Some(query_name) = &config.query_name {
            return Ok(StepTarget::QueryProxy {
                query_name: query_name.clone(),
                output: config.query_output,
            });
        }
        if let Some(api) = &config.api {
            return Ok(StepTarget::LiteralApi { api: api.clone() });
        }
        anyhow::bail!("step has no target")
    }

    /// Name used as the secondary scope key
    pub fn alias(&self) -> Option<&str> {
        match self {
            StepTarget::Route { route_name, .. } => Some(route_name),
            StepTarget::Pipeline { function_name } => Some(function_name),
            StepTarget::QueryProxy { query_name, .. } => Some(query_name),
            StepTarget::LiteralApi { .. } => None,
        }
    }
}

/// Outbound request shaping, applied in a fixed order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestShaping {
    pub headers: Vec<KeyValue>,
    pub params: Vec<KeyValue>,
    pub form_data: Vec<KeyValue>,
    pub file_data: Vec<KeyValue>,
    pub body_template: Option<String>,
    pub target_host: Option<String>,
    pub target_path: Option<String>,
    pub method: Option<String>,
    pub content_type: Option<String>,
    pub remove_headers: Vec<String>,
    pub remove_params: Vec<String>,
    pub remove_form_data: Vec<String>,
}

/// Response shaping applied after the backend answers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseShaping {
    pub headers: Vec<KeyValue>,
    pub body_template: Option<String>,
    pub remove_headers: Vec<String>,
}

/// Deferral to a queue consumer
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncSpec {
    /// Template rendered as the immediate placeholder response
    pub message: String,
    /// Queue to publish to; the default queue when absent
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSpec {
    /// Template that must render to a JSON array
    pub variable: String,
    pub in_parallel: bool,
}

/// A node in a pipeline's step tree
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique within the pipeline
    pub key: String,

    pub condition: Option<StepCondition>,

    /// Milliseconds to wait before running
    pub delay_ms: u64,

    pub async_spec: Option<AsyncSpec>,
    pub loop_spec: Option<LoopSpec>,

    pub target: StepTarget,
    pub request: RequestShaping,
    pub response: ResponseShaping,

    /// Backend call timeout; falls back to the route, then the engine default
    pub timeout_secs: Option<u64>,

    pub children: BTreeMap<String, Step>,
}

impl Step {
    /// Create a step (and its subtree) from a step config
    pub fn from_config(key: &str, config: &StepConfig) -> Result<Self> {
        let target = StepTarget::from_config(config)
            .map_err(|e| anyhow::anyhow!("Step '{}': {}", key, e))?;

        let condition = config.condition.as_ref().map(|expression| StepCondition {
            expression: expression.clone(),
            fail_action: config.condition_fail_action,
            fail_message: config.condition_fail_message.clone(),
        });

        let async_spec = match (&config.async_message, config.is_async) {
            (Some(message), true) if !message.is_empty() => Some(AsyncSpec {
                message: message.clone(),
                event_name: config.async_event_name.clone(),
            }),
            _ => None,
        };

        let loop_spec = config
            .loop_variable
            .as_ref()
            .filter(|v| !v.is_empty())
            .map(|variable| LoopSpec {
                variable: variable.clone(),
                in_parallel: config.loop_in_parallel,
            });

        let children = config
            .func_steps
            .iter()
            .map(|(child_key, child)| Ok((child_key.clone(), Step::from_config(child_key, child)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Step {
            key: key.to_string(),
            condition,
            delay_ms: config.delay,
            async_spec,
            loop_spec,
            target,
            request: RequestShaping {
                headers: config.request_headers.clone(),
                params: config.query_params.clone(),
                form_data: config.form_data.clone(),
                file_data: config.file_data.clone(),
                body_template: config.request_transformation.clone(),
                target_host: config.target_host.clone(),
                target_path: config.target_path.clone(),
                method: config.method.clone(),
                content_type: config.content_type.clone(),
                remove_headers: config.remove_headers.clone(),
                remove_params: config.remove_params.clone(),
                remove_form_data: config.remove_form_data.clone(),
            },
            response: ResponseShaping {
                headers: config.response_headers.clone(),
                body_template: config.response_transformation.clone(),
                remove_headers: config.remove_response_headers.clone(),
            },
            timeout_secs: config.timeout_secs,
            children,
        })
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Keys under which this step publishes its scopes
    pub fn scope_keys(&self) -> Vec<&str> {
        let mut keys = vec![self.key.as_str()];
        if let Some(alias) = self.target.alias() {
            if alias != self.key {
                keys.push(alias);
            }
        }
        keys
    }

    /// Find a step by key in this subtree
    pub fn find(&self, key: &str) -> Option<&Step> {
        if self.key == key {
            return Some(self);
        }
        self.children.values().find_map(|child| child.find(key))
    }

    /// Number of steps in this subtree
    pub fn count(&self) -> usize {
        1 + self.children.values().map(Step::count).sum::<usize>()
    }
}
