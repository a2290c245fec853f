//! Project configuration from YAML or JSON
//!
//! Field names follow the stored configuration format (`func_groups`,
//! `func_steps`, `async_message`, `loop_variable`, `target_hosts`, ...).

use crate::core::condition::{ConditionFailAction, OnErrorPolicy};
use crate::core::pipeline::{Pipeline, PipelineRegistry};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

/// One header / param / form entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,

    /// Literal value, or a template when `is_template` is set
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub is_template: bool,
}

impl KeyValue {
    pub fn literal(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            is_template: false,
        }
    }

    pub fn template(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            is_template: true,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Max workers for a set of sibling steps
    pub thread_count: usize,

    /// Max workers for the iterations of a parallel loop
    pub loop_thread_count: usize,

    /// Drop "no value" template errors instead of failing the step
    pub supress_template_errors: bool,

    /// Header holding the bearer token whose claims fill `Token`
    pub token_header: String,

    /// Header whose value is recorded with async hand-offs
    pub correlation_header: String,

    /// Backend call timeout when neither step nor route sets one
    pub default_timeout_secs: u64,

    /// Queue used by async steps that name no `async_event_name`
    pub default_queue: Option<String>,

    /// Host serving query-proxy steps
    pub query_host: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            thread_count: 10,
            loop_thread_count: 10,
            supress_template_errors: true,
            token_header: "Authorization".to_string(),
            correlation_header: "X-Correlation-Id".to_string(),
            default_timeout_secs: 30,
            default_queue: None,
            query_host: None,
        }
    }
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetHostConfig {
    pub host: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// A named backend route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub target_hosts: Vec<TargetHostConfig>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub on_error: OnErrorPolicy,
    pub timeout_secs: Option<u64>,
}

/// Output format requested from a query proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOutput {
    #[default]
    Json,
    Csv,
}

/// One pipeline ("function group")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub category: String,

    /// Status used for error responses of this pipeline
    pub response_status_code: Option<u16>,

    pub func_steps: BTreeMap<String, StepConfig>,
}

/// One step as stored
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub condition: Option<String>,
    pub condition_fail_action: ConditionFailAction,
    pub condition_fail_message: Option<String>,

    /// Milliseconds to sleep before the step runs
    pub delay: u64,

    #[serde(rename = "async")]
    pub is_async: bool,
    pub async_message: Option<String>,
    pub async_event_name: Option<String>,

    pub loop_variable: Option<String>,
    pub loop_in_parallel: bool,

    // Targets, exactly one must be set
    pub function_name: Option<String>,
    pub query_name: Option<String>,
    pub query_output: QueryOutput,
    pub api: Option<String>,
    pub route_name: Option<String>,

    pub path: Option<String>,
    pub method: Option<String>,
    pub content_type: Option<String>,

    pub request_headers: Vec<KeyValue>,
    pub query_params: Vec<KeyValue>,
    pub form_data: Vec<KeyValue>,
    pub file_data: Vec<KeyValue>,
    pub request_transformation: Option<String>,
    pub target_host: Option<String>,
    pub target_path: Option<String>,
    pub remove_headers: Vec<String>,
    pub remove_params: Vec<String>,
    pub remove_form_data: Vec<String>,

    pub response_headers: Vec<KeyValue>,
    pub response_transformation: Option<String>,
    pub remove_response_headers: Vec<String>,

    pub timeout_secs: Option<u64>,

    /// Child steps, run after this step's own call
    pub func_steps: BTreeMap<String, StepConfig>,
}

impl StepConfig {
    /// Names of the targets that are set
    pub fn targets(&self) -> Vec<&'static str> {
        let mut targets = Vec::new();
        if self.function_name.is_some() {
            targets.push("function_name");
        }
        if self.query_name.is_some() {
            targets.push("query_name");
        }
        if self.api.is_some() {
            targets.push("api");
        }
        if self.route_name.is_some() {
            targets.push("route_name");
        }
        targets
    }
}

/// Top-level project: settings, routes and pipelines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub settings: EngineSettings,
    pub routes: BTreeMap<String, RouteConfig>,
    pub func_groups: BTreeMap<String, PipelineConfig>,
}

impl ProjectConfig {
    /// Load a project file; `.json` is read as JSON, anything else as YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ProjectConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProjectConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the project configuration
    pub fn validate(&self) -> Result<()> {
        for (name, route) in &self.routes {
            if route.target_hosts.is_empty() {
                anyhow::bail!("Route '{}' has no target_hosts", name);
            }
        }

        for (group_name, group) in &self.func_groups {
            let mut seen_keys = HashSet::new();
            self.validate_steps(group_name, &group.func_steps, &mut seen_keys)?;
        }

        self.check_cycles()?;

        Ok(())
    }

    fn validate_steps<'a>(
        &self,
        group: &str,
        steps: &'a BTreeMap<String, StepConfig>,
        seen_keys: &mut HashSet<&'a str>,
    ) -> Result<()> {
        for (key, step) in steps {
            if !seen_keys.insert(key.as_str()) {
                anyhow::bail!("Duplicate step key '{}' in pipeline '{}'", key, group);
            }

            let targets = step.targets();
            if targets.len() != 1 {
                anyhow::bail!(
                    "Step '{}' in pipeline '{}' must set exactly one of function_name, query_name, api, route_name (found: {:?})",
                    key,
                    group,
                    targets
                );
            }

            if let Some(route) = &step.route_name {
                if !self.routes.contains_key(route) {
                    anyhow::bail!(
                        "Step '{}' in pipeline '{}' references non-existent route '{}'",
                        key,
                        group,
                        route
                    );
                }
            }

            if let Some(function) = &step.function_name {
                if !self.func_groups.contains_key(function) {
                    anyhow::bail!(
                        "Step '{}' in pipeline '{}' references non-existent pipeline '{}'",
                        key,
                        group,
                        function
                    );
                }
            }

            if step.is_async && step.async_message.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!(
                    "Step '{}' in pipeline '{}' is async but has no async_message",
                    key,
                    group
                );
            }

            self.validate_steps(group, &step.func_steps, seen_keys)?;
        }
        Ok(())
    }

    /// Check for cycles through nested pipeline references
    fn check_cycles(&self) -> Result<()> {
        let edges: HashMap<&str, Vec<&str>> = self
            .func_groups
            .iter()
            .map(|(name, group)| {
                let mut refs = Vec::new();
                collect_function_refs(&group.func_steps, &mut refs);
                (name.as_str(), refs)
            })
            .collect();

        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for name in self.func_groups.keys() {
            if !visited.contains(name.as_str()) {
                dfs_check(name, &edges, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    /// Queue names the project publishes to: the default queue plus every
    /// `async_event_name`
    pub fn queue_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        if let Some(default_queue) = &self.settings.default_queue {
            names.insert(default_queue.as_str());
        }
        for group in self.func_groups.values() {
            collect_event_names(&group.func_steps, &mut names);
        }
        names.into_iter().map(str::to_string).collect()
    }

    /// Build the runtime registry from a validated configuration
    pub fn to_registry(&self) -> Result<PipelineRegistry> {
        let mut registry = PipelineRegistry::new(self.settings.clone());
        for (name, route) in &self.routes {
            registry.insert_route(name, route.clone());
        }
        for (name, group) in &self.func_groups {
            registry.insert_pipeline(Pipeline::from_config(name, group)?);
        }
        Ok(registry)
    }
}

fn collect_event_names<'a>(steps: &'a BTreeMap<String, StepConfig>, names: &mut BTreeSet<&'a str>) {
    for step in steps.values() {
        if let Some(event) = step.async_event_name.as_deref().filter(|e| !e.is_empty()) {
            names.insert(event);
        }
        collect_event_names(&step.func_steps, names);
    }
}

fn collect_function_refs<'a>(steps: &'a BTreeMap<String, StepConfig>, refs: &mut Vec<&'a str>) {
    for step in steps.values() {
        if let Some(function) = &step.function_name {
            refs.push(function.as_str());
        }
        collect_function_refs(&step.func_steps, refs);
    }
}

fn dfs_check<'a>(
    name: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    recursion_stack: &mut HashSet<&'a str>,
) -> Result<()> {
    visited.insert(name);
    recursion_stack.insert(name);

    for next in edges.get(name).map(Vec::as_slice).unwrap_or_default() {
        if recursion_stack.contains(next) {
            anyhow::bail!("Cycle detected in nested pipelines involving '{}'", next);
        }
        if !visited.contains(next) {
            dfs_check(next, edges, visited, recursion_stack)?;
        }
    }

    recursion_stack.remove(name);
    Ok(())
}
