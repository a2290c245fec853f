//! Pipeline domain model and the registry the engine reads from

use crate::core::{
    config::{EngineSettings, PipelineConfig, RouteConfig},
    step::Step,
};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A named tree of steps
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,

    pub category: String,

    /// Status used when this pipeline answers with an error
    pub response_status_code: Option<u16>,

    /// Root steps, run concurrently
    pub steps: BTreeMap<String, Step>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(name: &str, config: &PipelineConfig) -> Result<Self> {
        let steps = config
            .func_steps
            .iter()
            .map(|(key, step)| Ok((key.clone(), Step::from_config(key, step)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map_err(|e| anyhow::anyhow!("Pipeline '{}': {}", name, e))?;

        Ok(Pipeline {
            name: name.to_string(),
            category: config.category.clone(),
            response_status_code: config.response_status_code,
            steps,
        })
    }

    /// Get a step anywhere in the tree by key
    pub fn step(&self, key: &str) -> Option<&Step> {
        self.steps.values().find_map(|step| step.find(key))
    }

    /// Total number of steps in the tree
    pub fn step_count(&self) -> usize {
        self.steps.values().map(Step::count).sum()
    }
}

/// Pipelines, routes and settings, shared read-only across invocations
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<Pipeline>>,
    routes: HashMap<String, RouteConfig>,
    settings: EngineSettings,
}

impl PipelineRegistry {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            pipelines: HashMap::new(),
            routes: HashMap::new(),
            settings,
        }
    }

    pub fn insert_route(&mut self, name: &str, route: RouteConfig) {
        self.routes.insert(name.to_string(), route);
    }

    pub fn insert_pipeline(&mut self, pipeline: Pipeline) {
        self.pipelines
            .insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    pub fn route(&self, name: &str) -> Option<&RouteConfig> {
        self.routes.get(name)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Pipeline names, sorted
    pub fn pipeline_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
