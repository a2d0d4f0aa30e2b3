//! Scripted provider shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::time::Instant;

use stratus_core::{ApplyRequest, CoreError, CoreResult, Outputs, Provider, ResourceSchema};

type Behaviour = Arc<dyn Fn(&ApplyRequest, usize) -> CoreResult<Outputs> + Send + Sync>;

/// One captured `apply` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub inputs: Outputs,
    pub started: Instant,
    pub finished: Instant,
}

/// Provider whose apply sleeps for a fixed delay, then runs a behaviour.
///
/// The default behaviour returns `"<name>-<field>"` for every output field.
#[derive(Clone)]
pub struct ScriptedProvider {
    type_tag: String,
    outputs: Vec<String>,
    delay: Duration,
    behaviour: Option<Behaviour>,
    calls: Arc<RwLock<Vec<Call>>>,
}

impl ScriptedProvider {
    pub fn new(type_tag: &str, outputs: &[&str]) -> Self {
        Self {
            type_tag: type_tag.to_string(),
            outputs: outputs.iter().map(|o| o.to_string()).collect(),
            delay: Duration::ZERO,
            behaviour: None,
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replace the default outputs. The closure also receives the call number.
    pub fn behaviour<F>(mut self, f: F) -> Self
    where
        F: Fn(&ApplyRequest, usize) -> CoreResult<Outputs> + Send + Sync + 'static,
    {
        self.behaviour = Some(Arc::new(f));
        self
    }

    /// Fail every call with a provider error.
    pub fn failing(self, message: &'static str) -> Self {
        self.behaviour(move |request, _| Err(CoreError::provider(&request.name, message)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.read().clone()
    }

    pub fn calls_for(&self, name: &str) -> Vec<Call> {
        self.calls
            .read()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    fn default_outputs(&self, request: &ApplyRequest) -> Outputs {
        self.outputs
            .iter()
            .map(|field| (field.clone(), json!(format!("{}-{}", request.name, field))))
            .collect()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    fn description(&self) -> &str {
        "Scripted test provider"
    }

    fn schema(&self) -> ResourceSchema {
        self.outputs
            .iter()
            .fold(ResourceSchema::new().open(), |schema, field| schema.output(field))
    }

    async fn apply(&self, request: &ApplyRequest) -> CoreResult<Outputs> {
        let started = Instant::now();
        let call_number = self.calls_for(&request.name).len() + 1;
        tokio::time::sleep(self.delay).await;

        let result = match &self.behaviour {
            Some(behaviour) => behaviour(request, call_number),
            None => Ok(self.default_outputs(request)),
        };
        self.calls.write().push(Call {
            name: request.name.clone(),
            inputs: request.inputs.clone(),
            started,
            finished: Instant::now(),
        });
        result
    }
}

pub fn outputs(pairs: &[(&str, Value)]) -> Outputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
