//! Step registry and step capabilities
//!
//! Steps are written against the typed [`Step`] trait. The registry stores them
//! behind the object-safe [`StepCapability`], which binds the opaque parameter
//! document to the step's own parameter type only when the step runs.

pub mod builtin;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{
    ambiance::Ambiance,
    error::{EngineError, Result, StepError},
    response::{
        CallbackId, ExecutableResponse, ExecutionMode, ResponseData, ResponseMap, StepResponse,
    },
};
use crate::events::{ResponseEvent, ResponseEventChannel, ResponsePayload};

/// Step-type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepType(String);

impl StepType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Reports async callback results for the node a step runs for
///
/// Reports are stamped with the in-place attempt the step ran as, so results
/// from an attempt that was since retried are dropped.
#[derive(Clone)]
pub struct CallbackHandle {
    node_execution_id: Uuid,
    attempt: u32,
    channel: Arc<dyn ResponseEventChannel>,
}

impl CallbackHandle {
    pub fn new(node_execution_id: Uuid, attempt: u32, channel: Arc<dyn ResponseEventChannel>) -> Self {
        Self {
            node_execution_id,
            attempt,
            channel,
        }
    }

    /// Callback id unique to this node and attempt
    pub fn callback_id(&self, name: &str) -> CallbackId {
        format!("{}-attempt{}-{}", self.node_execution_id, self.attempt, name)
    }

    /// Report one callback id
    pub async fn notify(&self, callback_id: impl Into<CallbackId>, data: ResponseData) -> Result<()> {
        self.channel
            .send(ResponseEvent::new(
                self.node_execution_id,
                ResponsePayload::ResumeNodeExecution {
                    callback_id: callback_id.into(),
                    data,
                    attempt: Some(self.attempt),
                },
            ))
            .await
    }
}

/// Ambient context handed to every step call
#[derive(Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub node_execution_id: Uuid,
    pub callbacks: CallbackHandle,
}

/// A step type implemented against its own parameter type
#[async_trait]
pub trait Step: Send + Sync + 'static {
    type Parameters: DeserializeOwned + Serialize + Send + Sync + 'static;

    /// Choose how the step runs; called once, before `execute`
    fn facilitate(&self, _params: &Self::Parameters, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Sync
    }

    async fn execute(
        &self,
        params: &Self::Parameters,
        ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError>;

    /// Fold awaited results into the step's final response
    async fn handle_response(
        &self,
        _params: &Self::Parameters,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> std::result::Result<StepResponse, StepError> {
        Ok(StepResponse::aggregate(responses))
    }
}

/// Parameters bound to a concrete step type
pub struct TypedParameters(Box<dyn Any + Send + Sync>);

impl TypedParameters {
    pub fn new<P: Any + Send + Sync>(params: P) -> Self {
        Self(Box::new(params))
    }

    pub fn downcast_ref<P: Any>(&self) -> Option<&P> {
        self.0.downcast_ref::<P>()
    }
}

impl fmt::Debug for TypedParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TypedParameters(..)")
    }
}

/// Object-safe capability set the registry hands out
#[async_trait]
pub trait StepCapability: Send + Sync {
    /// Bind a raw parameter document; unknown fields are ignored
    fn parse_parameters(&self, raw: &Value) -> std::result::Result<TypedParameters, StepError>;

    fn serialize_parameters(&self, params: &TypedParameters) -> std::result::Result<Value, StepError>;

    fn facilitate(
        &self,
        params: &TypedParameters,
        ctx: &StepContext,
    ) -> std::result::Result<ExecutionMode, StepError>;

    async fn execute(
        &self,
        params: &TypedParameters,
        ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError>;

    async fn handle_response(
        &self,
        params: &TypedParameters,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> std::result::Result<StepResponse, StepError>;
}

struct TypedStep<S>(S);

impl<S: Step> TypedStep<S> {
    fn params<'a>(&self, params: &'a TypedParameters) -> std::result::Result<&'a S::Parameters, StepError> {
        params.downcast_ref::<S::Parameters>().ok_or_else(|| {
            StepError::InvalidParameters("parameters were bound for another step type".to_string())
        })
    }
}

#[async_trait]
impl<S: Step> StepCapability for TypedStep<S> {
    fn parse_parameters(&self, raw: &Value) -> std::result::Result<TypedParameters, StepError> {
        let raw = match raw {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        let params: S::Parameters = serde_json::from_value(raw)
            .map_err(|e| StepError::InvalidParameters(e.to_string()))?;
        Ok(TypedParameters::new(params))
    }

    fn serialize_parameters(&self, params: &TypedParameters) -> std::result::Result<Value, StepError> {
        serde_json::to_value(self.params(params)?)
            .map_err(|e| StepError::InvalidParameters(e.to_string()))
    }

    fn facilitate(
        &self,
        params: &TypedParameters,
        ctx: &StepContext,
    ) -> std::result::Result<ExecutionMode, StepError> {
        Ok(self.0.facilitate(self.params(params)?, ctx))
    }

    async fn execute(
        &self,
        params: &TypedParameters,
        ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        self.0.execute(self.params(params)?, ctx).await
    }

    async fn handle_response(
        &self,
        params: &TypedParameters,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> std::result::Result<StepResponse, StepError> {
        self.0.handle_response(self.params(params)?, ctx, responses).await
    }
}

/// Immutable lookup table from step type to capability
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<StepType, Arc<dyn StepCapability>>,
}

/// Collects registrations; duplicates are rejected
#[derive(Default)]
pub struct StepRegistryBuilder {
    steps: HashMap<StepType, Arc<dyn StepCapability>>,
}

impl StepRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed step
    pub fn register<S: Step>(self, step_type: impl Into<StepType>, step: S) -> Result<Self> {
        self.register_capability(step_type, Arc::new(TypedStep(step)))
    }

    /// Register an already type-erased capability
    pub fn register_capability(
        mut self,
        step_type: impl Into<StepType>,
        capability: Arc<dyn StepCapability>,
    ) -> Result<Self> {
        let step_type = step_type.into();
        if self.steps.contains_key(&step_type) {
            return Err(EngineError::Configuration(format!(
                "step type '{}' is already registered",
                step_type
            )));
        }
        tracing::debug!(step_type = %step_type, "Registered step type");
        self.steps.insert(step_type, capability);
        Ok(self)
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry { steps: self.steps }
    }
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::new()
    }

    /// Registry with every built-in step type
    pub fn with_builtins() -> Result<Self> {
        Ok(builtin::register_all(Self::builder())?.build())
    }

    pub fn resolve(&self, step_type: &StepType) -> Result<Arc<dyn StepCapability>> {
        self.steps.get(step_type).cloned().ok_or_else(|| {
            EngineError::Configuration(format!("no step registered for type '{}'", step_type))
        })
    }

    pub fn contains(&self, step_type: &StepType) -> bool {
        self.steps.contains_key(step_type)
    }

    /// Registered step types, sorted
    pub fn step_types(&self) -> Vec<StepType> {
        let mut types: Vec<StepType> = self.steps.keys().cloned().collect();
        types.sort();
        types
    }
}
