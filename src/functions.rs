//! Function registry and invocation wrappers.
//!
//! Hosts register named functions that agents may call. A registered entry
//! is either a plain callable or a stateful factory that takes the crew's
//! shared state and produces a callable. The tagged variant is resolved
//! once at registration time into a uniform callable; there is no runtime
//! type inspection on the call path.
//!
//! Unknown function names referenced by an agent descriptor are warnings,
//! not fatal errors.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::metrics::{MetricsLabels, MetricsRegistry};
use crate::state::SharedState;

/// Error type produced by function invocations.
pub type FunctionError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// CrewFunction
// ---------------------------------------------------------------------------

/// One invocable named function.
#[async_trait]
pub trait CrewFunction: Send + Sync {
    /// Function name as referenced by agent descriptors.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// JSON schema of the function's parameters.
    fn schema(&self) -> Value {
        Value::Null
    }

    /// Invoke the function.
    async fn call(&self, args: Value) -> Result<Value, FunctionError>;
}

impl fmt::Debug for dyn CrewFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CrewFunction({})", self.name())
    }
}

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

type CallFn = dyn Fn(Value) -> Result<Value, FunctionError> + Send + Sync;

/// [`CrewFunction`] built from a synchronous closure.
pub struct FnFunction {
    name: String,
    description: String,
    call: Arc<CallFn>,
}

impl FnFunction {
    /// Wrap a closure as a named function.
    pub fn new(
        name: &str,
        call: impl Fn(Value) -> Result<Value, FunctionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            call: Arc::new(call),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

#[async_trait]
impl CrewFunction for FnFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, args: Value) -> Result<Value, FunctionError> {
        (self.call)(args)
    }
}

// ---------------------------------------------------------------------------
// AgentFunction (tagged variant)
// ---------------------------------------------------------------------------

/// Factory producing a callable bound to the crew's shared state.
pub type StatefulFactoryFn = Arc<dyn Fn(SharedState) -> Arc<dyn CrewFunction> + Send + Sync>;

/// A registered function entry: a plain callable or a stateful factory.
#[derive(Clone)]
pub enum AgentFunction {
    /// Stateless callable, shared as-is across crews.
    Callable(Arc<dyn CrewFunction>),
    /// Factory taking the crew's shared state and producing a callable.
    StatefulFactory(StatefulFactoryFn),
}

impl AgentFunction {
    /// Resolve into a uniform callable for the given crew state.
    pub fn resolve(&self, state: &SharedState) -> Arc<dyn CrewFunction> {
        match self {
            AgentFunction::Callable(f) => f.clone(),
            AgentFunction::StatefulFactory(factory) => factory(state.clone()),
        }
    }
}

impl fmt::Debug for AgentFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentFunction::Callable(func) => write!(f, "Callable({})", func.name()),
            AgentFunction::StatefulFactory(_) => write!(f, "StatefulFactory"),
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionRegistry
// ---------------------------------------------------------------------------

/// Mapping from function name to registered entry.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    entries: std::collections::HashMap<String, AgentFunction>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stateless callable under its own name.
    pub fn register(&mut self, function: Arc<dyn CrewFunction>) {
        self.entries
            .insert(function.name().to_string(), AgentFunction::Callable(function));
    }

    /// Register a stateful factory under an explicit name.
    pub fn register_factory(&mut self, name: &str, factory: StatefulFactoryFn) {
        self.entries
            .insert(name.to_string(), AgentFunction::StatefulFactory(factory));
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&AgentFunction> {
        self.entries.get(name)
    }

    /// Resolve a list of names into callables bound to the crew state.
    ///
    /// Unknown names are logged and skipped, never fatal.
    pub fn resolve_names(
        &self,
        names: &[String],
        state: &SharedState,
    ) -> Vec<Arc<dyn CrewFunction>> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            match self.entries.get(name) {
                Some(entry) => resolved.push(entry.resolve(state)),
                None => log::warn!("Skipping unknown function '{}'", name),
            }
        }
        resolved
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Metered wrapper
// ---------------------------------------------------------------------------

/// Wraps a function so every call records count and latency into the
/// metrics registry under the owning agent's label tuple.
pub struct MeteredFunction {
    inner: Arc<dyn CrewFunction>,
    labels: MetricsLabels,
    metrics: Arc<MetricsRegistry>,
}

impl MeteredFunction {
    /// Wrap `inner` with metric recording.
    pub fn new(
        inner: Arc<dyn CrewFunction>,
        labels: MetricsLabels,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inner,
            labels,
            metrics,
        }
    }
}

#[async_trait]
impl CrewFunction for MeteredFunction {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn schema(&self) -> Value {
        self.inner.schema()
    }

    async fn call(&self, args: Value) -> Result<Value, FunctionError> {
        let start = Instant::now();
        let result = self.inner.call(args).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_function_call(&self.labels, latency_ms, Some(self.inner.name()));
        result
    }
}
