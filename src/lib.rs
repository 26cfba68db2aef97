//! # Crewflow
//!
//! Orchestration and execution tracking for crews of LLM agents.
//!
//! A crew is built from a declarative configuration and a set of injected
//! collaborators (model factory, function registry, tool-server connector).
//! The crate tracks per-agent metrics and exact decimal costs across every
//! invocation, attributes executions to root-level tasks, and routes task
//! feedback into per-agent playbooks of learned behaviors that are composed
//! into instructions on subsequent calls.
//!
//! Model providers, tool-server transports, and telemetry exporters are
//! boundaries: the crate defines the traits and ships mock/noop
//! implementations, hosts supply the real ones.

pub mod agent;
pub mod config;
pub mod cost;
pub mod crew;
pub mod errors;
pub mod functions;
pub mod metrics;
pub mod model;
pub mod playbook;
pub mod servers;
pub mod state;
pub mod telemetry;

pub use agent::{Agent, AgentOutput, AgentStream, CallContext, MetricFn};
pub use config::{AgentDescriptor, CrewConfig, Example, LearningConfig, ModelSettings, Signature};
pub use cost::{AggregatedCosts, ModelPricing, PricingLookup, StaticPricing, UsageCost};
pub use crew::{Crew, CrewBuilder, ExecutionHistory, ExecutionRecord, FeedbackStrategy};
pub use errors::{CrewError, CrewResult};
pub use functions::{CrewFunction, FnFunction, FunctionRegistry};
pub use metrics::{MetricsLabels, MetricsRegistry, MetricsSnapshot};
pub use model::{
    ModelChunk, ModelClient, ModelFactory, ModelRequest, ModelResponse, TokenUsage,
};
pub use playbook::{Bullet, CuratorOp, Playbook, PlaybookStore, Section};
pub use servers::{HttpServerConfig, StdioServerConfig, ToolServerConfig, ToolServerConnector};
pub use state::{SharedState, StateRegistry};
pub use telemetry::{NoopTelemetry, SharedTelemetry, SpanHandle, TelemetrySink};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
