//! Declarative crew and agent configuration.
//!
//! A crew is described by a [`CrewConfig`]: a list of [`AgentDescriptor`]s,
//! each naming its provider, model settings, capability signature,
//! sub-agent dependencies, functions, and optional feedback-learning
//! configuration. Configurations are immutable once loaded; validation
//! happens eagerly at construction time so a crew is never left
//! half-initialized.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CrewError, CrewResult};
use crate::servers::ToolServerConfig;

// ---------------------------------------------------------------------------
// Capability signature
// ---------------------------------------------------------------------------

/// One field of a capability signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignatureField {
    /// Field name as it appears in the prompt signature.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared type (e.g., "string", "number", "json"). Free-form; the
    /// invocation layer interprets it.
    #[serde(default = "default_field_type", rename = "type")]
    pub field_type: String,
}

fn default_field_type() -> String {
    "string".to_string()
}

impl SignatureField {
    /// Create a string-typed field.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            field_type: default_field_type(),
        }
    }
}

/// Declares what an agent consumes and produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Signature {
    /// Input fields.
    #[serde(default)]
    pub inputs: Vec<SignatureField>,
    /// Output fields.
    #[serde(default)]
    pub outputs: Vec<SignatureField>,
}

// ---------------------------------------------------------------------------
// Model settings
// ---------------------------------------------------------------------------

/// Model configuration passed to the invocation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Temperature parameter for generation.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(default)]
    pub max_tokens: Option<i64>,
    /// Top-p (nucleus) sampling parameter.
    #[serde(default)]
    pub top_p: Option<f64>,
}

impl ModelSettings {
    /// Create settings for the given model id.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the max token budget.
    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

// ---------------------------------------------------------------------------
// Feedback-learning configuration
// ---------------------------------------------------------------------------

/// Configuration for an agent's feedback-learning (playbook) lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LearningConfig {
    /// Optional separate teacher model used to analyze feedback. Falls back
    /// to the agent's own model when absent.
    #[serde(default)]
    pub teacher_model: Option<ModelSettings>,
    /// File the playbook is loaded from / persisted to.
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
    /// Persist the playbook after every successful online update.
    #[serde(default)]
    pub auto_persist: bool,
    /// Run an offline optimization pass when the agent is added.
    #[serde(default)]
    pub compile_on_start: bool,
    /// Name of the metric used to score examples during offline
    /// optimization.
    #[serde(default)]
    pub metric: Option<String>,
}

// ---------------------------------------------------------------------------
// Examples
// ---------------------------------------------------------------------------

/// One example input/output pair used for offline optimization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Example {
    /// Input field values.
    pub input: Value,
    /// Expected output field values.
    pub output: Value,
}

// ---------------------------------------------------------------------------
// AgentDescriptor
// ---------------------------------------------------------------------------

/// Declarative description of a single agent. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Agent name, unique within the crew.
    pub name: String,
    /// Human-readable description of the agent's purpose.
    #[serde(default)]
    pub description: String,
    /// Declared input/output fields.
    #[serde(default)]
    pub signature: Signature,
    /// Provider identity (e.g., "openai", "anthropic").
    pub provider: String,
    /// Model configuration.
    pub model: ModelSettings,
    /// Names of sub-agents this agent depends on. Dependency edges of the
    /// crew's agent graph.
    #[serde(default)]
    pub sub_agents: Vec<String>,
    /// Names of registered functions this agent may call.
    #[serde(default)]
    pub functions: Vec<String>,
    /// Tool-server connections to establish for this agent, keyed by
    /// server name.
    #[serde(default)]
    pub tool_servers: HashMap<String, ToolServerConfig>,
    /// Example input/output pairs for offline optimization.
    #[serde(default)]
    pub examples: Vec<Example>,
    /// Feedback-learning configuration; absent means learning disabled.
    #[serde(default)]
    pub learning: Option<LearningConfig>,
}

impl AgentDescriptor {
    /// Create a minimal descriptor with the given name, provider, and model.
    pub fn new(name: &str, provider: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            signature: Signature::default(),
            provider: provider.to_string(),
            model: ModelSettings::new(model),
            sub_agents: Vec::new(),
            functions: Vec::new(),
            tool_servers: HashMap::new(),
            examples: Vec::new(),
            learning: None,
        }
    }

    /// Declare sub-agent dependencies.
    pub fn with_sub_agents(mut self, sub_agents: Vec<String>) -> Self {
        self.sub_agents = sub_agents;
        self
    }

    /// Declare callable functions.
    pub fn with_functions(mut self, functions: Vec<String>) -> Self {
        self.functions = functions;
        self
    }

    /// Attach a feedback-learning configuration.
    pub fn with_learning(mut self, learning: LearningConfig) -> Self {
        self.learning = Some(learning);
        self
    }

    /// Set the agent description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Base instruction text derived from the descriptor.
    ///
    /// This is the instruction captured as "original" before any playbook
    /// is ever composed on top of it.
    pub fn instruction(&self) -> String {
        if self.description.is_empty() {
            format!("You are the '{}' agent.", self.name)
        } else {
            self.description.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// CrewConfig
// ---------------------------------------------------------------------------

/// Top-level crew configuration: the full list of agent descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewConfig {
    /// Agent descriptors, in declaration order.
    pub agents: Vec<AgentDescriptor>,
}

impl CrewConfig {
    /// Build a configuration from descriptors, validating eagerly.
    pub fn new(agents: Vec<AgentDescriptor>) -> CrewResult<Self> {
        let config = Self { agents };
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> CrewResult<Self> {
        let config: CrewConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> CrewResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Validate the configuration.
    ///
    /// The descriptor list must be non-empty, every descriptor must carry a
    /// non-empty name and provider, names must be unique, and tool-server
    /// configs must be well-formed. Violations raise before any agent is
    /// constructed.
    pub fn validate(&self) -> CrewResult<()> {
        if self.agents.is_empty() {
            return Err(CrewError::configuration(
                "Crew configuration must contain at least one agent",
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for descriptor in &self.agents {
            if descriptor.name.trim().is_empty() {
                return Err(CrewError::configuration(
                    "Agent descriptor has an empty name",
                ));
            }
            if !seen.insert(descriptor.name.as_str()) {
                return Err(CrewError::configuration(format!(
                    "Duplicate agent name '{}'",
                    descriptor.name
                )));
            }
            if descriptor.provider.trim().is_empty() {
                return Err(CrewError::configuration(format!(
                    "Agent '{}' has an empty provider",
                    descriptor.name
                )));
            }
            for (server_name, server) in &descriptor.tool_servers {
                server.validate().map_err(|e| {
                    CrewError::configuration(format!(
                        "Agent '{}' tool server '{}': {}",
                        descriptor.name, server_name, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Look up a descriptor by agent name.
    pub fn descriptor(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// All configured agent names, in declaration order.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }
}
