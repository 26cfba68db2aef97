//! Error types for crewflow.
//!
//! Fatal setup errors (configuration, dependency resolution, tool-server
//! connections) are surfaced through [`CrewError`]. Best-effort paths
//! (feedback learning, playbook persistence, per-function metrics) return
//! internal `Result`s that are logged and swallowed at a single boundary
//! instead of aborting the caller.

use thiserror::Error;

/// Result alias used across the crate's public API.
pub type CrewResult<T> = Result<T, CrewError>;

/// Errors surfaced by crew construction and execution.
#[derive(Debug, Error)]
pub enum CrewError {
    /// Invalid configuration (empty descriptor list, empty agent name,
    /// unknown provider, missing credential, malformed URL).
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// One or more agents could not be constructed because their declared
    /// sub-agent dependencies are unsatisfiable. Reports the full set of
    /// unresolved names at once so a dependency cycle is diagnosable from
    /// a single error.
    #[error("Unable to resolve agent dependencies for: {}", unresolved.join(", "))]
    Dependency { unresolved: Vec<String> },

    /// An agent was referenced that does not exist in the crew.
    #[error("Agent '{name}' does not exist or is not configured")]
    AgentNotFound { name: String },

    /// A tool-server connection failed during agent construction.
    #[error("Tool server '{server}' connection failed: {message}")]
    Connection { server: String, message: String },

    /// A model invocation failed.
    #[error("Model invocation failed for agent '{agent}': {message}")]
    Invocation { agent: String, message: String },

    /// Operation attempted on a crew after `destroy()`.
    #[error("Crew has been destroyed and can no longer be used")]
    Destroyed,

    /// Underlying I/O error (config file loading).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error (config parsing).
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CrewError {
    /// Shorthand for a configuration error with a formatted message.
    pub fn configuration(message: impl Into<String>) -> Self {
        CrewError::Configuration {
            message: message.into(),
        }
    }
}
