//! Tool-server connection configuration and the connector boundary.
//!
//! Agents may declare connections to external tool servers. Each connection
//! yields zero or more additional invocable functions that are merged into
//! the agent's function set during construction. Two transports are
//! supported: a local child process speaking over stdio, and a remote HTTP
//! endpoint. Connection failures are hard errors during agent construction
//! (a half-connected agent must not be added to the crew).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{CrewError, CrewResult};
use crate::functions::CrewFunction;

// ---------------------------------------------------------------------------
// StdioServerConfig
// ---------------------------------------------------------------------------

/// Stdio tool-server configuration.
///
/// Connects to a local tool server that runs as a child process and
/// communicates via standard input/output streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StdioServerConfig {
    /// Command to execute (e.g., "python", "node", "npx").
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to pass to the process.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

impl StdioServerConfig {
    /// Create a new stdio server configuration.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: None,
        }
    }

    /// Set the command arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the environment variables.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Server identifier for logging.
    pub fn server_identifier(&self) -> String {
        format!("stdio:{}:{}", self.command, self.args.join(":"))
    }
}

// ---------------------------------------------------------------------------
// HttpServerConfig
// ---------------------------------------------------------------------------

/// HTTP tool-server configuration.
///
/// Connects to a remote tool server over HTTP/HTTPS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpServerConfig {
    /// Server URL (e.g., "https://api.example.com/tools").
    pub url: String,
    /// Optional HTTP headers for authentication or other purposes.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

impl HttpServerConfig {
    /// Create a new HTTP server configuration.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: None,
        }
    }

    /// Set the HTTP headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Server identifier for logging.
    pub fn server_identifier(&self) -> String {
        format!("http:{}", self.url)
    }

    /// Validate the configured URL shape.
    pub fn validate(&self) -> CrewResult<()> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(CrewError::configuration(format!(
                "Tool server URL must be http(s): '{}'",
                self.url
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ToolServerConfig (union enum)
// ---------------------------------------------------------------------------

/// Union of all tool-server configuration types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolServerConfig {
    /// Stdio-based local process server.
    Stdio(StdioServerConfig),
    /// HTTP remote server.
    Http(HttpServerConfig),
}

impl ToolServerConfig {
    /// Server identifier for logging.
    pub fn server_identifier(&self) -> String {
        match self {
            ToolServerConfig::Stdio(s) => s.server_identifier(),
            ToolServerConfig::Http(s) => s.server_identifier(),
        }
    }

    /// Validate the configuration shape.
    pub fn validate(&self) -> CrewResult<()> {
        match self {
            ToolServerConfig::Stdio(s) => {
                if s.command.trim().is_empty() {
                    return Err(CrewError::configuration(
                        "Stdio tool server requires a non-empty command",
                    ));
                }
                Ok(())
            }
            ToolServerConfig::Http(s) => s.validate(),
        }
    }
}

impl From<StdioServerConfig> for ToolServerConfig {
    fn from(config: StdioServerConfig) -> Self {
        ToolServerConfig::Stdio(config)
    }
}

impl From<HttpServerConfig> for ToolServerConfig {
    fn from(config: HttpServerConfig) -> Self {
        ToolServerConfig::Http(config)
    }
}

// ---------------------------------------------------------------------------
// ToolServerConnector
// ---------------------------------------------------------------------------

/// Boundary trait for establishing tool-server connections.
///
/// The core never performs transport handshakes itself; a connector is
/// injected into the crew and asked to turn a [`ToolServerConfig`] into a
/// list of callable functions. A connection failure propagates as a hard
/// [`CrewError::Connection`] so the agent is never left half-initialized.
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    /// Connect to the server and return the functions it exposes.
    async fn connect(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> CrewResult<Vec<Arc<dyn CrewFunction>>>;
}

/// Connector that refuses every connection.
///
/// Used as the default when a crew is built without a connector; any agent
/// declaring a tool server then fails construction with a clear message
/// instead of silently running without its tools.
#[derive(Debug, Default)]
pub struct NoopConnector;

#[async_trait]
impl ToolServerConnector for NoopConnector {
    async fn connect(
        &self,
        name: &str,
        _config: &ToolServerConfig,
    ) -> CrewResult<Vec<Arc<dyn CrewFunction>>> {
        Err(CrewError::Connection {
            server: name.to_string(),
            message: "no tool-server connector is configured for this crew".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_config_builder() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());

        let config = StdioServerConfig::new("npx")
            .with_args(vec!["-y".to_string(), "@tools/server".to_string()])
            .with_env(env);

        assert_eq!(config.command, "npx");
        assert_eq!(config.args.len(), 2);
        assert_eq!(config.env.as_ref().unwrap().get("API_KEY").unwrap(), "secret");
    }

    #[test]
    fn test_stdio_server_identifier() {
        let config = StdioServerConfig::new("python").with_args(vec!["server.py".to_string()]);
        assert_eq!(config.server_identifier(), "stdio:python:server.py");
    }

    #[test]
    fn test_http_server_identifier() {
        let config = HttpServerConfig::new("https://example.com/tools");
        assert_eq!(config.server_identifier(), "http:https://example.com/tools");
    }

    #[test]
    fn test_http_url_validation() {
        assert!(HttpServerConfig::new("https://example.com").validate().is_ok());
        assert!(HttpServerConfig::new("ftp://example.com").validate().is_err());
    }

    #[test]
    fn test_stdio_empty_command_rejected() {
        let config: ToolServerConfig = StdioServerConfig::new("  ").into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_untagged_deserialization() {
        let stdio: ToolServerConfig =
            serde_json::from_str(r#"{"command": "python", "args": ["server.py"]}"#).unwrap();
        assert!(matches!(stdio, ToolServerConfig::Stdio(_)));

        let http: ToolServerConfig =
            serde_json::from_str(r#"{"url": "https://example.com/tools"}"#).unwrap();
        assert!(matches!(http, ToolServerConfig::Http(_)));
    }

    #[tokio::test]
    async fn test_noop_connector_fails() {
        let connector = NoopConnector;
        let config: ToolServerConfig = HttpServerConfig::new("https://example.com").into();
        let result = connector.connect("search", &config).await;
        assert!(matches!(result, Err(CrewError::Connection { .. })));
    }
}
