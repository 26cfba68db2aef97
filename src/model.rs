//! The model-invocation boundary.
//!
//! Provider clients and their wire protocols are external collaborators.
//! The core consumes an opaque capability: given an instruction, input
//! fields, and model settings, return output fields plus a token-usage
//! record, or a lazy sequence of partial-output chunks for streaming.
//!
//! Token usage arrives in two accepted shapes: flat
//! `{"promptTokens": .., "completionTokens": ..}` or nested under a
//! `"tokens"` key. Snake-case spellings are accepted too.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{AgentDescriptor, ModelSettings};
use crate::errors::CrewResult;

/// Error type produced by model clients.
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

/// Lazy sequence of streaming output chunks.
pub type ChunkStream = BoxStream<'static, Result<ModelChunk, ModelError>>;

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Token counts reported by a model invocation.
///
/// Fields are optional because providers may omit them; missing counts
/// degrade to "cost unknown" downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: Option<i64>,
    /// Tokens produced in the completion.
    pub completion_tokens: Option<i64>,
}

impl TokenUsage {
    /// Usage with both counts present.
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        }
    }

    /// Total token count, when both sides are known.
    pub fn total(&self) -> Option<i64> {
        Some(self.prompt_tokens? + self.completion_tokens?)
    }

    /// Merge another usage record additively. A missing count on either
    /// side leaves the merged count missing.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = sum_opt(self.prompt_tokens, other.prompt_tokens);
        self.completion_tokens = sum_opt(self.completion_tokens, other.completion_tokens);
    }

    /// Extract usage from a provider response value.
    ///
    /// Accepts both the flat shape and the shape nested under `"tokens"`,
    /// with camelCase or snake_case field names.
    pub fn from_value(value: &Value) -> Self {
        let source = value.get("tokens").unwrap_or(value);
        Self {
            prompt_tokens: read_count(source, &["promptTokens", "prompt_tokens"]),
            completion_tokens: read_count(source, &["completionTokens", "completion_tokens"]),
        }
    }
}

fn sum_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x + y),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn read_count(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_i64))
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// One model invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Active instruction text (base instruction, possibly composed with a
    /// rendered playbook).
    pub instruction: String,
    /// Input field values.
    pub input: Value,
    /// Model configuration for this call.
    pub settings: ModelSettings,
}

/// Output of a completed (non-streaming) model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Output field values.
    pub output: Value,
    /// Token usage for the call, when the provider reported it.
    pub usage: Option<TokenUsage>,
}

/// One partial-output chunk of a streaming invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChunk {
    /// Partial output delta.
    pub delta: Value,
    /// Usage reported with this chunk, typically only on the final one.
    pub usage: Option<TokenUsage>,
}

// ---------------------------------------------------------------------------
// ModelClient
// ---------------------------------------------------------------------------

/// Opaque model-invocation capability.
///
/// Implementations wrap a provider SDK or HTTP client; the core only ever
/// sees this trait.
#[async_trait]
pub trait ModelClient: Send + Sync + fmt::Debug {
    /// Provider identity (e.g., "openai").
    fn provider(&self) -> &str;

    /// Model identifier.
    fn model(&self) -> &str;

    /// Invoke the model and wait for the full response.
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Invoke the model and yield partial-output chunks lazily.
    async fn invoke_streaming(&self, request: ModelRequest) -> Result<ChunkStream, ModelError>;
}

/// Instantiates model clients from agent descriptors.
///
/// Configuration errors (unknown provider, missing API credential) are
/// fatal here, at construction time.
pub trait ModelFactory: Send + Sync {
    /// Create a client for the descriptor's provider and model settings.
    fn create(&self, descriptor: &AgentDescriptor) -> CrewResult<Arc<dyn ModelClient>>;
}

// ---------------------------------------------------------------------------
// Mock client
// ---------------------------------------------------------------------------

/// Canned-response model client for tests and offline runs.
///
/// Responses are popped from a queue in order; once the queue is empty the
/// client echoes the request input. All received requests are recorded for
/// inspection.
#[derive(Debug)]
pub struct MockModelClient {
    provider: String,
    model: String,
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
    /// Usage attached to echo responses.
    default_usage: TokenUsage,
}

impl MockModelClient {
    /// Create a mock for the given provider and model.
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            default_usage: TokenUsage::new(10, 5),
        }
    }

    /// Queue a canned response.
    pub fn push_response(&self, response: ModelResponse) {
        self.responses.lock().push_back(response);
    }

    /// Queue a canned text response under an `"output"` field.
    pub fn push_text(&self, text: &str) {
        self.push_response(ModelResponse {
            output: serde_json::json!({ "output": text }),
            usage: Some(self.default_usage),
        });
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self, request: &ModelRequest) -> ModelResponse {
        self.responses.lock().pop_front().unwrap_or(ModelResponse {
            output: serde_json::json!({ "output": request.input }),
            usage: Some(self.default_usage),
        })
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let response = self.next_response(&request);
        self.requests.lock().push(request);
        Ok(response)
    }

    async fn invoke_streaming(&self, request: ModelRequest) -> Result<ChunkStream, ModelError> {
        let response = self.next_response(&request);
        self.requests.lock().push(request);
        // One content chunk, then a final empty chunk carrying usage.
        let chunks = vec![
            Ok(ModelChunk {
                delta: response.output,
                usage: None,
            }),
            Ok(ModelChunk {
                delta: Value::Null,
                usage: response.usage,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Factory producing [`MockModelClient`]s for every descriptor.
#[derive(Debug, Default)]
pub struct MockModelFactory;

impl ModelFactory for MockModelFactory {
    fn create(&self, descriptor: &AgentDescriptor) -> CrewResult<Arc<dyn ModelClient>> {
        Ok(Arc::new(MockModelClient::new(
            &descriptor.provider,
            &descriptor.model.model,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_usage_from_flat_value() {
        let usage = TokenUsage::from_value(&json!({
            "promptTokens": 100,
            "completionTokens": 50
        }));
        assert_eq!(usage.prompt_tokens, Some(100));
        assert_eq!(usage.completion_tokens, Some(50));
        assert_eq!(usage.total(), Some(150));
    }

    #[test]
    fn test_usage_from_nested_value() {
        let usage = TokenUsage::from_value(&json!({
            "tokens": { "prompt_tokens": 7, "completion_tokens": 3 }
        }));
        assert_eq!(usage.prompt_tokens, Some(7));
        assert_eq!(usage.completion_tokens, Some(3));
    }

    #[test]
    fn test_usage_from_missing_fields() {
        let usage = TokenUsage::from_value(&json!({"other": 1}));
        assert!(usage.prompt_tokens.is_none());
        assert!(usage.total().is_none());
    }

    #[test]
    fn test_usage_add_keeps_partial_counts() {
        let mut a = TokenUsage {
            prompt_tokens: Some(10),
            completion_tokens: None,
        };
        a.add(&TokenUsage::new(5, 5));
        assert_eq!(a.prompt_tokens, Some(15));
        assert_eq!(a.completion_tokens, Some(5));
    }

    #[tokio::test]
    async fn test_mock_client_canned_then_echo() {
        let client = MockModelClient::new("openai", "gpt-4o-mini");
        client.push_text("canned");

        let request = ModelRequest {
            instruction: "do it".to_string(),
            input: json!({"q": "hi"}),
            settings: ModelSettings::new("gpt-4o-mini"),
        };

        let first = client.invoke(request.clone()).await.unwrap();
        assert_eq!(first.output["output"], "canned");

        let second = client.invoke(request).await.unwrap();
        assert_eq!(second.output["output"]["q"], "hi");
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_streaming_yields_usage_last() {
        let client = MockModelClient::new("openai", "gpt-4o-mini");
        let request = ModelRequest {
            instruction: String::new(),
            input: json!("x"),
            settings: ModelSettings::new("gpt-4o-mini"),
        };

        let mut stream = client.invoke_streaming(request).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.usage.is_none());
        let last = stream.next().await.unwrap().unwrap();
        assert!(last.usage.is_some());
        assert!(stream.next().await.is_none());
    }
}
