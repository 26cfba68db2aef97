//! Agent wrapper: one configured agent around a model-invocation capability.
//!
//! Every call flows through the metrics registry and cost aggregator. When
//! feedback learning is enabled, the current playbook is composed into the
//! instruction at the start of each call; the captured original instruction
//! is never mutated.
//!
//! Task attribution travels in an explicit [`CallContext`] handed down the
//! invocation chain: a root-level `forward` mints a fresh task id, while a
//! sub-agent call is invoked with the parent's context and attributes its
//! execution to the parent's task.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::Utc;
use futures::Stream;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{AgentDescriptor, Example, LearningConfig};
use crate::cost::{calculate_cost, track_cost_in_state, PricingLookup};
use crate::crew::ExecutionHistory;
use crate::errors::{CrewError, CrewResult};
use crate::functions::CrewFunction;
use crate::metrics::{MetricsLabels, MetricsRegistry, MetricsSnapshot};
use crate::model::{ModelChunk, ModelClient, ModelError, ModelFactory, ModelRequest, TokenUsage};
use crate::playbook::curator::{analyze_feedback, apply_ops};
use crate::playbook::{Playbook, PlaybookStore};
use crate::state::SharedState;

/// Minimum length a composed instruction must reach; below this the
/// original instruction is used unmodified.
const MIN_COMPOSED_INSTRUCTION_LEN: usize = 64;

/// Metric function scoring a prediction against an example: higher is
/// better, 1.0 is a perfect score.
pub type MetricFn = Arc<dyn Fn(&Example, &Value) -> f64 + Send + Sync>;

/// Mint a fresh task id: timestamp plus random suffix, never reused.
pub(crate) fn new_task_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

/// Attribution context carried through an invocation chain.
///
/// Passing the task id explicitly (rather than through a mutable shared
/// field) keeps concurrent root-level calls on the same crew from
/// misattributing each other's sub-agent executions.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Task id of the root-level invocation this call belongs to.
    pub task_id: String,
}

impl CallContext {
    /// Context for an existing task.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentOutput
// ---------------------------------------------------------------------------

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Task id this invocation was attributed to.
    pub task_id: String,
    /// Output field values.
    pub output: Value,
    /// Token usage, when reported.
    pub usage: Option<TokenUsage>,
}

// ---------------------------------------------------------------------------
// Learning runtime
// ---------------------------------------------------------------------------

/// Mutable feedback-learning state, present once learning is initialized.
struct LearningRuntime {
    /// Separate teacher model for feedback analysis, when configured.
    teacher: Option<Arc<dyn ModelClient>>,
    /// Persistence target, when configured.
    store: Option<PlaybookStore>,
    /// Persist after every successful online update.
    auto_persist: bool,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Construction inputs for an [`Agent`], assembled by the orchestrator.
pub(crate) struct AgentBuild {
    pub crew_id: String,
    pub descriptor: AgentDescriptor,
    pub client: Arc<dyn ModelClient>,
    pub functions: Vec<Arc<dyn CrewFunction>>,
    pub sub_agents: HashMap<String, Arc<Agent>>,
    pub state: SharedState,
    pub history: ExecutionHistory,
    pub metrics: Arc<MetricsRegistry>,
    pub pricing: Arc<dyn PricingLookup>,
}

/// A single configured agent within a crew.
pub struct Agent {
    name: String,
    descriptor: AgentDescriptor,
    labels: MetricsLabels,
    client: Arc<dyn ModelClient>,
    functions: Vec<Arc<dyn CrewFunction>>,
    sub_agents: HashMap<String, Arc<Agent>>,
    state: SharedState,
    history: ExecutionHistory,
    metrics: Arc<MetricsRegistry>,
    pricing: Arc<dyn PricingLookup>,
    /// Instruction captured at construction, before any playbook was ever
    /// composed on top of it.
    original_instruction: String,
    playbook: RwLock<Option<Playbook>>,
    learning: RwLock<Option<LearningRuntime>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("provider", &self.client.provider())
            .field("model", &self.client.model())
            .field("functions", &self.functions.len())
            .field("sub_agents", &self.sub_agents.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub(crate) fn new(build: AgentBuild) -> Self {
        let labels = MetricsLabels::new(
            &build.crew_id,
            &build.descriptor.name,
            build.client.provider(),
            build.client.model(),
        );
        let original_instruction = build.descriptor.instruction();
        Self {
            name: build.descriptor.name.clone(),
            descriptor: build.descriptor,
            labels,
            client: build.client,
            functions: build.functions,
            sub_agents: build.sub_agents,
            state: build.state,
            history: build.history,
            metrics: build.metrics,
            pricing: build.pricing,
            original_instruction,
            playbook: RwLock::new(None),
            learning: RwLock::new(None),
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declarative descriptor this agent was built from.
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Resolved callable functions (already metered).
    pub fn functions(&self) -> &[Arc<dyn CrewFunction>] {
        &self.functions
    }

    /// Resolved sub-agent handles, keyed by name.
    pub fn sub_agents(&self) -> &HashMap<String, Arc<Agent>> {
        &self.sub_agents
    }

    /// Instruction captured before any playbook injection.
    pub fn original_instruction(&self) -> &str {
        &self.original_instruction
    }

    // -- Instruction composition ------------------------------------------

    /// Active instruction for the next call: the original instruction
    /// composed with the current rendered playbook, when the combined text
    /// meets the minimum length threshold. Composition is per-call; the
    /// original instruction is never mutated.
    pub fn active_instruction(&self) -> String {
        let rendered = match self.playbook.read().as_ref() {
            Some(playbook) => playbook.render(),
            None => String::new(),
        };
        if rendered.is_empty() {
            return self.original_instruction.clone();
        }
        let composed = format!("{}\n\n{}", self.original_instruction, rendered);
        if composed.len() < MIN_COMPOSED_INSTRUCTION_LEN {
            self.original_instruction.clone()
        } else {
            composed
        }
    }

    // -- Invocation -------------------------------------------------------

    fn request(&self, input: Value) -> ModelRequest {
        ModelRequest {
            instruction: self.active_instruction(),
            input,
            settings: self.descriptor.model.clone(),
        }
    }

    fn record_success(&self, duration_ms: f64, is_streaming: bool, usage: Option<&TokenUsage>) {
        self.metrics
            .record_request(&self.labels, is_streaming, duration_ms);
        if let Some(usage) = usage {
            self.metrics.record_tokens(&self.labels, usage);
            if let Some(pricing) = self.pricing.pricing_for(self.client.model()) {
                let cost = calculate_cost(usage, &pricing);
                if let Some(cost) = &cost {
                    self.metrics
                        .record_estimated_cost(&self.labels, cost.total_cost);
                }
                track_cost_in_state(&self.name, cost.as_ref(), &self.state);
            }
        }
    }

    fn record_failure(&self, duration_ms: f64, is_streaming: bool) {
        self.metrics
            .record_request(&self.labels, is_streaming, duration_ms);
        self.metrics.record_error(&self.labels);
    }

    async fn invoke(&self, input: Value, task_id: &str) -> CrewResult<AgentOutput> {
        let request = self.request(input);
        let start = Instant::now();
        match self.client.invoke(request).await {
            Ok(response) => {
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.record_success(duration_ms, false, response.usage.as_ref());
                self.history
                    .record_result(task_id, &self.name, response.output.clone());
                Ok(AgentOutput {
                    task_id: task_id.to_string(),
                    output: response.output,
                    usage: response.usage,
                })
            }
            Err(e) => {
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.record_failure(duration_ms, false);
                Err(CrewError::Invocation {
                    agent: self.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Root-level invocation: mints a fresh task id, registers the task in
    /// the crew's execution history, and marks the task complete when the
    /// call finishes. The task id is attached to the returned output.
    pub async fn forward(&self, input: Value) -> CrewResult<AgentOutput> {
        let task_id = new_task_id();
        self.history.track(&task_id, &self.name, input.clone());
        let result = self.invoke(input, &task_id).await;
        self.history.complete(&task_id);
        result
    }

    /// Sub-agent invocation: attributes the execution to the parent's task
    /// id instead of minting a new one.
    pub async fn forward_with_context(
        &self,
        input: Value,
        ctx: &CallContext,
    ) -> CrewResult<AgentOutput> {
        self.history.track(&ctx.task_id, &self.name, input.clone());
        self.invoke(input, &ctx.task_id).await
    }

    /// Root-level streaming invocation.
    ///
    /// Metrics and cost are recorded exactly once, when the returned stream
    /// is dropped — whether it was fully consumed, abandoned part-way, or
    /// cancelled. Usage observed in chunks up to that point is recorded.
    pub async fn streaming_forward(&self, input: Value) -> CrewResult<AgentStream> {
        let task_id = new_task_id();
        self.history.track(&task_id, &self.name, input.clone());
        self.open_stream(input, task_id, true).await
    }

    /// Streaming invocation attributed to an existing task.
    pub async fn streaming_forward_with_context(
        &self,
        input: Value,
        ctx: &CallContext,
    ) -> CrewResult<AgentStream> {
        self.history.track(&ctx.task_id, &self.name, input.clone());
        self.open_stream(input, ctx.task_id.clone(), false).await
    }

    async fn open_stream(
        &self,
        input: Value,
        task_id: String,
        is_root: bool,
    ) -> CrewResult<AgentStream> {
        let request = self.request(input);
        let start = Instant::now();
        match self.client.invoke_streaming(request).await {
            Ok(stream) => Ok(AgentStream {
                inner: Some(stream),
                recorder: Some(StreamRecorder {
                    agent_name: self.name.clone(),
                    model: self.client.model().to_string(),
                    labels: self.labels.clone(),
                    metrics: self.metrics.clone(),
                    pricing: self.pricing.clone(),
                    state: self.state.clone(),
                    history: self.history.clone(),
                    task_id,
                    is_root,
                    started: start,
                    usage: TokenUsage::default(),
                    errored: false,
                }),
            }),
            Err(e) => {
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.record_failure(duration_ms, true);
                if is_root {
                    self.history.complete(&task_id);
                }
                Err(CrewError::Invocation {
                    agent: self.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    // -- Metrics ----------------------------------------------------------

    /// Metrics label tuple for this agent.
    pub fn metrics_labels(&self) -> &MetricsLabels {
        &self.labels
    }

    /// Snapshot scoped to this agent's label tuple.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.labels)
    }

    /// Clear this agent's metrics bucket.
    pub fn reset_metrics(&self) {
        self.metrics.reset(Some(&self.labels));
    }

    // -- Feedback learning ------------------------------------------------

    /// Initialize feedback learning from the agent's learning config.
    ///
    /// Builds the optional teacher model, sets up persistence, and loads
    /// any previously persisted playbook (or starts empty). Failures are
    /// logged and swallowed; an agent without a usable playbook keeps
    /// running with its original instruction unmodified.
    pub fn init_learning(&self, config: &LearningConfig, factory: &dyn ModelFactory) {
        let teacher = config.teacher_model.as_ref().and_then(|settings| {
            let mut teacher_descriptor = self.descriptor.clone();
            teacher_descriptor.model = settings.clone();
            match factory.create(&teacher_descriptor) {
                Ok(client) => Some(client),
                Err(e) => {
                    log::warn!(
                        "Teacher model for agent '{}' unavailable ({}); \
                         falling back to the agent's own model",
                        self.name,
                        e
                    );
                    None
                }
            }
        });

        let store = config
            .persist_path
            .as_ref()
            .map(|path| PlaybookStore::File(path.clone()));

        if let Some(store) = &store {
            if let Some(playbook) = store.load() {
                log::info!(
                    "Loaded persisted playbook for agent '{}' ({} bullets)",
                    self.name,
                    playbook.bullet_count()
                );
                *self.playbook.write() = Some(playbook);
            }
        }

        *self.learning.write() = Some(LearningRuntime {
            teacher,
            store,
            auto_persist: config.auto_persist,
        });
    }

    /// Attach a persistence store with explicit load/save callbacks,
    /// replacing any file-based store from the learning config.
    pub fn set_playbook_store(&self, store: PlaybookStore) {
        if let Some(playbook) = store.load() {
            *self.playbook.write() = Some(playbook);
        }
        let mut learning = self.learning.write();
        match learning.as_mut() {
            Some(runtime) => runtime.store = Some(store),
            None => {
                *learning = Some(LearningRuntime {
                    teacher: None,
                    store: Some(store),
                    auto_persist: false,
                });
            }
        }
    }

    fn analysis_model(&self) -> Arc<dyn ModelClient> {
        self.learning
            .read()
            .as_ref()
            .and_then(|runtime| runtime.teacher.clone())
            .unwrap_or_else(|| self.client.clone())
    }

    fn persist_if_configured(&self, playbook: &Playbook) {
        let learning = self.learning.read();
        if let Some(runtime) = learning.as_ref() {
            if runtime.auto_persist {
                if let Some(store) = &runtime.store {
                    store.save(playbook);
                }
            }
        }
    }

    /// Run a batch compilation pass over scored examples, producing a
    /// candidate playbook that replaces the current one when non-empty.
    ///
    /// Per-example failures (invocation errors, unusable analysis) are
    /// logged and skipped; they never abort the pass or the crew.
    pub async fn optimize_offline(&self, metric: MetricFn, examples: &[Example]) {
        let mut candidate = Playbook::new();
        let analysis_model = self.analysis_model();
        let settings = self.descriptor.model.clone();

        for (index, example) in examples.iter().enumerate() {
            let request = self.request(example.input.clone());
            let prediction = match self.client.invoke(request).await {
                Ok(response) => response.output,
                Err(e) => {
                    log::warn!(
                        "Offline optimization for '{}': example {} failed ({}), skipping",
                        self.name,
                        index,
                        e
                    );
                    continue;
                }
            };

            let score = metric(example, &prediction);
            if score >= 1.0 {
                continue;
            }

            let feedback = format!(
                "The answer scored {:.2}. Expected output: {}. Actual output: {}.",
                score, example.output, prediction
            );
            let ops = analyze_feedback(analysis_model.as_ref(), &settings, &feedback).await;
            apply_ops(&mut candidate, &ops);
        }

        if candidate.is_empty() {
            log::debug!(
                "Offline optimization for '{}' produced an empty playbook; keeping current",
                self.name
            );
            return;
        }

        self.persist_if_configured(&candidate);
        *self.playbook.write() = Some(candidate);
    }

    /// Apply one piece of online feedback to the playbook.
    ///
    /// A no-op when the feedback text is empty or whitespace. Otherwise the
    /// feedback (with the prediction as context) is analyzed into curator
    /// operations via the teacher model when configured, falling back to
    /// the agent's own model; the resulting operations are applied and the
    /// playbook persisted when auto-persistence is enabled.
    pub async fn apply_online_update(
        &self,
        example: Option<&Value>,
        prediction: Option<&Value>,
        feedback: &str,
    ) {
        if feedback.trim().is_empty() {
            return;
        }

        let analysis_model = self.analysis_model();
        let settings = self.descriptor.model.clone();

        let mut enriched = feedback.to_string();
        if let Some(prediction) = prediction {
            enriched.push_str(&format!("\n\nAgent output under review: {}", prediction));
        }
        if let Some(example) = example {
            enriched.push_str(&format!("\n\nOriginal input: {}", example));
        }

        let ops = analyze_feedback(analysis_model.as_ref(), &settings, &enriched).await;

        let mut playbook = self.playbook.read().clone().unwrap_or_default();
        let applied = apply_ops(&mut playbook, &ops);
        if applied == 0 {
            log::debug!(
                "Online update for '{}' changed nothing (duplicate or empty feedback)",
                self.name
            );
        }
        self.persist_if_configured(&playbook);
        *self.playbook.write() = Some(playbook);
    }

    /// Current playbook, if any.
    pub fn playbook(&self) -> Option<Playbook> {
        self.playbook.read().clone()
    }

    /// Replace the playbook. Injection into the prompt happens lazily at
    /// the next `forward` call; applying a playbook does not itself alter
    /// the instruction.
    pub fn apply_playbook(&self, playbook: Playbook) {
        *self.playbook.write() = Some(playbook);
    }
}

// ---------------------------------------------------------------------------
// AgentStream
// ---------------------------------------------------------------------------

struct StreamRecorder {
    agent_name: String,
    model: String,
    labels: MetricsLabels,
    metrics: Arc<MetricsRegistry>,
    pricing: Arc<dyn PricingLookup>,
    state: SharedState,
    history: ExecutionHistory,
    task_id: String,
    is_root: bool,
    started: Instant,
    usage: TokenUsage,
    errored: bool,
}

impl StreamRecorder {
    fn record(self) {
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_request(&self.labels, true, duration_ms);
        if self.errored {
            self.metrics.record_error(&self.labels);
        }
        self.metrics.record_tokens(&self.labels, &self.usage);
        if let Some(pricing) = self.pricing.pricing_for(&self.model) {
            let cost = calculate_cost(&self.usage, &pricing);
            if let Some(cost) = &cost {
                self.metrics
                    .record_estimated_cost(&self.labels, cost.total_cost);
            }
            track_cost_in_state(&self.agent_name, cost.as_ref(), &self.state);
        }
        if self.is_root {
            self.history.complete(&self.task_id);
        }
    }
}

/// Lazy chunk sequence from a streaming invocation.
///
/// Dropping the stream — after full consumption, part-way through, or on
/// cancellation — records the metrics, tokens, and cost observed so far,
/// exactly once.
pub struct AgentStream {
    inner: Option<crate::model::ChunkStream>,
    recorder: Option<StreamRecorder>,
}

impl AgentStream {
    /// Task id this stream's execution is attributed to.
    pub fn task_id(&self) -> Option<&str> {
        self.recorder.as_ref().map(|r| r.task_id.as_str())
    }
}

impl Stream for AgentStream {
    type Item = Result<ModelChunk, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let (Some(recorder), Some(usage)) = (self.recorder.as_mut(), chunk.usage.as_ref())
                {
                    recorder.usage.add(usage);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.errored = true;
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.record();
        }
    }
}
