//! Crew orchestrator: the top-level handle over a set of agents.
//!
//! A crew is built from a validated [`CrewConfig`] plus injected
//! collaborators (model factory, function registry, tool-server connector,
//! metrics registry, state registry, pricing). Agents are constructed
//! on demand; `add_agents` resolves construction order by fixed point over
//! the declared sub-agent edges, so callers never have to topologically
//! sort the configuration themselves.
//!
//! The crew also owns the execution history used for task attribution and
//! the entry point for routing task-level feedback into agent playbooks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{Agent, AgentBuild, MetricFn};
use crate::config::CrewConfig;
use crate::cost::{self, AggregatedCosts, PricingLookup, StaticPricing, UsageCost};
use crate::errors::{CrewError, CrewResult};
use crate::functions::{FunctionRegistry, MeteredFunction};
use crate::metrics::{default_metrics, MetricsLabels, MetricsRegistry, MetricsSnapshot};
use crate::model::ModelFactory;
use crate::servers::{NoopConnector, ToolServerConnector};
use crate::state::{default_registry, SharedState, StateRegistry};
use crate::telemetry::{NoopTelemetry, SharedTelemetry};

/// Completed executions older than this are garbage-collected by default.
const DEFAULT_EXECUTION_MAX_AGE_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Execution history
// ---------------------------------------------------------------------------

/// One root-level task execution and everything attributed to it.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Task id minted by the root-level call.
    pub task_id: String,
    /// Agent that received the root-level call.
    pub root_agent: String,
    /// Input of the root-level call.
    pub input: Value,
    /// Agents involved, in order of first involvement. The root agent is
    /// always first.
    pub involved: Vec<String>,
    /// Last recorded result per involved agent.
    pub results: HashMap<String, Value>,
    /// When the task was registered.
    pub started_at: DateTime<Utc>,
    /// When the root-level call finished; `None` while in flight.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Wall-clock duration from start to completion; undefined (`None`)
    /// while the task is still in flight.
    pub fn elapsed(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

/// Shared record of task executions across a crew.
///
/// Cloning shares the underlying store; every agent in a crew holds the
/// same history.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    records: Arc<RwLock<HashMap<String, ExecutionRecord>>>,
}

impl ExecutionHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent's involvement in a task.
    ///
    /// The first call for a task id creates the record with that agent as
    /// root; later calls add involvement without overwriting the root or
    /// the captured input.
    pub fn track(&self, task_id: &str, agent_name: &str, input: Value) {
        let mut records = self.records.write();
        match records.get_mut(task_id) {
            Some(record) => {
                if !record.involved.iter().any(|n| n == agent_name) {
                    record.involved.push(agent_name.to_string());
                }
            }
            None => {
                records.insert(
                    task_id.to_string(),
                    ExecutionRecord {
                        task_id: task_id.to_string(),
                        root_agent: agent_name.to_string(),
                        input,
                        involved: vec![agent_name.to_string()],
                        results: HashMap::new(),
                        started_at: Utc::now(),
                        completed_at: None,
                    },
                );
            }
        }
    }

    /// Record (or overwrite) an agent's result for a task.
    pub fn record_result(&self, task_id: &str, agent_name: &str, result: Value) {
        if let Some(record) = self.records.write().get_mut(task_id) {
            record.results.insert(agent_name.to_string(), result);
        }
    }

    /// Mark the root-level call of a task as finished. Idempotent.
    pub fn complete(&self, task_id: &str) {
        if let Some(record) = self.records.write().get_mut(task_id) {
            if record.completed_at.is_none() {
                record.completed_at = Some(Utc::now());
            }
        }
    }

    /// Full record for a task, if tracked.
    pub fn record(&self, task_id: &str) -> Option<ExecutionRecord> {
        self.records.read().get(task_id).cloned()
    }

    /// Agents involved in a task, root first. Empty for unknown tasks.
    pub fn involvement(&self, task_id: &str) -> Vec<String> {
        self.records
            .read()
            .get(task_id)
            .map(|r| r.involved.clone())
            .unwrap_or_default()
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no tasks are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Drop records older than `max_age`, measured from task start time.
    /// Returns the number of records removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.started_at >= cutoff);
        before - records.len()
    }
}

// ---------------------------------------------------------------------------
// Feedback routing
// ---------------------------------------------------------------------------

/// Which agents of a task receive a piece of feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackStrategy {
    /// Only the root agent of the task.
    Primary,
    /// Every agent involved in the task.
    #[default]
    All,
    /// Every involved agent. Reserved for score-weighted distribution;
    /// currently routes identically to [`FeedbackStrategy::All`].
    Weighted,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Crew`] from a configuration and injected collaborators.
pub struct CrewBuilder {
    config: CrewConfig,
    crew_id: Option<String>,
    factory: Option<Arc<dyn ModelFactory>>,
    functions: FunctionRegistry,
    connector: Arc<dyn ToolServerConnector>,
    metrics: Option<Arc<MetricsRegistry>>,
    states: Option<Arc<StateRegistry>>,
    pricing: Arc<dyn PricingLookup>,
    telemetry: Option<SharedTelemetry>,
    metric_fns: HashMap<String, MetricFn>,
}

impl CrewBuilder {
    fn new(config: CrewConfig) -> Self {
        Self {
            config,
            crew_id: None,
            factory: None,
            functions: FunctionRegistry::new(),
            connector: Arc::new(NoopConnector),
            metrics: None,
            states: None,
            pricing: Arc::new(StaticPricing),
            telemetry: None,
            metric_fns: HashMap::new(),
        }
    }

    /// Use an explicit crew id instead of a generated one.
    pub fn crew_id(mut self, id: impl Into<String>) -> Self {
        self.crew_id = Some(id.into());
        self
    }

    /// Inject the model factory. Required.
    pub fn model_factory(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Inject the function registry agents resolve their functions from.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Inject the tool-server connector. Defaults to a connector that
    /// fails every connection attempt.
    pub fn tool_server_connector(mut self, connector: Arc<dyn ToolServerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Use a dedicated metrics registry instead of the process-wide one.
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use a dedicated state registry instead of the process-wide one.
    pub fn state_registry(mut self, states: Arc<StateRegistry>) -> Self {
        self.states = Some(states);
        self
    }

    /// Replace the built-in pricing table.
    pub fn pricing(mut self, pricing: Arc<dyn PricingLookup>) -> Self {
        self.pricing = pricing;
        self
    }

    /// Attach a telemetry sink.
    pub fn telemetry(mut self, telemetry: SharedTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Register a named metric for offline optimization.
    pub fn metric(mut self, name: &str, metric: MetricFn) -> Self {
        self.metric_fns.insert(name.to_string(), metric);
        self
    }

    /// Build the crew. Fails when the configuration is invalid or no model
    /// factory was injected; no agents are constructed yet.
    pub fn build(self) -> CrewResult<Crew> {
        self.config.validate()?;
        let factory = self.factory.ok_or_else(|| {
            CrewError::configuration("Crew requires a model factory; none was injected")
        })?;

        let id = self.crew_id.unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("crew-{}", &suffix[..8])
        });

        let states = self.states.unwrap_or_else(default_registry);
        let state = states.store_for(&id);
        let telemetry: SharedTelemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(NoopTelemetry));

        let mut span = telemetry.span(
            "crew_creation",
            HashMap::from([("crew_id".to_string(), id.clone())]),
        );
        span.set_attribute("agent_count", self.config.agents.len().to_string());
        span.end();

        log::info!(
            "Created crew '{}' with {} configured agents",
            id,
            self.config.agents.len()
        );

        Ok(Crew {
            id,
            config: self.config,
            factory,
            functions: self.functions,
            connector: self.connector,
            metrics: self.metrics.unwrap_or_else(default_metrics),
            states,
            pricing: self.pricing,
            telemetry,
            metric_fns: self.metric_fns,
            state,
            agents: RwLock::new(HashMap::new()),
            history: ExecutionHistory::new(),
            destroyed: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Crew
// ---------------------------------------------------------------------------

/// A set of agents sharing one state store, metrics scope, and execution
/// history.
pub struct Crew {
    id: String,
    config: CrewConfig,
    factory: Arc<dyn ModelFactory>,
    functions: FunctionRegistry,
    connector: Arc<dyn ToolServerConnector>,
    metrics: Arc<MetricsRegistry>,
    states: Arc<StateRegistry>,
    pricing: Arc<dyn PricingLookup>,
    telemetry: SharedTelemetry,
    metric_fns: HashMap<String, MetricFn>,
    state: SharedState,
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    history: ExecutionHistory,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crew")
            .field("id", &self.id)
            .field("configured", &self.config.agents.len())
            .field("added", &self.agents.read().len())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Crew {
    /// Start building a crew from a configuration.
    pub fn builder(config: CrewConfig) -> CrewBuilder {
        CrewBuilder::new(config)
    }

    /// Crew id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configuration this crew was built from.
    pub fn config(&self) -> &CrewConfig {
        &self.config
    }

    /// The crew's shared state store.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// The crew's execution history.
    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    fn ensure_alive(&self) -> CrewResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(CrewError::Destroyed)
        } else {
            Ok(())
        }
    }

    // -- Agent construction -----------------------------------------------

    /// Construct one agent by name and add it to the crew. Idempotent: an
    /// already-added agent is returned as-is.
    ///
    /// Every sub-agent named by the descriptor must already be present;
    /// otherwise this fails with the missing names and nothing is added.
    /// Use [`Crew::add_agents`] to have construction order resolved
    /// automatically.
    pub async fn add_agent(&self, name: &str) -> CrewResult<Arc<Agent>> {
        self.ensure_alive()?;

        if let Some(existing) = self.agents.read().get(name) {
            return Ok(existing.clone());
        }

        let descriptor = self
            .config
            .descriptor(name)
            .ok_or_else(|| CrewError::AgentNotFound {
                name: name.to_string(),
            })?
            .clone();

        // Sub-agents resolve hard: a missing dependency fails construction.
        let mut sub_agents = HashMap::new();
        let mut unresolved = Vec::new();
        {
            let agents = self.agents.read();
            for dep in &descriptor.sub_agents {
                match agents.get(dep) {
                    Some(agent) => {
                        sub_agents.insert(dep.clone(), agent.clone());
                    }
                    None => unresolved.push(dep.clone()),
                }
            }
        }
        if !unresolved.is_empty() {
            return Err(CrewError::Dependency { unresolved });
        }

        let mut span = self.telemetry.span(
            "agent_creation",
            HashMap::from([
                ("crew_id".to_string(), self.id.clone()),
                ("agent".to_string(), name.to_string()),
            ]),
        );

        let client = self.factory.create(&descriptor)?;
        let labels = MetricsLabels::new(&self.id, name, client.provider(), client.model());

        // Function names resolve soft (unknown names are skipped); a name
        // shadowed by a sub-agent is dropped in favor of the sub-agent.
        let function_names: Vec<String> = descriptor
            .functions
            .iter()
            .filter(|f| {
                if sub_agents.contains_key(*f) {
                    log::warn!(
                        "Agent '{}': function '{}' shadowed by sub-agent of the same name",
                        name,
                        f
                    );
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        let mut functions = self.functions.resolve_names(&function_names, &self.state);

        // Tool-server connections fail hard; a crew with a dead server is
        // not left half-initialized.
        for (server_name, server_config) in &descriptor.tool_servers {
            let server_functions = self.connector.connect(server_name, server_config).await?;
            for function in server_functions {
                if sub_agents.contains_key(function.name()) {
                    log::warn!(
                        "Agent '{}': server function '{}' shadowed by sub-agent",
                        name,
                        function.name()
                    );
                    continue;
                }
                functions.push(function);
            }
        }

        let functions: Vec<Arc<dyn crate::functions::CrewFunction>> = functions
            .into_iter()
            .map(|f| {
                Arc::new(MeteredFunction::new(f, labels.clone(), self.metrics.clone()))
                    as Arc<dyn crate::functions::CrewFunction>
            })
            .collect();

        let agent = Arc::new(Agent::new(AgentBuild {
            crew_id: self.id.clone(),
            descriptor: descriptor.clone(),
            client,
            functions,
            sub_agents,
            state: self.state.clone(),
            history: self.history.clone(),
            metrics: self.metrics.clone(),
            pricing: self.pricing.clone(),
        }));

        if let Some(learning) = &descriptor.learning {
            agent.init_learning(learning, self.factory.as_ref());
            if learning.compile_on_start {
                self.compile_agent(&agent, learning.metric.as_deref()).await;
            }
        }

        span.set_attribute("functions", agent.functions().len().to_string());
        span.end();
        log::debug!("Added agent '{}' to crew '{}'", name, self.id);

        // The early existence check raced with the awaits above: a
        // concurrent call for the same name may have stored its agent
        // first. Keep the first stored instance and return it, so every
        // caller's handle is the one feedback routing sees.
        let stored = self
            .agents
            .write()
            .entry(name.to_string())
            .or_insert_with(|| agent.clone())
            .clone();
        Ok(stored)
    }

    /// Run an agent's offline optimization pass, resolving its configured
    /// metric by name. Missing metrics or examples are logged and skipped,
    /// never fatal to agent construction.
    async fn compile_agent(&self, agent: &Arc<Agent>, metric_name: Option<&str>) {
        let Some(metric_name) = metric_name else {
            log::warn!(
                "Agent '{}' has compile_on_start without a metric; skipping",
                agent.name()
            );
            return;
        };
        let Some(metric) = self.metric_fns.get(metric_name) else {
            log::warn!(
                "Agent '{}': metric '{}' is not registered; skipping optimization",
                agent.name(),
                metric_name
            );
            return;
        };
        let examples = agent.descriptor().examples.clone();
        if examples.is_empty() {
            log::warn!(
                "Agent '{}' has compile_on_start but no examples; skipping",
                agent.name()
            );
            return;
        }
        agent.optimize_offline(metric.clone(), &examples).await;
    }

    /// Add a set of agents, resolving construction order by fixed point.
    ///
    /// Each pass constructs every requested agent whose sub-agents are
    /// already present; passes repeat until the set is exhausted. A pass
    /// that makes no progress means the remainder is unconstructible
    /// (missing or cyclic dependencies) and fails with every remaining
    /// name — nothing about the remainder is added.
    pub async fn add_agents(&self, names: &[&str]) -> CrewResult<Vec<Arc<Agent>>> {
        self.ensure_alive()?;

        // Validate names up front so one typo doesn't surface as a
        // dependency error after half the set was constructed.
        for name in names {
            if self.config.descriptor(name).is_none() {
                return Err(CrewError::AgentNotFound {
                    name: name.to_string(),
                });
            }
        }

        let mut pending: Vec<&str> = {
            let mut seen: HashSet<&str> = HashSet::new();
            names
                .iter()
                .copied()
                .filter(|n| seen.insert(*n))
                .collect()
        };
        let mut added = Vec::new();

        while !pending.is_empty() {
            let mut remaining = Vec::new();
            let mut progressed = false;

            for name in pending {
                let ready = {
                    let agents = self.agents.read();
                    self.config
                        .descriptor(name)
                        .map(|d| d.sub_agents.iter().all(|dep| agents.contains_key(dep)))
                        .unwrap_or(false)
                };
                if ready {
                    added.push(self.add_agent(name).await?);
                    progressed = true;
                } else {
                    remaining.push(name);
                }
            }

            if !progressed && !remaining.is_empty() {
                // Cyclic or unsatisfiable: report the whole remainder, not
                // just the first offender.
                return Err(CrewError::Dependency {
                    unresolved: remaining.iter().map(|n| n.to_string()).collect(),
                });
            }
            pending = remaining;
        }

        Ok(added)
    }

    /// Add every configured agent, in dependency order.
    pub async fn add_all_agents(&self) -> CrewResult<Vec<Arc<Agent>>> {
        let names = self.config.agent_names();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.add_agents(&refs).await
    }

    /// Look up an added agent by name.
    pub fn agent(&self, name: &str) -> CrewResult<Arc<Agent>> {
        self.ensure_alive()?;
        self.agents
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CrewError::AgentNotFound {
                name: name.to_string(),
            })
    }

    /// Names of agents added so far.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    // -- Execution tracking ------------------------------------------------

    /// Register an agent's involvement in a task (see
    /// [`ExecutionHistory::track`]).
    pub fn track_agent_execution(&self, task_id: &str, agent_name: &str, input: Value) {
        self.history.track(task_id, agent_name, input);
    }

    /// Record an agent's result for a task.
    pub fn record_agent_result(&self, task_id: &str, agent_name: &str, result: Value) {
        self.history.record_result(task_id, agent_name, result);
    }

    /// Full execution record for a task: root agent, involved agents
    /// (root first), original input, per-agent results, and elapsed
    /// duration through [`ExecutionRecord::elapsed`]. `None` for unknown
    /// tasks.
    pub fn task_agent_involvement(&self, task_id: &str) -> Option<ExecutionRecord> {
        self.history.record(task_id)
    }

    /// Garbage-collect old execution records. `max_age` defaults to one
    /// hour. Returns the number of records removed.
    pub fn cleanup_old_executions(&self, max_age: Option<Duration>) -> usize {
        let max_age = max_age.unwrap_or_else(|| Duration::seconds(DEFAULT_EXECUTION_MAX_AGE_SECS));
        self.history.cleanup_older_than(max_age)
    }

    // -- Feedback routing --------------------------------------------------

    /// Route task-level feedback into agent playbooks.
    ///
    /// Target agents are selected by `strategy` from the task's execution
    /// record. Blank feedback and unknown task ids are no-ops. A failure
    /// updating one agent never prevents the others from being updated.
    /// Returns the number of agents that received the feedback.
    pub async fn apply_task_feedback(
        &self,
        task_id: &str,
        feedback: &str,
        strategy: FeedbackStrategy,
    ) -> CrewResult<usize> {
        self.ensure_alive()?;
        if feedback.trim().is_empty() {
            return Ok(0);
        }

        let Some(record) = self.history.record(task_id) else {
            log::warn!(
                "Feedback for unknown task '{}' in crew '{}'; ignoring",
                task_id,
                self.id
            );
            return Ok(0);
        };

        let targets: Vec<String> = match strategy {
            FeedbackStrategy::Primary => vec![record.root_agent.clone()],
            FeedbackStrategy::All | FeedbackStrategy::Weighted => record.involved.clone(),
        };

        let mut updated = 0;
        for target in targets {
            let agent = match self.agents.read().get(&target) {
                Some(agent) => agent.clone(),
                None => {
                    log::warn!(
                        "Task '{}' involved agent '{}' which is no longer in crew '{}'",
                        task_id,
                        target,
                        self.id
                    );
                    continue;
                }
            };
            agent
                .apply_online_update(
                    Some(&record.input),
                    record.results.get(&target),
                    feedback,
                )
                .await;
            updated += 1;
        }
        Ok(updated)
    }

    // -- Costs and metrics -------------------------------------------------

    /// Exact aggregated costs across the crew's state store.
    pub fn aggregated_costs(&self) -> AggregatedCosts {
        cost::aggregated_costs(&self.state)
    }

    /// One agent's accumulated cost, if any was tracked.
    pub fn agent_cost(&self, agent_name: &str) -> Option<UsageCost> {
        cost::agent_cost(agent_name, &self.state)
    }

    /// Clear all cost entries from the crew state.
    pub fn reset_costs(&self) {
        cost::reset_costs(&self.state);
    }

    /// Merged metrics snapshot over every agent in this crew.
    pub fn crew_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot_crew(&self.id)
    }

    /// Clear every metrics bucket belonging to this crew.
    pub fn reset_crew_metrics(&self) {
        self.metrics.reset_crew(&self.id);
    }

    // -- Teardown ----------------------------------------------------------

    /// Tear the crew down: drop all agents, clear the execution history,
    /// and remove the crew's state store from the registry. Subsequent
    /// operations fail with [`CrewError::Destroyed`]. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.agents.write().clear();
        self.history.clear();
        self.states.teardown(&self.id);
        log::info!("Destroyed crew '{}'", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentDescriptor, LearningConfig};
    use crate::functions::FnFunction;
    use crate::model::MockModelFactory;
    use serde_json::json;

    fn three_agent_config() -> CrewConfig {
        CrewConfig::new(vec![
            AgentDescriptor::new("writer", "openai", "gpt-4o-mini")
                .with_sub_agents(vec!["researcher".to_string(), "planner".to_string()]),
            AgentDescriptor::new("researcher", "openai", "gpt-4o-mini")
                .with_sub_agents(vec!["planner".to_string()]),
            AgentDescriptor::new("planner", "openai", "gpt-4o-mini"),
        ])
        .unwrap()
    }

    fn build_crew(config: CrewConfig) -> Crew {
        let _ = env_logger::builder().is_test(true).try_init();
        Crew::builder(config)
            .crew_id(format!("crew-{}", Uuid::new_v4().simple()))
            .model_factory(Arc::new(MockModelFactory))
            .metrics(Arc::new(MetricsRegistry::new()))
            .state_registry(Arc::new(StateRegistry::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_model_factory() {
        let result = Crew::builder(three_agent_config()).build();
        assert!(matches!(result, Err(CrewError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_add_agents_resolves_dependency_order() {
        let crew = build_crew(three_agent_config());

        // Declaration order is writer -> researcher -> planner, the
        // reverse of construction order; the fixed point sorts it out.
        let added = crew
            .add_agents(&["writer", "researcher", "planner"])
            .await
            .unwrap();
        assert_eq!(added.len(), 3);

        let writer = crew.agent("writer").unwrap();
        assert!(writer.sub_agents().contains_key("researcher"));
        assert!(writer.sub_agents().contains_key("planner"));
    }

    #[tokio::test]
    async fn test_add_agent_missing_dependency_fails_whole() {
        let crew = build_crew(three_agent_config());

        let err = crew.add_agent("writer").await.unwrap_err();
        match err {
            CrewError::Dependency { unresolved } => {
                assert_eq!(unresolved.len(), 2);
                assert!(unresolved.contains(&"researcher".to_string()));
                assert!(unresolved.contains(&"planner".to_string()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Nothing was added.
        assert!(crew.agent("writer").is_err());
    }

    #[tokio::test]
    async fn test_add_agents_cycle_reports_remainder() {
        let config = CrewConfig::new(vec![
            AgentDescriptor::new("a", "openai", "gpt-4o-mini")
                .with_sub_agents(vec!["b".to_string()]),
            AgentDescriptor::new("b", "openai", "gpt-4o-mini")
                .with_sub_agents(vec!["a".to_string()]),
            AgentDescriptor::new("c", "openai", "gpt-4o-mini"),
        ])
        .unwrap();
        let crew = build_crew(config);

        let err = crew.add_agents(&["a", "b", "c"]).await.unwrap_err();
        match err {
            CrewError::Dependency { unresolved } => {
                assert_eq!(unresolved.len(), 2);
                assert!(unresolved.contains(&"a".to_string()));
                assert!(unresolved.contains(&"b".to_string()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // The constructible part of the set was still added.
        assert!(crew.agent("c").is_ok());
    }

    #[tokio::test]
    async fn test_add_agent_idempotent() {
        let crew = build_crew(three_agent_config());
        let first = crew.add_agent("planner").await.unwrap();
        let second = crew.add_agent("planner").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_add_agent_shares_one_instance() {
        let crew = build_crew(three_agent_config());

        // Both calls run on the same task and may interleave across the
        // await points inside add_agent; whoever loses must still get the
        // stored instance, not its own orphan.
        let (a, b) = tokio::join!(crew.add_agent("planner"), crew.add_agent("planner"));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &crew.agent("planner").unwrap()));
    }

    #[tokio::test]
    async fn test_add_agent_unknown_name() {
        let crew = build_crew(three_agent_config());
        assert!(matches!(
            crew.add_agent("ghost").await,
            Err(CrewError::AgentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_functions_resolved_and_unknown_skipped() {
        let config = CrewConfig::new(vec![AgentDescriptor::new("worker", "openai", "gpt-4o-mini")
            .with_functions(vec!["lookup".to_string(), "missing".to_string()])])
        .unwrap();

        let mut functions = FunctionRegistry::new();
        functions.register(Arc::new(FnFunction::new("lookup", |input| Ok(input))));

        let crew = Crew::builder(config)
            .model_factory(Arc::new(MockModelFactory))
            .functions(functions)
            .metrics(Arc::new(MetricsRegistry::new()))
            .state_registry(Arc::new(StateRegistry::new()))
            .build()
            .unwrap();

        let agent = crew.add_agent("worker").await.unwrap();
        // "missing" was skipped, not fatal.
        assert_eq!(agent.functions().len(), 1);
        assert_eq!(agent.functions()[0].name(), "lookup");
    }

    #[tokio::test]
    async fn test_end_to_end_costs_and_metrics() {
        let crew = build_crew(three_agent_config());
        crew.add_all_agents().await.unwrap();

        let planner = crew.agent("planner").unwrap();
        let researcher = crew.agent("researcher").unwrap();
        planner.forward(json!("plan the work")).await.unwrap();
        researcher.forward(json!("find sources")).await.unwrap();

        let metrics = crew.crew_metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.errors, 0);
        assert_eq!(metrics.error_rate, 0.0);
        // Mock usage is 10/5 per call.
        assert_eq!(metrics.prompt_tokens, 20);

        let costs = crew.aggregated_costs();
        assert_eq!(costs.by_agent.len(), 2);
        let sum: rust_decimal::Decimal = costs.by_agent.values().map(|c| c.total_cost).sum();
        assert_eq!(costs.total.total_cost, sum);

        crew.reset_costs();
        assert!(crew.aggregated_costs().by_agent.is_empty());
        crew.reset_crew_metrics();
        assert_eq!(crew.crew_metrics().requests, 0);
    }

    #[tokio::test]
    async fn test_execution_tracking_and_feedback_primary() {
        let crew = build_crew(three_agent_config());
        crew.add_all_agents().await.unwrap();

        let writer = crew.agent("writer").unwrap();
        let output = writer.forward(json!("draft the intro")).await.unwrap();

        // A sub-agent joins the same task through the call context.
        let ctx = crate::agent::CallContext::new(output.task_id.clone());
        let planner = crew.agent("planner").unwrap();
        planner
            .forward_with_context(json!("outline"), &ctx)
            .await
            .unwrap();

        let record = crew.task_agent_involvement(&output.task_id).unwrap();
        assert_eq!(record.root_agent, "writer");
        assert_eq!(record.involved, vec!["writer", "planner"]);
        assert_eq!(record.input, json!("draft the intro"));
        assert!(record.results.contains_key("planner"));
        assert!(record.elapsed().is_some());

        let updated = crew
            .apply_task_feedback(&output.task_id, "Keep intros short", FeedbackStrategy::Primary)
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert!(writer.playbook().is_some());
        assert!(planner.playbook().is_none());
    }

    #[tokio::test]
    async fn test_feedback_all_reaches_every_involved_agent() {
        let crew = build_crew(three_agent_config());
        crew.add_all_agents().await.unwrap();

        let writer = crew.agent("writer").unwrap();
        let output = writer.forward(json!("draft")).await.unwrap();
        let ctx = crate::agent::CallContext::new(output.task_id.clone());
        let researcher = crew.agent("researcher").unwrap();
        researcher
            .forward_with_context(json!("sources"), &ctx)
            .await
            .unwrap();

        let updated = crew
            .apply_task_feedback(&output.task_id, "Cite primary sources", FeedbackStrategy::All)
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert!(writer.playbook().is_some());
        assert!(researcher.playbook().is_some());
        assert!(crew.agent("planner").unwrap().playbook().is_none());
    }

    #[tokio::test]
    async fn test_feedback_noops() {
        let crew = build_crew(three_agent_config());
        crew.add_all_agents().await.unwrap();

        let blank = crew
            .apply_task_feedback("task-1", "   ", FeedbackStrategy::All)
            .await
            .unwrap();
        assert_eq!(blank, 0);

        let unknown = crew
            .apply_task_feedback("task-unknown", "feedback", FeedbackStrategy::All)
            .await
            .unwrap();
        assert_eq!(unknown, 0);
    }

    #[tokio::test]
    async fn test_cleanup_old_executions() {
        let crew = build_crew(three_agent_config());
        crew.add_all_agents().await.unwrap();

        let planner = crew.agent("planner").unwrap();
        planner.forward(json!("x")).await.unwrap();
        assert_eq!(crew.history().len(), 1);

        // Nothing is an hour old yet.
        assert_eq!(crew.cleanup_old_executions(None), 0);
        // A zero max age sweeps everything.
        assert_eq!(crew.cleanup_old_executions(Some(Duration::zero())), 1);
        assert!(crew.history().is_empty());
    }

    #[test]
    fn test_cleanup_age_measured_from_start() {
        let history = ExecutionHistory::new();
        history.track("t1", "writer", json!("in"));
        history.complete("t1");

        // A task started two hours ago is eligible even though it
        // completed just now.
        history.records.write().get_mut("t1").unwrap().started_at =
            Utc::now() - Duration::hours(2);
        assert_eq!(history.cleanup_older_than(Duration::hours(1)), 1);
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_semantics() {
        let states = Arc::new(StateRegistry::new());
        let crew = Crew::builder(three_agent_config())
            .crew_id("crew-destroy")
            .model_factory(Arc::new(MockModelFactory))
            .metrics(Arc::new(MetricsRegistry::new()))
            .state_registry(states.clone())
            .build()
            .unwrap();
        crew.add_all_agents().await.unwrap();
        assert_eq!(states.len(), 1);

        crew.destroy();
        crew.destroy(); // idempotent

        assert_eq!(states.len(), 0);
        assert!(matches!(crew.agent("planner"), Err(CrewError::Destroyed)));
        assert!(matches!(
            crew.add_agent("planner").await,
            Err(CrewError::Destroyed)
        ));
        assert!(matches!(
            crew.apply_task_feedback("t", "f", FeedbackStrategy::All)
                .await,
            Err(CrewError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_compile_on_start_missing_metric_is_skipped() {
        let config = CrewConfig::new(vec![AgentDescriptor::new("learner", "openai", "gpt-4o-mini")
            .with_learning(LearningConfig {
                teacher_model: None,
                persist_path: None,
                auto_persist: false,
                compile_on_start: true,
                metric: Some("exact_match".to_string()),
            })])
        .unwrap();
        let crew = build_crew(config);

        // Metric never registered: the agent still comes up, unoptimized.
        let agent = crew.add_agent("learner").await.unwrap();
        assert!(agent.playbook().is_none());
    }

    #[test]
    fn test_history_track_preserves_root() {
        let history = ExecutionHistory::new();
        history.track("t1", "writer", json!("in"));
        history.track("t1", "planner", json!("ignored"));
        history.track("t1", "planner", json!("ignored again"));

        let record = history.record("t1").unwrap();
        assert_eq!(record.root_agent, "writer");
        assert_eq!(record.input, json!("in"));
        assert_eq!(record.involved, vec!["writer", "planner"]);
        assert!(record.completed_at.is_none());

        history.complete("t1");
        assert!(history.record("t1").unwrap().completed_at.is_some());
    }

    #[test]
    fn test_elapsed_undefined_while_in_flight() {
        let history = ExecutionHistory::new();
        history.track("t1", "writer", json!("in"));
        assert!(history.record("t1").unwrap().elapsed().is_none());

        history.complete("t1");
        let elapsed = history.record("t1").unwrap().elapsed().unwrap();
        assert!(elapsed >= Duration::zero());
    }

    #[test]
    fn test_history_result_overwrite() {
        let history = ExecutionHistory::new();
        history.track("t1", "writer", json!("in"));
        history.record_result("t1", "writer", json!({"draft": 1}));
        history.record_result("t1", "writer", json!({"draft": 2}));

        let record = history.record("t1").unwrap();
        assert_eq!(record.results["writer"], json!({"draft": 2}));
    }
}
