//! Run driver: plans the graph, dispatches ready nodes concurrently and
//! records one terminal result per node.
//!
//! A node is ready once every direct predecessor is terminal, whatever the
//! predecessor's status. Failures never stop siblings or dependents; the
//! dependents simply see empty text for `{{failed}}` references.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowrun_core::config::{EngineConfig, EngineSection};
use flowrun_core::error::{FlowError, Result};
use flowrun_core::event::{EventBus, FlowEvent};
use flowrun_core::types::{ExecutionResult, Graph, Node, NodeStatus, RunId};

use crate::executors::{
    top_level_fields, ExecutorRegistry, NodeContext, NodeExecutor, NodeFailure, NodeOutput,
    NodeResult, WEBHOOK_IN,
};
use crate::graph::{resolve_plan, ExecutionPlan};
use crate::store::{ResultStore, RunReport};
use crate::trigger::WebhookTriggerConfig;
use crate::variables::VariableScope;

/// What a run starts from.
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    /// Input of root nodes (`{{input}}` for nodes without predecessors).
    pub initial_input: Value,
    /// Body of the inbound request that triggered the run, if any.
    pub trigger_payload: Option<Value>,
}

impl RunInput {
    pub fn new(initial_input: Value) -> Self {
        Self {
            initial_input,
            trigger_payload: None,
        }
    }

    pub fn with_trigger(mut self, payload: Value) -> Self {
        self.trigger_payload = Some(payload);
        self
    }
}

/// Executes flow graphs.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<ExecutorRegistry>,
    config: EngineSection,
    events: Arc<EventBus>,
}

impl Engine {
    pub fn new(registry: ExecutorRegistry, config: &EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: config.engine.clone(),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn plan(&self, graph: &Graph) -> Result<ExecutionPlan> {
        resolve_plan(graph)
    }

    /// Validate the graph and every node's configuration without running.
    ///
    /// Graph-level problems are returned as `Err`; node-level problems are
    /// listed per node.
    pub fn check(&self, graph: &Graph) -> Result<Vec<(String, FlowError)>> {
        resolve_plan(graph)?;
        Ok(graph
            .nodes
            .iter()
            .filter(|n| !n.disabled && !n.bypassed)
            .filter_map(|n| self.executor_for(n).err().map(|e| (n.id.clone(), e)))
            .collect())
    }

    /// Executor for a dispatchable node; `None` for the passive trigger node.
    fn executor_for(&self, node: &Node) -> Result<Option<Arc<dyn NodeExecutor>>> {
        if node.node_type == WEBHOOK_IN {
            WebhookTriggerConfig::from_node(node)?;
            return Ok(None);
        }
        let executor = self
            .registry
            .get(&node.node_type)
            .ok_or_else(|| FlowError::UnsupportedNodeType(node.node_type.clone()))?;
        executor.validate(node)?;
        Ok(Some(executor))
    }

    pub async fn run(
        &self,
        graph: &Graph,
        input: RunInput,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.run_with_id(RunId::new(), graph, input, cancel).await
    }

    /// Run `graph` to completion (or cancellation) under a caller-chosen id.
    ///
    /// Only graph-level errors (cycles, dangling edges, duplicate ids) are
    /// returned as `Err`; they are detected before any node starts.
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        graph: &Graph,
        input: RunInput,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let plan = resolve_plan(graph)?;
        let started_at = Utc::now();

        let nodes: HashMap<&str, &Node> = graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut aliases = HashMap::new();
        for node in &graph.nodes {
            if let Some(label) = &node.label {
                aliases.entry(label.clone()).or_insert_with(|| node.id.clone());
            }
        }

        let mut state = RunState {
            run_id: run_id.clone(),
            remaining: plan
                .order()
                .iter()
                .map(|id| (id.clone(), plan.in_degree(id)))
                .collect(),
            ready: plan.roots().into_iter().map(String::from).collect(),
            store: ResultStore::new(plan.order().iter().cloned()),
            events: self.events.clone(),
            cancelled: false,
            plan,
        };

        info!(run_id = %run_id, nodes = state.plan.len(), "Run started");
        self.events.publish(FlowEvent::RunStarted {
            run_id: run_id.clone(),
            node_count: state.plan.len(),
        });

        let semaphore = (self.config.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrency)));
        let mut tasks: JoinSet<ExecutionResult> = JoinSet::new();
        let mut grace_deadline: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() && !state.cancelled {
                warn!(run_id = %run_id, in_flight = tasks.len(), "Run cancelled");
                state.cancel().await;
                grace_deadline = Some(Instant::now() + Duration::from_millis(self.config.cancel_grace_ms));
            }

            while let Some(id) = state.ready.pop_front() {
                let Some(node) = nodes.get(id.as_str()).copied() else {
                    continue;
                };
                if let Some(spawn) = self.prepare(&mut state, node, &aliases, &input, &cancel).await {
                    tasks.spawn(run_node(spawn, semaphore.clone(), state.store.clone()));
                }
            }

            if tasks.is_empty() {
                break;
            }

            let deadline = grace_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                Some(joined) = tasks.join_next() => match joined {
                    Ok(result) => state.complete(result).await,
                    Err(e) => error!(run_id = %run_id, error = %e, "Node task failed to join"),
                },
                _ = cancel.cancelled(), if !state.cancelled => {}
                _ = tokio::time::sleep_until(deadline), if grace_deadline.is_some() => {
                    warn!(run_id = %run_id, in_flight = tasks.len(), "Grace period over, aborting nodes");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(result) = joined {
                            state.complete(result).await;
                        }
                    }
                    break;
                }
                else => break,
            }
        }

        state.settle_leftovers().await;

        let report = state
            .store
            .report(run_id.clone(), state.plan.order(), started_at, state.cancelled)
            .await;
        let (succeeded, failed, skipped) = (
            report.count(NodeStatus::Success),
            report.count(NodeStatus::Error),
            report.count(NodeStatus::Skipped),
        );
        info!(run_id = %run_id, succeeded, failed, skipped, cancelled = state.cancelled, "Run finished");
        self.events.publish(FlowEvent::RunFinished {
            run_id,
            succeeded,
            failed,
            skipped,
            cancelled: state.cancelled,
        });
        Ok(report)
    }

    /// Settle nodes that need no executor, or build the task for one that does.
    async fn prepare(
        &self,
        state: &mut RunState,
        node: &Node,
        aliases: &HashMap<String, String>,
        input: &RunInput,
        cancel: &CancellationToken,
    ) -> Option<NodeSpawn> {
        let snapshot = state.store.snapshot().await;
        let predecessors = state.plan.predecessors(&node.id).to_vec();
        let (input_value, input_warnings) =
            node_input(&predecessors, &snapshot, &input.initial_input);

        if node.disabled {
            debug!(node_id = %node.id, "Node disabled, skipping");
            state.complete(skipped(&node.id, "node is disabled")).await;
            return None;
        }

        if node.bypassed {
            debug!(node_id = %node.id, "Node bypassed, forwarding input");
            let mut out = NodeOutput::new(input_value);
            out.warnings = input_warnings;
            state.complete(success_result(&node.id, out, vec![])).await;
            return None;
        }

        let executor = match self.executor_for(node) {
            Ok(Some(executor)) => executor,
            Ok(None) => {
                let payload = input
                    .trigger_payload
                    .clone()
                    .unwrap_or_else(|| input.initial_input.clone());
                let fields = top_level_fields(&payload);
                let mut out = NodeOutput::new(payload);
                out.fields = fields;
                state.complete(success_result(&node.id, out, vec![])).await;
                return None;
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Node rejected before dispatch");
                state
                    .complete(failure_result(&node.id, e.into(), input_warnings))
                    .await;
                return None;
            }
        };

        let ctx = NodeContext::new(
            state.run_id.clone(),
            node.clone(),
            input_value,
            VariableScope {
                results: snapshot,
                predecessors,
                aliases: aliases.clone(),
                input: String::new(),
            },
            cancel.clone(),
            self.events.clone(),
        );
        for warning in input_warnings {
            ctx.warn(warning);
        }

        let limit = node.timeout_ms.map(Duration::from_millis).or_else(|| {
            (self.config.node_timeout_secs > 0)
                .then(|| Duration::from_secs(self.config.node_timeout_secs))
        });

        Some(NodeSpawn {
            executor,
            ctx,
            limit,
        })
    }
}

/// Mutable bookkeeping for one run, owned by the driver loop.
struct RunState {
    run_id: RunId,
    plan: ExecutionPlan,
    store: ResultStore,
    events: Arc<EventBus>,
    /// Unfinished predecessor count per node.
    remaining: HashMap<String, usize>,
    ready: VecDeque<String>,
    cancelled: bool,
}

impl RunState {
    /// Record a terminal result and release successors that became ready.
    async fn complete(&mut self, result: ExecutionResult) {
        let node_id = result.node_id.clone();
        let status = result.status;
        let error_text = result.error.clone();
        let warnings = result.warnings.clone();

        if !self.store.finish(result).await {
            return;
        }

        for message in warnings {
            self.events.publish(FlowEvent::DependencyWarning {
                run_id: self.run_id.clone(),
                node_id: node_id.clone(),
                message,
            });
        }
        match &error_text {
            Some(e) => info!(run_id = %self.run_id, node_id = %node_id, %status, error = %e, "Node finished"),
            None => info!(run_id = %self.run_id, node_id = %node_id, %status, "Node finished"),
        }
        self.events.publish(FlowEvent::NodeFinished {
            run_id: self.run_id.clone(),
            node_id: node_id.clone(),
            status,
            error: error_text,
        });

        if self.cancelled {
            return;
        }
        for succ in self.plan.successors(&node_id) {
            if let Some(count) = self.remaining.get_mut(succ) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push_back(succ.clone());
                }
            }
        }
    }

    /// Stop dispatching and mark every not-yet-started node skipped.
    async fn cancel(&mut self) {
        self.cancelled = true;
        self.ready.clear();
        let order = self.plan.order().to_vec();
        for id in order {
            if self.store.status(&id).await == Some(NodeStatus::Pending) {
                self.complete(skipped(&id, "run cancelled before the node started"))
                    .await;
            }
        }
    }

    /// Give every node still without a terminal result one.
    async fn settle_leftovers(&mut self) {
        let order = self.plan.order().to_vec();
        for id in order {
            let result = match self.store.status(&id).await {
                Some(NodeStatus::Running) if self.cancelled => {
                    failure_result(&id, FlowError::Cancelled.into(), vec![])
                }
                Some(NodeStatus::Running) => failure_result(
                    &id,
                    FlowError::ExecutorPanic("node task ended without a result".into()).into(),
                    vec![],
                ),
                Some(NodeStatus::Pending) => skipped(&id, "node never became ready"),
                _ => continue,
            };
            self.complete(result).await;
        }
    }
}

/// A node ready to run on its own task.
struct NodeSpawn {
    executor: Arc<dyn NodeExecutor>,
    ctx: NodeContext,
    limit: Option<Duration>,
}

async fn run_node(
    spawn: NodeSpawn,
    semaphore: Option<Arc<Semaphore>>,
    store: ResultStore,
) -> ExecutionResult {
    let NodeSpawn {
        executor,
        ctx,
        limit,
    } = spawn;
    let node_id = ctx.node.id.clone();

    let _permit = match semaphore {
        Some(semaphore) => tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return skipped(&node_id, "run cancelled before the node started"),
            permit = semaphore.acquire_owned() => permit.ok(),
        },
        None => None,
    };

    if !store.mark_running(&node_id).await {
        // Settled elsewhere (cancellation sweep); the store ignores this.
        return skipped(&node_id, "run cancelled before the node started");
    }
    ctx.events.publish(FlowEvent::NodeStarted {
        run_id: ctx.run_id.clone(),
        node_id: node_id.clone(),
    });
    debug!(node_id = %node_id, node_type = %ctx.node.node_type, "Node started");

    let work = AssertUnwindSafe(executor.execute(&ctx)).catch_unwind();
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(caught) => caught,
            Err(_) => Ok(Err(FlowError::NodeTimeout(limit.as_millis() as u64).into())),
        },
        None => work.await,
    };
    let outcome: NodeResult = outcome
        .unwrap_or_else(|panic| Err(FlowError::ExecutorPanic(panic_message(panic.as_ref())).into()));

    let warnings = ctx.take_warnings();
    match outcome {
        Ok(out) => success_result(&node_id, out, warnings),
        Err(failure) => failure_result(&node_id, failure, warnings),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Input for a node: the run input for roots, the raw output of a single
/// predecessor, or the joined text of several.
fn node_input(
    predecessors: &[String],
    results: &HashMap<String, ExecutionResult>,
    initial: &Value,
) -> (Value, Vec<String>) {
    let mut warnings = Vec::new();
    let mut usable = |id: &String| match results.get(id) {
        Some(r) if r.status == NodeStatus::Success => Some(r),
        Some(r) => {
            warnings.push(format!("input from {id} is unavailable ({})", r.status));
            None
        }
        None => {
            warnings.push(format!("input from {id} is unavailable (unknown node)"));
            None
        }
    };

    let value = match predecessors {
        [] => initial.clone(),
        [only] => usable(only).map(|r| r.output.clone()).unwrap_or(Value::Null),
        many => {
            let parts: Vec<String> = many
                .iter()
                .filter_map(|id| usable(id).map(ExecutionResult::output_text))
                .collect();
            Value::String(parts.join("\n\n"))
        }
    };
    (value, warnings)
}

fn success_result(node_id: &str, out: NodeOutput, mut warnings: Vec<String>) -> ExecutionResult {
    warnings.extend(out.warnings);
    let mut r = ExecutionResult::pending(node_id);
    r.status = NodeStatus::Success;
    r.output = out.output;
    r.fields = out.fields;
    r.projection = out.projection;
    r.usage = out.usage;
    r.cost_usd = out.cost_usd;
    r.agent_steps = out.agent_steps;
    r.warnings = warnings;
    r
}

fn failure_result(node_id: &str, failure: NodeFailure, warnings: Vec<String>) -> ExecutionResult {
    let mut r = ExecutionResult::pending(node_id);
    r.status = NodeStatus::Error;
    r.error_kind = Some(failure.error.kind());
    r.error = Some(failure.error.to_string());
    r.usage = failure.usage;
    r.agent_steps = failure.agent_steps;
    r.warnings = warnings;
    r
}

fn skipped(node_id: &str, reason: &str) -> ExecutionResult {
    let mut r = ExecutionResult::pending(node_id);
    r.status = NodeStatus::Skipped;
    r.warnings = vec![reason.to_string()];
    r
}
