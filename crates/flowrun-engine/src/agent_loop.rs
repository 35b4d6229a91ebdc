use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowrun_core::error::FlowError;
use flowrun_core::event::{EventBus, FlowEvent};
use flowrun_core::traits::ModelProvider;
use flowrun_core::types::*;

use crate::tools::ToolRegistry;

/// Reasoning recorded on the closing step when the step limit is hit.
pub const STEP_LIMIT_NOTE: &str = "step limit reached";

/// One agent-mode model call.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: ModelRef,
    pub sampling: SamplingParams,
    /// Enabled tool names; empty enables every registered tool.
    pub tools: Vec<String>,
    pub max_steps: usize,
    /// JSON Schema the final answer should follow, if any.
    pub schema: Option<serde_json::Value>,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    FinalAnswer,
    StepLimit,
}

/// Completed agent run.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub answer: String,
    pub steps: Vec<AgentStep>,
    pub usage: TokenUsage,
    pub cost_usd: Option<f64>,
    pub termination: Termination,
}

/// The loop ended early; completed steps are kept.
#[derive(Debug)]
pub struct AgentAbort {
    pub error: FlowError,
    pub steps: Vec<AgentStep>,
    pub usage: TokenUsage,
}

/// Drives the reason → call tools → observe cycle for one node.
pub struct AgentLoop {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    events: Arc<EventBus>,
    parallel_tools: bool,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            tools,
            events,
            parallel_tools: true,
        }
    }

    pub fn parallel_tools(mut self, parallel: bool) -> Self {
        self.parallel_tools = parallel;
        self
    }

    /// Run until a final answer, the step limit, an error or cancellation.
    ///
    /// At most `max_steps + 1` steps are recorded: the extra one is the
    /// closing step written when the limit is hit.
    pub async fn run(
        &self,
        run_id: &RunId,
        node_id: &str,
        task: AgentTask,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, AgentAbort> {
        let definitions = self.tools.definitions(&task.tools);
        // Calls are only dispatched to tools that were advertised.
        let enabled: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        let mut messages = vec![ChatMessage::user(task.user_prompt.clone())];
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut cost: Option<f64> = None;
        let mut last_reasoning = String::new();

        let abort = |error: FlowError, steps: Vec<AgentStep>, usage: TokenUsage| AgentAbort {
            error,
            steps,
            usage,
        };

        for step_no in 1..=task.max_steps {
            if cancel.is_cancelled() {
                return Err(abort(FlowError::Cancelled, steps, usage));
            }

            debug!(node_id, step = step_no, "Starting agent step");
            let started = Instant::now();

            let request = ModelRequest {
                system_prompt: task.system_prompt.clone(),
                user_prompt: task.user_prompt.clone(),
                model: task.model.clone(),
                sampling: task.sampling.clone(),
                schema: task.schema.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
            };

            let reply = tokio::select! {
                biased;
                reply = self.provider.send(request) => reply,
                _ = cancel.cancelled() => return Err(abort(FlowError::Cancelled, steps, usage)),
            };
            let reply = match reply {
                Ok(r) => r,
                Err(e) => {
                    error!(node_id, step = step_no, error = %e, "Model call failed");
                    return Err(abort(e, steps, usage));
                }
            };

            usage.add(reply.usage);
            if let Some(c) = reply.cost_usd {
                *cost.get_or_insert(0.0) += c;
            }

            let answer = reply
                .text
                .clone()
                .filter(|t| !t.trim().is_empty())
                .or_else(|| reply.structured.as_ref().map(|v| v.to_string()));

            let step = if !reply.tool_calls.is_empty() {
                let mut assistant = Vec::new();
                if let Some(thinking) = &reply.reasoning {
                    assistant.push(ContentBlock::Thinking {
                        thinking: thinking.clone(),
                    });
                }
                if let Some(text) = reply.text.as_ref().filter(|t| !t.is_empty()) {
                    assistant.push(ContentBlock::Text { text: text.clone() });
                }
                for call in &reply.tool_calls {
                    assistant.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    });
                }
                messages.push(ChatMessage {
                    role: Role::Assistant,
                    content: assistant,
                });

                let calls = tokio::select! {
                    biased;
                    calls = self.execute_calls(&reply.tool_calls, &enabled) => calls,
                    _ = cancel.cancelled() => return Err(abort(FlowError::Cancelled, steps, usage)),
                };

                messages.push(ChatMessage {
                    role: Role::User,
                    content: calls
                        .iter()
                        .map(|c| ContentBlock::ToolResult {
                            tool_use_id: c.id.clone(),
                            content: c
                                .result
                                .clone()
                                .or_else(|| c.error.clone())
                                .unwrap_or_default(),
                            is_error: c.error.is_some(),
                        })
                        .collect(),
                });

                let reasoning = reply.reasoning.clone().or_else(|| reply.text.clone());
                if let Some(r) = &reasoning {
                    last_reasoning = r.clone();
                }
                AgentStep {
                    step: step_no,
                    kind: StepKind::ToolCall,
                    tool_calls: calls,
                    reasoning,
                    output: None,
                    usage: reply.usage,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            } else if let Some(answer) = answer {
                let step = AgentStep {
                    step: step_no,
                    kind: StepKind::FinalAnswer,
                    tool_calls: vec![],
                    reasoning: reply.reasoning.clone(),
                    output: Some(answer.clone()),
                    usage: reply.usage,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                self.publish(run_id, node_id, &step);
                steps.push(step);
                info!(
                    node_id,
                    steps = steps.len(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Agent run complete"
                );
                return Ok(AgentRun {
                    answer,
                    steps,
                    usage,
                    cost_usd: cost,
                    termination: Termination::FinalAnswer,
                });
            } else {
                let reasoning = reply.reasoning.clone().unwrap_or_default();
                if !reasoning.is_empty() {
                    last_reasoning = reasoning.clone();
                    messages.push(ChatMessage {
                        role: Role::Assistant,
                        content: vec![ContentBlock::Thinking {
                            thinking: reasoning.clone(),
                        }],
                    });
                }
                AgentStep {
                    step: step_no,
                    kind: StepKind::Reasoning,
                    tool_calls: vec![],
                    reasoning: Some(reasoning),
                    output: None,
                    usage: reply.usage,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            };

            self.publish(run_id, node_id, &step);
            steps.push(step);
        }

        warn!(node_id, max_steps = task.max_steps, "Agent hit step limit");
        let closing = AgentStep {
            step: task.max_steps + 1,
            kind: StepKind::FinalAnswer,
            tool_calls: vec![],
            reasoning: Some(STEP_LIMIT_NOTE.to_string()),
            output: Some(last_reasoning.clone()),
            usage: TokenUsage::default(),
            duration_ms: 0,
        };
        self.publish(run_id, node_id, &closing);
        steps.push(closing);

        Ok(AgentRun {
            answer: last_reasoning,
            steps,
            usage,
            cost_usd: cost,
            termination: Termination::StepLimit,
        })
    }

    /// Run every requested call; failures become error results, never abort the loop.
    async fn execute_calls(&self, requests: &[ToolCallRequest], enabled: &[&str]) -> Vec<ToolCall> {
        if self.parallel_tools && requests.len() > 1 {
            let futs: Vec<_> = requests.iter().map(|r| self.execute_one(r, enabled)).collect();
            futures::future::join_all(futs).await
        } else {
            let mut calls = Vec::with_capacity(requests.len());
            for request in requests {
                calls.push(self.execute_one(request, enabled).await);
            }
            calls
        }
    }

    async fn execute_one(&self, request: &ToolCallRequest, enabled: &[&str]) -> ToolCall {
        let mut call = ToolCall {
            id: request.id.clone(),
            name: request.name.clone(),
            arguments: request.arguments.clone(),
            result: None,
            error: None,
        };
        if !enabled.contains(&request.name.as_str()) {
            warn!(tool = %request.name, "Model called a tool that is not enabled");
            call.error = Some(format!("Tool not enabled for this node: {}", request.name));
            return call;
        }
        match self
            .tools
            .execute(&request.name, request.arguments.clone())
            .await
        {
            Ok(result) if result.is_error => call.error = Some(result.content),
            Ok(result) => call.result = Some(result.content),
            Err(e) => {
                error!(tool = %request.name, error = %e, "Tool execution failed");
                call.error = Some(e.to_string());
            }
        }
        call
    }

    fn publish(&self, run_id: &RunId, node_id: &str, step: &AgentStep) {
        self.events.publish(FlowEvent::AgentStep {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            step: step.clone(),
        });
    }
}
