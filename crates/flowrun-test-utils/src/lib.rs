//! Mock collaborators for engine tests.
//!
//! Every mock records what it was asked to do so tests can assert on the
//! exact request the engine built.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{CodeSandbox, DiagramRenderer, HttpClient, ModelProvider, Tool};
use flowrun_core::types::{
    DiagramInfo, HttpRequest, HttpResponse, ModelReply, ModelRequest, SandboxOutcome,
    ToolCallRequest, ToolResult,
};

// ── Model ───────────────────────────────────────────────────────

/// Scripted model provider: replies are handed out in order.
#[derive(Default)]
pub struct MockModelProvider {
    script: Mutex<VecDeque<Result<ModelReply>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: ModelReply) -> Self {
        self.script.lock().unwrap().push_back(Ok(reply));
        self
    }

    pub fn with_error(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(FlowError::ModelCall(message.to_string())));
        self
    }

    /// A reply that asks for a single tool call.
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> ModelReply {
        ModelReply {
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            ..Default::default()
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelProvider for MockModelProvider {
    fn send(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelReply>> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            next.unwrap_or_else(|| Err(FlowError::ModelCall("mock script exhausted".into())))
        })
    }
}

// ── Tools ───────────────────────────────────────────────────────

/// Returns its `text` argument.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the text argument back"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let text = input["text"].as_str().unwrap_or_default().to_string();
            Ok(ToolResult::success(text))
        })
    }
}

/// Sleeps longer than its one-second timeout.
pub struct SlowTool {
    sleep_secs: u64,
}

impl SlowTool {
    pub fn new(sleep_secs: u64) -> Self {
        Self { sleep_secs }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleep, then answer"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(&self, _input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        let secs = self.sleep_secs;
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok(ToolResult::success("done"))
        })
    }

    fn timeout_secs(&self) -> u64 {
        1
    }
}

// ── Sandbox ─────────────────────────────────────────────────────

/// Sandbox that returns a fixed outcome and records the last call.
pub struct MockSandbox {
    outcome: SandboxOutcome,
    last: Mutex<Option<(String, Value, String)>>,
}

impl MockSandbox {
    pub fn returning(value: Value) -> Self {
        Self {
            outcome: SandboxOutcome::Value(value),
            last: Mutex::new(None),
        }
    }

    /// The snippet itself fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            outcome: SandboxOutcome::Error(message.to_string()),
            last: Mutex::new(None),
        }
    }

    /// `(source, context, language)` of the most recent run.
    pub fn last_call(&self) -> Option<(String, Value, String)> {
        self.last.lock().unwrap().clone()
    }
}

impl CodeSandbox for MockSandbox {
    fn run(
        &self,
        source: &str,
        context: Value,
        language: &str,
    ) -> BoxFuture<'_, Result<SandboxOutcome>> {
        *self.last.lock().unwrap() = Some((source.to_string(), context, language.to_string()));
        let outcome = self.outcome.clone();
        Box::pin(async move { Ok(outcome) })
    }
}

// ── HTTP ────────────────────────────────────────────────────────

/// Fails the first `failures` requests with `fail_status`, then answers 200.
pub struct FlakyHttpClient {
    failures: usize,
    fail_status: u16,
    success_body: String,
    calls: AtomicUsize,
    last: Mutex<Option<HttpRequest>>,
}

impl FlakyHttpClient {
    pub fn new(failures: usize, fail_status: u16, success_body: &str) -> Self {
        Self {
            failures,
            fail_status,
            success_body: success_body.to_string(),
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.last.lock().unwrap().clone()
    }
}

impl HttpClient for FlakyHttpClient {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(request);
        let response = if call < self.failures {
            HttpResponse {
                status: self.fail_status,
                body: "unavailable".into(),
            }
        } else {
            HttpResponse {
                status: 200,
                body: self.success_body.clone(),
            }
        };
        Box::pin(async move { Ok(response) })
    }
}

// ── Diagrams ────────────────────────────────────────────────────

/// Wraps source in `<svg>` and recognises sequence and flowchart sources.
#[derive(Default)]
pub struct MockRenderer {
    rendered: Mutex<Vec<String>>,
}

impl MockRenderer {
    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().unwrap().clone()
    }
}

impl DiagramRenderer for MockRenderer {
    fn render(
        &self,
        source: &str,
        _format: &str,
        _theme: Option<Value>,
    ) -> BoxFuture<'_, Result<String>> {
        self.rendered.lock().unwrap().push(source.to_string());
        let markup = format!("<svg>{source}</svg>");
        Box::pin(async move { Ok(markup) })
    }

    fn parse(&self, source: &str) -> BoxFuture<'_, Result<DiagramInfo>> {
        let trimmed = source.trim_start();
        let kind = if trimmed.starts_with("sequenceDiagram") {
            Some("sequence")
        } else if trimmed.starts_with("flowchart") || trimmed.starts_with("graph") {
            Some("flowchart")
        } else {
            None
        };
        let info = DiagramInfo {
            valid: kind.is_some(),
            diagram_type: kind.map(String::from),
            error: kind.is_none().then(|| "unknown diagram type".to_string()),
        };
        Box::pin(async move { Ok(info) })
    }
}
