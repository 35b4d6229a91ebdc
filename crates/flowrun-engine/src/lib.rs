pub mod agent_loop;
pub mod executors;
pub mod graph;
pub mod orchestrator;
pub mod run_log;
pub mod store;
pub mod structured;
pub mod tools;
pub mod trigger;
pub mod variables;

pub use agent_loop::{AgentLoop, AgentRun, AgentTask, Termination};
pub use executors::{Collaborators, ExecutorRegistry, NodeContext, NodeExecutor, NodeOutput};
pub use graph::{resolve_plan, ExecutionPlan};
pub use orchestrator::{Engine, RunInput};
pub use run_log::RunLogger;
pub use store::{ResultStore, RunReport};
pub use tools::ToolRegistry;
pub use trigger::{InboundGate, WebhookTriggerConfig};
