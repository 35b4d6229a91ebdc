use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowrun_core::config::EngineConfig;
use flowrun_core::document::FlowDocument;
use flowrun_core::traits::StaticCredentials;
use flowrun_core::types::{value_to_text, Graph, NodeStatus, RunId};
use flowrun_engine::structured::{fields_to_schema, schema_to_fields, schema_to_outline};
use flowrun_engine::{
    Collaborators, Engine, ExecutorRegistry, RunInput, RunLogger, RunReport, ToolRegistry,
};
use flowrun_gateway::state::RunLogSettings;
use flowrun_gateway::GatewayServer;
use flowrun_remote::{
    HttpTool, RemoteDiagramRenderer, RemoteModelProvider, RemoteSandbox, ReqwestHttpClient,
};

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Run node-graph automation flows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow document to completion
    Run {
        /// Flow export document (JSON)
        flow: PathBuf,
        /// Initial input as text
        #[arg(long, conflicts_with = "input_json")]
        input: Option<String>,
        /// Initial input as a JSON value
        #[arg(long)]
        input_json: Option<String>,
        /// Trigger payload for a webhook-in node (JSON)
        #[arg(long)]
        trigger_json: Option<String>,
        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a flow's graph and node configuration without running it
    Validate {
        flow: PathBuf,
    },
    /// Print the execution plan, one concurrency level per line
    Plan {
        flow: PathBuf,
    },
    /// Print the flat field list of a JSON Schema file
    Fields {
        schema: PathBuf,
    },
    /// Print the JSON Schema for a flat field list (e.g. "id,name/first")
    Schema {
        fields: String,
    },
    /// Print a Markdown outline of a JSON Schema file
    Outline {
        schema: PathBuf,
    },
    /// Start the inbound webhook listener
    Serve,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowrun=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "flowrun", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Schema { fields } => {
            println!("{}", serde_json::to_string_pretty(&fields_to_schema(fields))?);
            return Ok(());
        }
        Commands::Fields { schema } => {
            println!("{}", schema_to_fields(&read_json(schema)?));
            return Ok(());
        }
        Commands::Outline { schema } => {
            println!("{}", schema_to_outline(&read_json(schema)?));
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli.config)?;
    let engine = build_engine(&config);

    match cli.command {
        Commands::Run {
            flow,
            input,
            input_json,
            trigger_json,
            json,
        } => {
            let graph = load_flow(&flow)?;
            let mut run_input = RunInput::new(match (input, input_json) {
                (_, Some(raw)) => serde_json::from_str(&raw).context("--input-json is not valid JSON")?,
                (Some(text), None) => serde_json::Value::String(text),
                (None, None) => serde_json::Value::Null,
            });
            if let Some(raw) = trigger_json {
                run_input = run_input
                    .with_trigger(serde_json::from_str(&raw).context("--trigger-json is not valid JSON")?);
            }

            let report = run_flow(&engine, &config, &graph, run_input).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.has_errors() {
                anyhow::bail!(
                    "run finished with {} failed node(s)",
                    report.count(NodeStatus::Error)
                );
            }
        }
        Commands::Validate { flow } => {
            let graph = load_flow(&flow)?;
            let problems = engine.check(&graph)?;
            if problems.is_empty() {
                println!("{}: {} nodes, no problems", flow.display(), graph.nodes.len());
            } else {
                for (node_id, error) in &problems {
                    println!("  {:<20} {}", node_id, error);
                }
                anyhow::bail!("{} node(s) have configuration problems", problems.len());
            }
        }
        Commands::Plan { flow } => {
            let graph = load_flow(&flow)?;
            let plan = engine.plan(&graph)?;
            for (depth, level) in plan.levels().iter().enumerate() {
                let names: Vec<&str> = level
                    .iter()
                    .map(|id| graph.node(id).map(|n| n.display_name()).unwrap_or(id.as_str()))
                    .collect();
                println!("{:>3}  {}", depth, names.join(", "));
            }
        }
        Commands::Serve => {
            let gateway_config = config.gateway.clone().unwrap_or_default();
            info!(bind = %gateway_config.bind, "Starting webhook listener");
            let mut server = GatewayServer::new(gateway_config, engine);
            if let Some(dir) = config.log_dir() {
                server = server.with_run_log(RunLogSettings {
                    dir,
                    level: config.log_level(),
                });
            }

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down listener...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Completions { .. }
        | Commands::Schema { .. }
        | Commands::Fields { .. }
        | Commands::Outline { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(EngineConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        Ok(EngineConfig::default())
    }
}

fn load_flow(path: &Path) -> anyhow::Result<Graph> {
    let doc = FlowDocument::load(path)
        .with_context(|| format!("failed to load flow {}", path.display()))?;
    info!(flow = %doc.metadata.name, nodes = doc.graph.nodes.len(), "Loaded flow");
    Ok(doc.into_graph())
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Wire the standard executors to the configured remote services.
fn build_engine(config: &EngineConfig) -> Engine {
    let remote = config.remote.clone().unwrap_or_default();

    let mut tools = ToolRegistry::new();
    for tool in HttpTool::from_configs(&config.tools) {
        tools.register(tool);
    }
    if !tools.is_empty() {
        info!(tools = ?tools.list(), "Agent tools registered");
    }

    let collab = Collaborators {
        model: Arc::new(RemoteModelProvider::new(&remote)),
        sandbox: Arc::new(RemoteSandbox::new(&remote)),
        http: Arc::new(ReqwestHttpClient::new()),
        diagrams: Arc::new(RemoteDiagramRenderer::new(&remote)),
        tools: Arc::new(tools),
        credentials: Arc::new(StaticCredentials::new(config.credentials.clone())),
    };
    Engine::new(ExecutorRegistry::standard(collab, config), config)
}

async fn run_flow(
    engine: &Engine,
    config: &EngineConfig,
    graph: &Graph,
    input: RunInput,
) -> anyhow::Result<RunReport> {
    let run_id = RunId::new();
    let logger = config.log_dir().map(|dir| {
        info!(dir = %dir.display(), run_id = %run_id, "Run logging enabled");
        RunLogger::new(dir, config.log_level()).spawn(engine.events(), run_id.clone())
    });

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Cancelling run...");
        cancel_clone.cancel();
    });

    let report = engine.run_with_id(run_id, graph, input, cancel).await;
    if let Some(handle) = logger {
        if report.is_err() {
            // A rejected graph never publishes RunFinished.
            handle.abort();
        }
        handle.await.ok();
    }
    Ok(report?)
}

fn print_report(report: &RunReport) {
    println!("Run {}", report.run_id);
    for result in &report.results {
        let elapsed = result
            .elapsed_ms()
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<8} {:<20} {:>8}",
            result.status.to_string(),
            result.node_id,
            elapsed
        );
        match &result.error {
            Some(error) => println!("           error: {}", error),
            None if result.status == NodeStatus::Success => {
                let text = value_to_text(&result.output);
                let preview: String = text.chars().take(120).collect();
                let ellipsis = if text.chars().count() > 120 { "..." } else { "" };
                println!("           {}{}", preview.replace('\n', " "), ellipsis);
            }
            None => {}
        }
        for warning in &result.warnings {
            println!("           warning: {}", warning);
        }
    }

    let usage = report.total_usage();
    if usage.total() > 0 {
        print!("Tokens: {} in / {} out", usage.input_tokens, usage.output_tokens);
        match report.total_cost_usd() {
            Some(cost) => println!(", ${:.4}", cost),
            None => println!(),
        }
    }
    if report.cancelled {
        println!("Run was cancelled.");
    }
}
