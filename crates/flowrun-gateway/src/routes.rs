use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::{error, info, warn};

use flowrun_core::document::FlowDocument;
use flowrun_core::error::FlowError;
use flowrun_core::types::{Graph, RunId};
use flowrun_engine::executors::WEBHOOK_IN;
use flowrun_engine::trigger::SIGNATURE_HEADER;
use flowrun_engine::{RunInput, RunLogger, WebhookTriggerConfig};

use crate::state::AppState;

type Reply = Result<(StatusCode, Json<serde_json::Value>), StatusCode>;

// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Flow names map straight onto file names, so only plain names are served.
fn valid_flow_name(flow: &str) -> bool {
    !flow.is_empty()
        && flow
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn load_flow(state: &AppState, flow: &str) -> Option<Graph> {
    let path = state.flow_path(flow);
    let text = tokio::fs::read_to_string(&path).await.ok()?;
    match FlowDocument::from_json(&text) {
        Ok(doc) => Some(doc.into_graph()),
        Err(e) => {
            warn!(flow, error = %e, "Flow document rejected");
            None
        }
    }
}

/// POST /hooks/{flow} — start a run with the request body as trigger payload.
pub async fn hook(
    State(state): State<Arc<AppState>>,
    Path(flow): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    if !valid_flow_name(&flow) {
        return Err(StatusCode::NOT_FOUND);
    }
    let graph = load_flow(&state, &flow).await.ok_or(StatusCode::NOT_FOUND)?;
    let trigger_node = graph
        .nodes
        .iter()
        .find(|n| n.node_type == WEBHOOK_IN && !n.disabled)
        .ok_or(StatusCode::NOT_FOUND)?;
    let trigger = WebhookTriggerConfig::from_node(trigger_node).map_err(|e| {
        warn!(flow = %flow, error = %e, "Invalid webhook-in configuration");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let gate = state.gate(&flow, trigger);
    gate.verify(&body, signature).map_err(|e| reject(&flow, e))?;

    let payload = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };

    // Graph problems would only surface inside the background run.
    if let Err(e) = state.engine.plan(&graph) {
        warn!(flow = %flow, error = %e, "Flow graph rejected");
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    gate.admit().map_err(|e| reject(&flow, e))?;

    let run_id = RunId::new();
    let logger = state.run_log.as_ref().map(|settings| {
        RunLogger::new(&settings.dir, settings.level).spawn(state.engine.events(), run_id.clone())
    });

    info!(flow = %flow, run_id = %run_id, "Webhook accepted, starting run");
    let engine = state.engine.clone();
    let cancel = state.shutdown.child_token();
    let id = run_id.clone();
    tokio::spawn(async move {
        let input = RunInput::default().with_trigger(payload);
        match engine.run_with_id(id.clone(), &graph, input, cancel).await {
            Ok(report) if report.has_errors() => {
                warn!(run_id = %id, "Triggered run finished with node errors")
            }
            Ok(_) => {}
            Err(e) => {
                error!(run_id = %id, error = %e, "Triggered run rejected");
                // No RunFinished will reach the logger.
                if let Some(handle) = logger {
                    handle.abort();
                }
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id })),
    ))
}

fn reject(flow: &str, error: FlowError) -> StatusCode {
    match error {
        FlowError::SignatureInvalid => {
            warn!(flow, "Webhook signature rejected");
            StatusCode::UNAUTHORIZED
        }
        FlowError::RateLimited { limit } => {
            warn!(flow, limit, "Webhook rate limited");
            StatusCode::TOO_MANY_REQUESTS
        }
        e => {
            error!(flow, error = %e, "Webhook gate failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
