use std::sync::Arc;

use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};

use crate::store::{Histogram, Store};

/// Shared state behind the presentation endpoint. `agents` holds each
/// configured address, in the same order as the store's `agent_<index>`
/// columns, for the page's injected `agents` blob.
pub struct AppState {
    pub store: Arc<Store>,
    pub histogram: Arc<Histogram>,
    pub agents: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/api/results", get(api_results))
        .route("/api/health", get(api_health))
        .with_state(state)
}

async fn home(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data = match state.store.all_rows() {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(%err, "unable to load capture results from db");
            Vec::new()
        }
    };
    let data_json = serde_json::to_string(&data).unwrap_or_else(|_| "[]".to_string());
    let agents_json = serde_json::to_string(&state.agents).unwrap_or_else(|_| "[]".to_string());
    let y_max = state.histogram.max();

    let body = format!(
        "<script type=\"text/javascript\">\nvar data={data_json};\nvar yMax={y_max};\nvar agents={agents_json};\n</script>\n\
         <!DOCTYPE html><html><body><p>tricorder coordinator: {count} rows, agents={agents_json}</p></body></html>",
        count = data.len(),
    );
    Html(body)
}

async fn api_results(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.all_rows() {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            tracing::error!(%err, "unable to load capture results from db");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn api_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
