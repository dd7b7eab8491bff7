//! Keep-alive and status endpoint.

use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Json, Router,
        extract::{Query, State},
        http::{StatusCode, header},
        response::{IntoResponse, Response},
        routing::get,
    },
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tower_http::trace::TraceLayer,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use threadrelay_metrics::{counter, http as http_metrics};

use {
    threadrelay_core::{BindingState, ChatId, ListenerPool, OutcomeLog},
    threadrelay_metrics::MetricsHandle,
};

const DEFAULT_OUTCOME_LIMIT: u32 = 50;
const MAX_OUTCOME_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ListenerPool>,
    pub outcomes: Arc<dyn OutcomeLog>,
    pub metrics: Option<MetricsHandle>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/outcomes", get(outcomes_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn record_request(_endpoint: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(http_metrics::REQUESTS_TOTAL, "endpoint" => _endpoint).increment(1);
}

async fn root_handler() -> &'static str {
    record_request("root");
    "OK"
}

#[derive(Debug, Serialize)]
struct BindingHealth {
    account_id: String,
    origin_chat_id: ChatId,
    companion_chat_id: Option<ChatId>,
    posts_chat_id: ChatId,
    comments_chat_id: ChatId,
    state: Option<BindingState>,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    record_request("health");
    let bindings: Vec<BindingHealth> = state
        .pool
        .bindings()
        .await
        .into_iter()
        .map(|b| BindingHealth {
            state: state.pool.binding_state(b.origin_chat_id),
            comments_chat_id: b.comments_target().chat_id,
            account_id: b.account_id,
            origin_chat_id: b.origin_chat_id,
            companion_chat_id: b.companion_chat_id,
            posts_chat_id: b.posts.chat_id,
        })
        .collect();
    let healthy = bindings
        .iter()
        .all(|b| b.state == Some(BindingState::Active));

    Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "listeners": state.pool.listener_count().await,
        "dedup_entries": state.pool.dedup().len(),
        "bindings": bindings,
    }))
}

#[derive(Debug, Deserialize)]
struct OutcomesQuery {
    limit: Option<u32>,
    origin: Option<ChatId>,
}

async fn outcomes_handler(
    State(state): State<AppState>,
    Query(query): Query<OutcomesQuery>,
) -> Response {
    record_request("outcomes");
    let limit = query
        .limit
        .unwrap_or(DEFAULT_OUTCOME_LIMIT)
        .min(MAX_OUTCOME_LIMIT);
    let result = match query.origin {
        Some(origin) => state.outcomes.list_by_origin(origin, limit).await,
        None => state.outcomes.recent(limit).await,
    };
    match result {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to read delivery outcomes");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        },
    }
}

/// Prometheus text exposition; unauthenticated so scrapers can reach it.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.as_ref() {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Metrics not enabled").into_response(),
    }
}
