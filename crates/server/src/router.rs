//! Relay routes and error mapping.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use gateway_core::dispatch::{GatewayError, RelayOrchestrator, RequestContext};
use std::sync::Arc;
use tracing::debug;

/// Header carrying the application secret, when the application requires
/// one.
pub const SECRET_HEADER: &str = "x-application-secret";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RelayOrchestrator>,
}

/// Builds the ingress router: `POST /v1/{app_id}` and `POST /v1/lb/{lb_id}`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/{app_id}", post(relay_by_application))
        .route("/v1/lb/{lb_id}", post(relay_by_load_balancer))
        .with_state(state)
}

async fn relay_by_application(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = context_from(&headers);
    let outcome = state.orchestrator.relay_by_application(&app_id, "", &body, &ctx).await;
    relay_response(outcome)
}

async fn relay_by_load_balancer(
    State(state): State<AppState>,
    Path(lb_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = context_from(&headers);
    let outcome = state.orchestrator.relay_by_load_balancer(&lb_id, "", &body, &ctx).await;
    relay_response(outcome)
}

/// Captures the headers the orchestrator recognizes into a fresh request
/// context.
fn context_from(headers: &HeaderMap) -> RequestContext {
    let header_str = |name: header::HeaderName| {
        headers.get(&name).and_then(|v| v.to_str().ok()).map(str::to_string)
    };

    let mut ctx = RequestContext::new();
    ctx.host = header_str(header::HOST);
    ctx.origin = header_str(header::ORIGIN);
    ctx.user_agent = header_str(header::USER_AGENT);
    ctx.content_type = header_str(header::CONTENT_TYPE);
    ctx.secret_key =
        headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);

    if ctx.debug_enabled() {
        debug!(request = %ctx.request_id, host = ctx.host.as_deref().unwrap_or(""), "debug client");
    }
    ctx
}

fn relay_response(outcome: Result<String, GatewayError>) -> Response {
    match outcome {
        Ok(payload) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], payload).into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}
