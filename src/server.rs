// ABOUTME: HTTP server for provider callbacks and flow-engine sends on USSD channels.
// ABOUTME: Routes /c/us/{uuid}/{receive,status,send} plus /health and /metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::FormRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use ussdgate_core::channel::CHANNEL_TYPE;
use ussdgate_core::message::OutboundMessage;
use ussdgate_core::ChannelConfig;

use crate::handler::{ReceiveForm, TextResponse, UssdHandler};

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<UssdHandler>,
    pub api_key: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

/// Body of a flow-engine send request.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(flatten)]
    pub message: OutboundMessage,
    #[serde(default)]
    pub api_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/c/us/{uuid}/receive", post(receive_handler))
        .route("/c/us/{uuid}/status", get(status_handler))
        .route("/c/us/{uuid}/send", post(send_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn start_server(addr: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting USSD gateway server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("USSD gateway server stopped");
    Ok(())
}

/// Resolve an active USSD channel, or the response to send instead.
async fn resolve_channel(state: &AppState, uuid: &Uuid) -> Result<ChannelConfig, TextResponse> {
    match state.handler.bridge().channel(uuid).await {
        Ok(Some(channel)) if channel.channel_type.eq_ignore_ascii_case(CHANNEL_TYPE) => Ok(channel),
        Ok(_) => {
            tracing::warn!(channel_uuid = %uuid, "Request for unknown USSD channel");
            Err(TextResponse::new(StatusCode::NOT_FOUND, "channel not found"))
        }
        Err(e) => {
            tracing::error!(error = %e, channel_uuid = %uuid, "Channel lookup failed");
            Err(TextResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error looking up channel",
            ))
        }
    }
}

async fn receive_handler(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
    form: Result<Form<ReceiveForm>, FormRejection>,
) -> TextResponse {
    let channel = match resolve_channel(&state, &uuid).await {
        Ok(channel) => channel,
        Err(response) => {
            ussdgate_core::metrics::record_inbound("not_found");
            return response;
        }
    };
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            tracing::warn!(channel_uuid = %uuid, error = %rejection, "Malformed USSD request body");
            ussdgate_core::metrics::record_inbound("bad_request");
            return TextResponse::new(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    state.handler.receive_message(&channel, form).await
}

async fn status_handler(State(state): State<Arc<AppState>>, Path(uuid): Path<Uuid>) -> TextResponse {
    match resolve_channel(&state, &uuid).await {
        Ok(channel) => state.handler.receive_status(&channel),
        Err(response) => response,
    }
}

async fn send_handler(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<SendRequest>,
) -> Response {
    if let Some(expected_key) = &state.api_key {
        match &request.api_key {
            Some(provided_key) if provided_key == expected_key => {}
            _ => {
                tracing::warn!(channel_uuid = %uuid, "Send authentication failed");
                return TextResponse::new(StatusCode::UNAUTHORIZED, "invalid or missing API key")
                    .into_response();
            }
        }
    }

    let channel = match resolve_channel(&state, &uuid).await {
        Ok(channel) => channel,
        Err(response) => return response.into_response(),
    };
    let status = state.handler.send_msg(&channel, &request.message).await;
    Json(status).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> TextResponse {
    let health = state.handler.bridge().backend().health().await;
    let stats = state.handler.bridge().registry().stats();
    let code = if health == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    TextResponse::new(code, format!("{}\nsessions: {}", health, stats.registered))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
