use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use relgraph::webhook::{self, SIGNATURE_HEADER};
use relgraph::{RelationUpdater, ServiceConfig, SignatureVerifier, WebhookAck, WebhookError};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "relgraph-server",
    about = "Webhook receiver that keeps related-article relations up to date"
)]
struct ServerCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "RELGRAPH_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    #[command(flatten)]
    config: ServiceConfig,
}

#[derive(Clone)]
struct AppState {
    updater: RelationUpdater,
    verifier: Arc<SignatureVerifier>,
    default_endpoint: Arc<str>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    ok: bool,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relgraph=info".parse()?))
        .init();

    let cli = ServerCli::parse();
    let service = cli.config.build().await?;
    if !service.verifier.is_enabled() {
        warn!("MICROCMS_WEBHOOK_SECRET not set; webhook signatures are not verified");
    }
    let state = AppState {
        updater: service.updater,
        verifier: Arc::new(service.verifier),
        default_endpoint: Arc::from(service.default_endpoint.as_str()),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/webhook/microcms", post(webhook_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "relgraph-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { ok: true })
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    webhook::receive(
        &state.verifier,
        &state.updater,
        &state.default_endpoint,
        &body,
        signature,
    )
    .await
    .map(Json)
    .map_err(|err| match err {
        err if err.is_unauthorized() => {
            warn!(error = %err, "rejected webhook");
            api_error(StatusCode::UNAUTHORIZED, "Invalid signature")
        }
        WebhookError::Payload(err) => api_error(StatusCode::BAD_REQUEST, err.to_string()),
        err => {
            error!(error = %err, "webhook processing failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    })
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}
