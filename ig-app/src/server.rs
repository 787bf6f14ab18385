//! igrelay server.
//!
//! Loads `RelayConfig` once, wires the assistant client and Instagram adapter
//! into a `Relay`, and mounts the webhook and health routes.

use crate::config::{RelayConfig, ServerConfig};
use crate::relay::Relay;
use crate::routes;
use crate::routes::webhook::WebhookState;
use anyhow::Result;
use axum::Router;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use ig_assistant::AssistantClient;
use ig_channels::{ChannelAdapter, InstagramAdapter, OutboundMessage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let policy = cfg.assistant.poll_policy();
    tracing::info!(
        bind_addr = %cfg.bind_addr()?,
        webhook_object = %cfg.webhook.object,
        signature_check = cfg.app_secret().is_some(),
        assistant_base_url = %cfg.assistant.base_url,
        assistant_id = %cfg.assistant.assistant_id,
        poll_interval_ms = policy.interval.as_millis() as u64,
        poll_max_attempts = policy.max_attempts,
        poll_timeout_seconds = policy.timeout.as_secs(),
        delete_threads = cfg.assistant.delete_threads,
        graph_api_base_url = %cfg.instagram.graph_api_base_url,
        graph_api_version = %cfg.instagram.graph_api_version,
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let adapter = build_instagram_adapter(&cfg)?;
    adapter
        .send(recipient, OutboundMessage::text(message))
        .await?;
    tracing::info!(recipient_id = %recipient, "one-shot message sent");
    Ok(())
}

pub async fn ask(config_path: Option<PathBuf>, message: &str) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let client = build_assistant_client(&cfg)?;
    let reply = client
        .reply(message)
        .await
        .map_err(|e| anyhow::anyhow!("assistant run failed: {e}"))?;
    println!("{reply}");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        bind_addr = %addr,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        webhook_object = %cfg.webhook.object,
        signature_check = cfg.app_secret().is_some(),
        assistant_id = %cfg.assistant.assistant_id,
        graph_api_version = %cfg.instagram.graph_api_version,
        "igrelay starting"
    );

    let listener = preflight_bind_listener(addr).await?;
    let relay = Arc::new(build_relay(&cfg)?);
    let webhook_state = Arc::new(WebhookState {
        verify_token: cfg.webhook.verify_token.clone(),
        app_secret: cfg.app_secret().map(ToOwned::to_owned),
        object: cfg.webhook.object.clone(),
        relay,
    });

    let app = build_app(webhook_state, &cfg.server);

    tracing::info!(%addr, "igrelay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

/// Mount the routes with request-id, tracing and in-flight limits.
///
/// The request timeout covers every route except `/webhook`, which always runs
/// its whole batch before acknowledging.
pub fn build_app(webhook_state: Arc<WebhookState>, server: &ServerConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri().path(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::health::router()
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.http_timeout_seconds),
        ))
        .merge(routes::webhook::router(webhook_state))
        .layer(GlobalConcurrencyLimitLayer::new(server.http_max_in_flight))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub fn build_relay(cfg: &RelayConfig) -> Result<Relay> {
    let assistant = build_assistant_client(cfg)?;
    let instagram = build_instagram_adapter(cfg)?;
    Ok(Relay::new(
        Arc::new(assistant),
        Arc::new(instagram),
        cfg.replies.clone(),
    ))
}

fn build_assistant_client(cfg: &RelayConfig) -> Result<AssistantClient> {
    let client = AssistantClient::new(&cfg.assistant.api_key, &cfg.assistant.assistant_id)
        .and_then(|c| c.with_base_url(&cfg.assistant.base_url))
        .and_then(|c| c.with_poll_policy(cfg.assistant.poll_policy()))
        .map_err(|e| anyhow::anyhow!("build assistant client: {e}"))?
        .with_delete_threads(cfg.assistant.delete_threads);
    Ok(client)
}

fn build_instagram_adapter(cfg: &RelayConfig) -> Result<InstagramAdapter> {
    InstagramAdapter::new(&cfg.instagram.page_access_token)?
        .with_base_url(&cfg.instagram.graph_api_base_url)?
        .with_api_version(&cfg.instagram.graph_api_version)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}
