//! Instagram webhook endpoints: subscription handshake and event ingest.

use crate::relay::Relay;
use crate::signature::{constant_time_eq, verify_signature};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use ig_channels::{InstagramWebhookPayload, normalize_webhook};
use serde::Deserialize;
use std::sync::Arc;

pub const WEBHOOK_PATH: &str = "/webhook";
pub const EVENT_RECEIVED: &str = "EVENT_RECEIVED";
const SUBSCRIBE_MODE: &str = "subscribe";

pub struct WebhookState {
    pub verify_token: String,
    pub app_secret: Option<String>,
    pub object: String,
    pub relay: Arc<Relay>,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, get(verify).post(ingest))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verification {
    Verified(String),
    Forbidden,
    MissingParameters,
}

pub fn verify_subscription(query: &VerifyQuery, expected_token: &str) -> Verification {
    let present = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(ToOwned::to_owned)
    };
    let (Some(mode), Some(token)) = (present(&query.mode), present(&query.verify_token)) else {
        return Verification::MissingParameters;
    };
    if mode == SUBSCRIBE_MODE && constant_time_eq(&token, expected_token) {
        return Verification::Verified(query.challenge.clone().unwrap_or_default());
    }
    Verification::Forbidden
}

#[tracing::instrument(level = "info", skip_all)]
async fn verify(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    match verify_subscription(&query, &state.verify_token) {
        Verification::Verified(challenge) => {
            tracing::info!("webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        Verification::Forbidden => {
            tracing::warn!(mode = ?query.mode, "webhook verification failed: token or mode mismatch");
            StatusCode::FORBIDDEN.into_response()
        }
        Verification::MissingParameters => {
            tracing::warn!("webhook verification failed: missing parameters");
            (StatusCode::BAD_REQUEST, "Missing parameters").into_response()
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(body_bytes = body.len()))]
async fn ingest(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.app_secret.as_deref() {
        if !verify_signature(&headers, &body, secret) {
            tracing::warn!("rejecting webhook with missing or invalid x-hub-signature-256");
            return (StatusCode::UNAUTHORIZED, "invalid x-hub-signature-256").into_response();
        }
    }

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "rejecting malformed webhook body");
            return (StatusCode::BAD_REQUEST, format!("invalid webhook body: {error}"))
                .into_response();
        }
    };

    // Deliveries for other objects may use a different shape; acknowledge them unparsed.
    let object = value.get("object").and_then(|o| o.as_str()).unwrap_or_default();
    if object != state.object {
        tracing::info!(object, expected_object = %state.object, "ignoring webhook for other object");
        return (StatusCode::OK, EVENT_RECEIVED).into_response();
    }

    let payload: InstagramWebhookPayload = match serde_json::from_value(value) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "rejecting malformed webhook payload");
            return (
                StatusCode::BAD_REQUEST,
                format!("invalid webhook payload: {error}"),
            )
                .into_response();
        }
    };

    let batch = normalize_webhook(&payload, &state.object);
    tracing::info!(
        object = %payload.object,
        object_matched = batch.object_matched,
        entries = payload.entry.len(),
        messages = batch.messages.len(),
        ignored = batch.ignored,
        "webhook event received"
    );
    if !batch.messages.is_empty() {
        let outcomes = state.relay.handle_all(&batch.messages).await;
        tracing::debug!(?outcomes, "webhook batch processed");
    }

    (StatusCode::OK, EVENT_RECEIVED).into_response()
}
