// libs/conversation-cell/src/handlers.rs
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use shared_models::error::AppError;
use shared_utils::signature::verify_hub_signature;

use crate::error::ConversationError;
use crate::models::{WebhookPayload, WebhookVerifyQuery};
use crate::router::WebhookState;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

impl From<ConversationError> for AppError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::InvalidPayload(msg) => AppError::BadRequest(msg),
        }
    }
}

/// Subscription handshake: echo the challenge when the verify token matches.
pub async fn verify_webhook(
    State(state): State<WebhookState>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, AppError> {
    let token_matches = !state.config.whatsapp_verify_token.is_empty()
        && query.verify_token.as_deref() == Some(state.config.whatsapp_verify_token.as_str());

    match (query.mode.as_deref(), query.challenge) {
        (Some("subscribe"), Some(challenge)) if token_matches => {
            debug!("Webhook subscription verified");
            Ok(challenge)
        }
        _ => {
            warn!("Webhook verification rejected");
            Err(AppError::Forbidden("Verification failed".to_string()))
        }
    }
}

/// Acknowledges right away. Messages are queued per caller and processed in
/// the order they arrived.
pub async fn receive_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    if let Some(app_secret) = &state.config.whatsapp_app_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::Auth("Missing payload signature".to_string()))?;

        if !verify_hub_signature(app_secret, &body, signature) {
            return Err(AppError::Auth("Invalid payload signature".to_string()));
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ConversationError::InvalidPayload(e.to_string()))?;
    let messages = payload.into_messages();
    debug!("Webhook delivered {} message(s)", messages.len());

    for message in messages {
        state.driver.enqueue(message).await;
    }

    Ok(Json(json!({ "status": "received" })))
}
