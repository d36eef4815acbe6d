// libs/conversation-cell/src/router.rs
use std::sync::Arc;

use axum::{routing::get, Router};

use shared_config::AppConfig;

use crate::handlers;
use crate::services::ConversationDriver;

#[derive(Clone)]
pub struct WebhookState {
    pub config: Arc<AppConfig>,
    pub driver: Arc<ConversationDriver>,
}

pub fn webhook_routes(state: WebhookState) -> Router {
    // Public: the platform proves itself with the verify token and payload signature
    let public_routes = Router::new().route(
        "/whatsapp/webhook",
        get(handlers::verify_webhook).post(handlers::receive_webhook),
    );

    Router::new()
        .merge(public_routes)
        .with_state(state)
}
