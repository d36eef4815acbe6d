// libs/agenda-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::{AgendaService, BookingService};

#[derive(Clone)]
pub struct AgendaState {
    pub config: Arc<AppConfig>,
    pub agenda: Arc<AgendaService>,
    pub booking: Arc<BookingService>,
}

pub fn agenda_routes(state: AgendaState) -> Router {
    // Staff-only: every route requires a valid token
    let protected_routes = Router::new()
        .route("/agenda/{professional_id}/{date}", get(handlers::get_day_view))
        .route("/agenda/{professional_id}/{date}/toggle", post(handlers::toggle_slot))
        .route("/agenda/{professional_id}/{date}/commit", post(handlers::commit_pending))
        .route("/agenda/{professional_id}/{date}/pending", delete(handlers::discard_pending))
        .route("/agenda/{professional_id}/bulk", post(handlers::bulk_generate))
        .route("/agenda/{professional_id}/sync", post(handlers::sync_range))
        .route("/slots/{slot_id}/book", post(handlers::book_slot))
        .route("/slots/{slot_id}/cancel", post(handlers::cancel_slot))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
