use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde_json::json;
use tracing::{info, warn};

use agenda_cell::router::{agenda_routes, AgendaState};
use agenda_cell::services::{
    AgendaService, AuditSink, BookingService, Directory, InMemorySlotRepository, SlotRepository,
    StaticDirectory, SupabaseAuditSink, SupabaseDirectory, SupabaseSlotRepository, TracingAuditSink,
};
use conversation_cell::router::{webhook_routes, WebhookState};
use conversation_cell::services::{
    CachedDirectory, ConversationDriver, ConversationMachine, ConversationStore, GenerativeIntentClassifier,
    InMemoryConversationStore, IntentClassifier, KeywordIntentClassifier, MessageTransport,
    RedisConversationStore, WhatsAppCancellationNotifier, WhatsAppClient,
};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

struct Storage {
    slots: Arc<dyn SlotRepository>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditSink>,
}

fn storage(config: &AppConfig) -> Storage {
    if !config.is_configured() {
        warn!("Supabase not configured, keeping slots in memory");
        return Storage {
            slots: Arc::new(InMemorySlotRepository::new()),
            directory: Arc::new(StaticDirectory::new()),
            audit: Arc::new(TracingAuditSink),
        };
    }

    let supabase = Arc::new(SupabaseClient::new(config));
    Storage {
        slots: Arc::new(SupabaseSlotRepository::new(supabase.clone())),
        directory: Arc::new(SupabaseDirectory::new(supabase.clone())),
        audit: Arc::new(SupabaseAuditSink::new(supabase, &config.center_id)),
    }
}

async fn conversation_store(config: &AppConfig) -> Arc<dyn ConversationStore> {
    let Some(redis_url) = &config.redis_url else {
        info!("REDIS_URL not set, keeping conversations in memory");
        return Arc::new(InMemoryConversationStore::new());
    };

    match RedisConversationStore::new(redis_url, config.idle_timeout_seconds()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Redis unavailable ({}), keeping conversations in memory", e);
            Arc::new(InMemoryConversationStore::new())
        }
    }
}

fn classifier(config: &AppConfig) -> Arc<dyn IntentClassifier> {
    match GenerativeIntentClassifier::new(config) {
        Ok(classifier) => Arc::new(classifier),
        Err(_) => {
            info!("Classifier endpoint not configured, using keyword matching");
            Arc::new(KeywordIntentClassifier)
        }
    }
}

pub async fn create_router(config: Arc<AppConfig>) -> Router {
    let storage = storage(&config);
    if !config.is_whatsapp_configured() {
        warn!("WhatsApp not configured, outbound messages will fail");
    }
    let transport: Arc<dyn MessageTransport> = Arc::new(WhatsAppClient::new(&config));

    let directory: Arc<dyn Directory> = Arc::new(CachedDirectory::new(
        storage.directory,
        Duration::from_secs(config.directory_cache_ttl_seconds),
    ));
    let agenda = Arc::new(AgendaService::new(
        &config.center_id,
        storage.slots.clone(),
        directory.clone(),
        storage.audit.clone(),
    ));
    let booking = Arc::new(
        BookingService::new(&config.center_id, storage.slots, storage.audit)
            .with_notifier(Arc::new(WhatsAppCancellationNotifier::new(transport.clone()))),
    );

    let machine = Arc::new(ConversationMachine::new(
        agenda.clone(),
        booking.clone(),
        directory,
        classifier(&config),
        config.booking_days_ahead,
    ));
    let driver = ConversationDriver::new(
        machine,
        conversation_store(&config).await,
        transport,
        chrono::Duration::seconds(config.idle_timeout_seconds() as i64),
    )
    .with_handoff_notify_phone(config.handoff_notify_phone.clone());

    let agenda_state = AgendaState {
        config: config.clone(),
        agenda,
        booking,
    };
    let webhook_state = WebhookState {
        config,
        driver: Arc::new(driver),
    };

    Router::new()
        .route("/", get(|| async { "Clinic scheduler API is running!" }))
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .merge(agenda_routes(agenda_state))
        .merge(webhook_routes(webhook_state))
}
