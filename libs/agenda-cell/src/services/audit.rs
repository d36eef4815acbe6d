// =====================================================================================
// AUDIT SINK - ACTIVITY LOG FOR SLOT CHANGES
// =====================================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use shared_database::supabase::SupabaseClient;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
}

impl AuditEvent {
    pub fn slot(action: &str, slot_id: impl ToString, details: Value) -> Self {
        Self {
            action: action.to_string(),
            entity_type: "slot".to_string(),
            entity_id: slot_id.to_string(),
            details,
        }
    }
}

/// Side-effect sink. Implementations log their own failures; a lost audit
/// entry never undoes the write it describes.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_activity(&self, event: AuditEvent);
}

pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_activity(&self, event: AuditEvent) {
        info!(
            action = %event.action,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            details = %event.details,
            "AUDIT: {}", event.action
        );
    }
}

pub struct SupabaseAuditSink {
    supabase: Arc<SupabaseClient>,
    center_id: String,
}

impl SupabaseAuditSink {
    pub fn new(supabase: Arc<SupabaseClient>, center_id: &str) -> Self {
        Self {
            supabase,
            center_id: center_id.to_string(),
        }
    }
}

#[async_trait]
impl AuditSink for SupabaseAuditSink {
    #[instrument(skip(self, event), fields(action = %event.action))]
    async fn log_activity(&self, event: AuditEvent) {
        TracingAuditSink.log_activity(event.clone()).await;

        let body = json!({
            "center_id": self.center_id,
            "action": event.action,
            "entity_type": event.entity_type,
            "entity_id": event.entity_id,
            "details": event.details,
            "created_at": Utc::now().to_rfc3339(),
        });

        if let Err(e) = self.supabase
            .execute(Method::POST, "/rest/v1/activity_logs", None, Some(body), None)
            .await
        {
            warn!("Failed to persist audit entry {}: {}", event.action, e);
        }
    }
}
