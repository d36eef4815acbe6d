// libs/conversation-cell/src/services/transport.rs
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, instrument};

use agenda_cell::models::{Slot, SLOT_DATE_FORMAT};
use agenda_cell::services::CancellationNotifier;
use shared_config::AppConfig;

use crate::error::TransportError;
use crate::models::{ListSection, ReplyButton};

/// Platform limits of interactive messages.
pub const MAX_BUTTONS: usize = 3;
pub const MAX_LIST_ROWS: usize = 10;
const MAX_BUTTON_TITLE: usize = 20;
const MAX_ROW_TITLE: usize = 24;
const MAX_ROW_DESCRIPTION: usize = 72;
const MAX_BODY: usize = 1024;

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), TransportError>;

    async fn send_buttons(&self, to: &str, body: &str, buttons: &[ReplyButton]) -> Result<(), TransportError>;

    async fn send_list(
        &self,
        to: &str,
        body: &str,
        button_label: &str,
        sections: &[ListSection],
    ) -> Result<(), TransportError>;
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

// ==============================================================================
// WHATSAPP CLOUD API
// ==============================================================================

pub struct WhatsAppClient {
    client: Client,
    messages_url: String,
    access_token: String,
}

impl WhatsAppClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            messages_url: format!(
                "{}/{}/messages",
                config.whatsapp_api_base_url.trim_end_matches('/'),
                config.whatsapp_phone_number_id
            ),
            access_token: config.whatsapp_access_token.clone(),
        }
    }

    pub fn text_payload(to: &str, body: &str) -> Value {
        json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": clip(body, 4096) },
        })
    }

    pub fn buttons_payload(to: &str, body: &str, buttons: &[ReplyButton]) -> Value {
        let buttons: Vec<Value> = buttons
            .iter()
            .take(MAX_BUTTONS)
            .map(|b| json!({ "type": "reply", "reply": { "id": b.id, "title": clip(&b.title, MAX_BUTTON_TITLE) } }))
            .collect();

        json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": { "text": clip(body, MAX_BODY) },
                "action": { "buttons": buttons },
            },
        })
    }

    pub fn list_payload(to: &str, body: &str, button_label: &str, sections: &[ListSection]) -> Value {
        let mut remaining = MAX_LIST_ROWS;
        let sections: Vec<Value> = sections
            .iter()
            .filter_map(|section| {
                let rows: Vec<Value> = section
                    .rows
                    .iter()
                    .take(remaining)
                    .map(|row| {
                        let mut value = json!({ "id": row.id, "title": clip(&row.title, MAX_ROW_TITLE) });
                        if let Some(description) = &row.description {
                            value["description"] = json!(clip(description, MAX_ROW_DESCRIPTION));
                        }
                        value
                    })
                    .collect();
                remaining -= rows.len();
                (!rows.is_empty()).then(|| json!({ "title": clip(&section.title, MAX_ROW_TITLE), "rows": rows }))
            })
            .collect();

        json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "list",
                "body": { "text": clip(body, MAX_BODY) },
                "action": { "button": clip(button_label, MAX_BUTTON_TITLE), "sections": sections },
            },
        })
    }

    async fn post(&self, payload: Value) -> Result<(), TransportError> {
        if self.access_token.is_empty() {
            return Err(TransportError::NotConfigured);
        }

        let response = self.client
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("WhatsApp API error ({}): {}", status, body);
            return Err(TransportError::Rejected { status: status.as_u16(), body });
        }

        debug!("WhatsApp message accepted");
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for WhatsAppClient {
    #[instrument(skip(self, body))]
    async fn send_text(&self, to: &str, body: &str) -> Result<(), TransportError> {
        self.post(Self::text_payload(to, body)).await
    }

    #[instrument(skip(self, body, buttons))]
    async fn send_buttons(&self, to: &str, body: &str, buttons: &[ReplyButton]) -> Result<(), TransportError> {
        self.post(Self::buttons_payload(to, body, buttons)).await
    }

    #[instrument(skip(self, body, sections))]
    async fn send_list(
        &self,
        to: &str,
        body: &str,
        button_label: &str,
        sections: &[ListSection],
    ) -> Result<(), TransportError> {
        self.post(Self::list_payload(to, body, button_label, sections)).await
    }
}

// ==============================================================================
// CANCELLATION NOTICES
// ==============================================================================

/// Tells the patient over the chat channel that staff cancelled their booking.
pub struct WhatsAppCancellationNotifier {
    transport: Arc<dyn MessageTransport>,
}

impl WhatsAppCancellationNotifier {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }

    pub fn notice(slot: &Slot) -> String {
        let name = slot.patient_name.as_deref().unwrap_or("");
        format!(
            "Hola {}, tu hora del {} a las {} fue cancelada por el centro. Escríbenos \"hora\" si quieres reagendar.",
            name,
            slot.date.format(SLOT_DATE_FORMAT),
            slot.time_label()
        )
    }
}

#[async_trait]
impl CancellationNotifier for WhatsAppCancellationNotifier {
    async fn notify_cancellation(&self, slot: &Slot) -> anyhow::Result<()> {
        let phone = slot
            .patient_phone
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("slot {} has no patient phone", slot.id))?;
        self.transport.send_text(phone, &Self::notice(slot)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListRow;
    use shared_utils::test_utils::TestConfig;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rows(n: usize) -> Vec<ListRow> {
        (0..n)
            .map(|i| ListRow { id: format!("slot:{}", i), title: format!("{:02}:00", i), description: None })
            .collect()
    }

    #[test]
    fn list_payload_respects_row_limit_across_sections() {
        let sections = vec![
            ListSection { title: "Mañana".into(), rows: rows(7) },
            ListSection { title: "Tarde".into(), rows: rows(7) },
        ];
        let payload = WhatsAppClient::list_payload("569", "Elige", "Ver horas disponibles hoy", &sections);
        let sections = payload["interactive"]["action"]["sections"].as_array().unwrap();

        let total: usize = sections.iter().map(|s| s["rows"].as_array().unwrap().len()).sum();
        assert_eq!(total, MAX_LIST_ROWS);
        assert_eq!(
            payload["interactive"]["action"]["button"].as_str().unwrap().chars().count(),
            MAX_BUTTON_TITLE
        );
    }

    #[test]
    fn long_titles_are_clipped() {
        let buttons = vec![ReplyButton::new("a", "Un título demasiado largo para un botón")];
        let payload = WhatsAppClient::buttons_payload("569", "¿Confirmas?", &buttons);
        let title = payload["interactive"]["action"]["buttons"][0]["reply"]["title"].as_str().unwrap();
        assert_eq!(title.chars().count(), MAX_BUTTON_TITLE);
        assert!(title.ends_with('…'));
    }

    #[tokio::test]
    async fn send_text_posts_to_the_phone_number_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/phone-number-id/messages"))
            .and(header("authorization", "Bearer whatsapp-token"))
            .and(body_partial_json(json!({ "to": "56911112222", "type": "text", "text": { "body": "hola" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [{ "id": "wamid.1" }] })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = TestConfig::default().to_app_config();
        config.whatsapp_api_base_url = server.uri();
        WhatsAppClient::new(&config).send_text("56911112222", "hola").await.unwrap();
    }

    #[tokio::test]
    async fn rejected_sends_surface_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad recipient"))
            .mount(&server)
            .await;

        let mut config = TestConfig::default().to_app_config();
        config.whatsapp_api_base_url = server.uri();
        let err = WhatsAppClient::new(&config).send_text("x", "hola").await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 400, .. }));
    }
}
