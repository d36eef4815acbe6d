// libs/conversation-cell/src/models.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use agenda_cell::models::{PatientIdentity, SlotId};

// ==============================================================================
// CONVERSATION STATE
// ==============================================================================

/// What the caller picked so far: professional, day and slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotChoice {
    pub professional_id: String,
    pub professional_name: String,
    pub date: NaiveDate,
    pub slot_id: SlotId,
    pub time: String,
}

/// Dialogue position of one caller. Each step carries only what it needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    #[default]
    Idle,
    ChoosingDoctor,
    ChoosingDate {
        professional_id: String,
        professional_name: String,
    },
    ChoosingSlot {
        professional_id: String,
        professional_name: String,
        date: NaiveDate,
    },
    CollectingName {
        choice: SlotChoice,
    },
    CollectingRut {
        choice: SlotChoice,
        name: String,
    },
    CollectingPhone {
        choice: SlotChoice,
        name: String,
        rut: String,
    },
    Confirming {
        choice: SlotChoice,
        patient: PatientIdentity,
    },
    Handoff,
}

impl ConversationState {
    pub fn name(&self) -> &'static str {
        match self {
            ConversationState::Idle => "IDLE",
            ConversationState::ChoosingDoctor => "CHOOSING_DOCTOR",
            ConversationState::ChoosingDate { .. } => "CHOOSING_DATE",
            ConversationState::ChoosingSlot { .. } => "CHOOSING_SLOT",
            ConversationState::CollectingName { .. } => "COLLECTING_NAME",
            ConversationState::CollectingRut { .. } => "COLLECTING_RUT",
            ConversationState::CollectingPhone { .. } => "COLLECTING_PHONE",
            ConversationState::Confirming { .. } => "CONFIRMING",
            ConversationState::Handoff => "HANDOFF",
        }
    }
}

/// Persisted session of a caller, keyed by phone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub phone: String,
    pub state: ConversationState,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_expired(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        now - self.updated_at > idle_timeout
    }
}

// ==============================================================================
// INBOUND MESSAGES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    Text(String),
    /// A tapped button or list row.
    Selection { id: String, title: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: String,
    pub message_id: String,
    pub payload: InboundPayload,
}

impl InboundMessage {
    pub fn text(from: &str, body: &str) -> Self {
        Self {
            from: from.to_string(),
            message_id: String::new(),
            payload: InboundPayload::Text(body.to_string()),
        }
    }

    pub fn selection(from: &str, id: &str, title: &str) -> Self {
        Self {
            from: from.to_string(),
            message_id: String::new(),
            payload: InboundPayload::Selection {
                id: id.to_string(),
                title: title.to_string(),
            },
        }
    }

    /// Free text, or the title of a tapped option.
    pub fn display_text(&self) -> &str {
        match &self.payload {
            InboundPayload::Text(body) => body,
            InboundPayload::Selection { title, .. } => title,
        }
    }

    pub fn selection_id(&self) -> Option<&str> {
        match &self.payload {
            InboundPayload::Selection { id, .. } => Some(id),
            InboundPayload::Text(_) => None,
        }
    }
}

// ==============================================================================
// CLASSIFICATION
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Booking,
    Handoff,
    General,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    /// Optional reply text for general questions.
    #[serde(default)]
    pub say: Option<String>,
}

impl Classification {
    pub fn of(intent: Intent) -> Self {
        Self { intent, say: None }
    }
}

// ==============================================================================
// EFFECTS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

impl ReplyButton {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self { id: id.into(), title: title.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

/// Outbound side effects a transition asks for. The driver runs them after the
/// new state is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SendText {
        to: String,
        body: String,
    },
    SendButtons {
        to: String,
        body: String,
        buttons: Vec<ReplyButton>,
    },
    SendList {
        to: String,
        body: String,
        button_label: String,
        sections: Vec<ListSection>,
    },
    NotifyHandoff {
        phone: String,
        last_message: String,
    },
}

/// Result of one transition. `next == None` ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub next: Option<ConversationState>,
    pub effects: Vec<Effect>,
}

impl Outcome {
    pub fn stay(state: ConversationState, effects: Vec<Effect>) -> Self {
        Self { next: Some(state), effects }
    }

    pub fn end(effects: Vec<Effect>) -> Self {
        Self { next: None, effects }
    }

    /// State name after the transition, `IDLE` when the session ended.
    pub fn state_name(&self) -> &'static str {
        self.next.as_ref().map_or("IDLE", ConversationState::name)
    }
}

// ==============================================================================
// WEBHOOK PAYLOADS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookChange {
    #[serde(default)]
    pub value: WebhookValue,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookValue {
    #[serde(default)]
    pub messages: Vec<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookMessage {
    pub from: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<WebhookText>,
    pub interactive: Option<WebhookInteractive>,
    pub button: Option<WebhookButton>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookText {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookInteractive {
    pub button_reply: Option<WebhookReply>,
    pub list_reply: Option<WebhookReply>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookReply {
    pub id: String,
    pub title: String,
}

/// Quick-reply button of a template message.
#[derive(Debug, Deserialize)]
pub struct WebhookButton {
    pub payload: String,
    pub text: String,
}

impl WebhookPayload {
    /// Text and interactive replies; statuses and media are skipped.
    pub fn into_messages(self) -> Vec<InboundMessage> {
        self.entry
            .into_iter()
            .flat_map(|entry| entry.changes)
            .flat_map(|change| change.value.messages)
            .filter_map(WebhookMessage::into_inbound)
            .collect()
    }
}

impl WebhookMessage {
    fn into_inbound(self) -> Option<InboundMessage> {
        let payload = match self.kind.as_str() {
            "text" => InboundPayload::Text(self.text?.body),
            "interactive" => {
                let interactive = self.interactive?;
                let reply = interactive.button_reply.or(interactive.list_reply)?;
                InboundPayload::Selection { id: reply.id, title: reply.title }
            }
            "button" => {
                let button = self.button?;
                InboundPayload::Selection { id: button.payload, title: button.text }
            }
            _ => return None,
        };

        Some(InboundMessage {
            from: self.from,
            message_id: self.id,
            payload,
        })
    }
}
