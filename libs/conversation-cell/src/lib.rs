// =====================================================================================
// CONVERSATION CELL - WHATSAPP BOOKING DIALOGUE
// =====================================================================================

pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::{ClassifierError, ConversationError, StoreError, TransportError};
pub use models::{Conversation, ConversationState, Effect, InboundMessage, Outcome};

pub use router::{webhook_routes, WebhookState};
