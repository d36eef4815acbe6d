// libs/conversation-cell/src/services/driver.rs
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Local, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::TransportError;
use crate::models::{Conversation, ConversationState, Effect, InboundMessage};
use crate::services::machine::{ConversationMachine, APOLOGY};
use crate::services::store::ConversationStore;
use crate::services::transport::MessageTransport;

/// Runs inbound messages through the machine: one at a time per caller, in
/// arrival order, state stored before any reply goes out.
pub struct ConversationDriver {
    machine: Arc<ConversationMachine>,
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn MessageTransport>,
    idle_timeout: Duration,
    handoff_notify_phone: Option<String>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    queues: Mutex<HashMap<String, UnboundedSender<InboundMessage>>>,
}

impl ConversationDriver {
    pub fn new(
        machine: Arc<ConversationMachine>,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn MessageTransport>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            machine,
            store,
            transport,
            idle_timeout,
            handoff_notify_phone: None,
            locks: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Staff phone that hears about callers asking for a human.
    pub fn with_handoff_notify_phone(mut self, phone: Option<String>) -> Self {
        self.handoff_notify_phone = phone;
        self
    }

    /// Queues a message behind the caller's earlier ones. A worker per caller
    /// drains the queue and stops once it is empty.
    pub async fn enqueue(self: &Arc<Self>, message: InboundMessage) {
        let mut queues = self.queues.lock().await;
        let message = match queues.get(&message.from) {
            Some(queue) => match queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let phone = message.from.clone();
        let (queue, pending) = mpsc::unbounded_channel();
        // Sending cannot fail while `pending` is alive
        let _ = queue.send(message);
        queues.insert(phone.clone(), queue);
        tokio::spawn(self.clone().drain(phone, pending));
    }

    async fn drain(self: Arc<Self>, phone: String, mut pending: UnboundedReceiver<InboundMessage>) {
        loop {
            let message = match pending.try_recv() {
                Ok(message) => message,
                Err(_) => {
                    // Checked again under the map lock so no enqueue slips past
                    let mut queues = self.queues.lock().await;
                    match pending.try_recv() {
                        Ok(message) => message,
                        Err(_) => {
                            queues.remove(&phone);
                            return;
                        }
                    }
                }
            };

            let sends = self.handle_inbound(message).await;
            if let Err(e) = sends.await {
                error!("Reply task for {} panicked: {}", phone, e);
            }
        }
    }

    async fn lock_for(&self, phone: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(phone.to_string()).or_default().clone()
    }

    async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Advances the caller's conversation and spawns the outbound sends.
    /// The returned handle resolves once every send was attempted.
    #[instrument(skip(self, message), fields(phone = %message.from))]
    pub async fn handle_inbound(&self, message: InboundMessage) -> JoinHandle<()> {
        let lock = self.lock_for(&message.from).await;
        let effects = {
            let _guard = lock.lock().await;
            self.advance(&message).await
        };
        drop(lock);
        self.prune_locks().await;

        self.dispatch(effects)
    }

    /// Store failures never leave the caller without a reply: an unreadable or
    /// unsaved session turns into an apology and is cleared.
    async fn advance(&self, message: &InboundMessage) -> Vec<Effect> {
        let now = Utc::now();
        let state = match self.store.load(&message.from).await {
            Ok(Some(conversation)) if conversation.is_expired(now, self.idle_timeout) => {
                info!("Conversation of {} expired in {}", message.from, conversation.state.name());
                ConversationState::Idle
            }
            Ok(Some(conversation)) => conversation.state,
            Ok(None) => ConversationState::Idle,
            Err(e) => {
                error!("Loading conversation of {} failed: {}", message.from, e);
                self.forget(&message.from).await;
                return vec![apology(&message.from)];
            }
        };

        let from = state.name();
        let outcome = self.machine.handle(state, message, Local::now().naive_local()).await;
        debug!("{} -> {}", from, outcome.state_name());

        match &outcome.next {
            Some(next) => {
                let saved = self
                    .store
                    .save(&Conversation {
                        phone: message.from.clone(),
                        state: next.clone(),
                        updated_at: now,
                    })
                    .await;
                if let Err(e) = saved {
                    error!("Saving conversation of {} failed: {}", message.from, e);
                    self.forget(&message.from).await;
                    return vec![apology(&message.from)];
                }
            }
            // The session is over either way; its replies still go out
            None => self.forget(&message.from).await,
        }

        outcome.effects
    }

    async fn forget(&self, phone: &str) {
        if let Err(e) = self.store.delete(phone).await {
            warn!("Clearing conversation of {} failed: {}", phone, e);
        }
    }

    fn dispatch(&self, effects: Vec<Effect>) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let handoff_notify_phone = self.handoff_notify_phone.clone();

        tokio::spawn(async move {
            for effect in effects {
                if let Err(e) = execute(transport.as_ref(), handoff_notify_phone.as_deref(), &effect).await {
                    error!("Failed to deliver {:?}: {}", effect_kind(&effect), e);
                }
            }
        })
    }
}

fn apology(to: &str) -> Effect {
    Effect::SendText {
        to: to.to_string(),
        body: APOLOGY.to_string(),
    }
}

fn effect_kind(effect: &Effect) -> &'static str {
    match effect {
        Effect::SendText { .. } => "text",
        Effect::SendButtons { .. } => "buttons",
        Effect::SendList { .. } => "list",
        Effect::NotifyHandoff { .. } => "handoff notice",
    }
}

async fn execute(
    transport: &dyn MessageTransport,
    handoff_notify_phone: Option<&str>,
    effect: &Effect,
) -> Result<(), TransportError> {
    match effect {
        Effect::SendText { to, body } => transport.send_text(to, body).await,
        Effect::SendButtons { to, body, buttons } => transport.send_buttons(to, body, buttons).await,
        Effect::SendList { to, body, button_label, sections } => {
            transport.send_list(to, body, button_label, sections).await
        }
        Effect::NotifyHandoff { phone, last_message } => match handoff_notify_phone {
            Some(staff) => {
                let body = format!(
                    "El paciente {} pidió hablar con una persona. Último mensaje: \"{}\"",
                    phone, last_message
                );
                transport.send_text(staff, &body).await
            }
            None => {
                warn!("Caller {} is waiting for a human; no handoff phone configured", phone);
                Ok(())
            }
        },
    }
}
