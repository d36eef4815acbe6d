// libs/conversation-cell/src/services/machine.rs
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::{error, info, instrument, warn};

use agenda_cell::models::{
    hhmm, AgendaError, BookingError, PatientIdentity, Professional, Slot, SLOT_DATE_FORMAT,
};
use agenda_cell::services::identity::{normalize_name, normalize_phone, normalize_rut};
use agenda_cell::services::{AgendaService, BookingService, Directory};

use crate::models::{
    Classification, ConversationState, Effect, InboundMessage, InboundPayload, Intent, ListRow,
    ListSection, Outcome, ReplyButton, SlotChoice,
};
use crate::services::classifier::{normalize_text, IntentClassifier};
use crate::services::transport::MAX_LIST_ROWS;

// Option ids carried by buttons and list rows.
const MENU_BOOK: &str = "menu:book";
const MENU_HUMAN: &str = "menu:human";
const PHONE_SAME: &str = "phone:same";
const CONFIRM_YES: &str = "confirm:yes";
const CONFIRM_NO: &str = "confirm:no";
const PROFESSIONAL_PREFIX: &str = "pro:";
const DATE_PREFIX: &str = "date:";
const SLOT_PREFIX: &str = "slot:";

const GREETING: &str = "¡Hola! Soy el asistente del centro. ¿En qué te puedo ayudar?";
const MENU_PROMPT: &str = "Volvamos a empezar. ¿Qué necesitas?";
const CANCELLED: &str = "Listo, cancelé la solicitud. Escríbenos cuando quieras agendar.";
const DISCARDED: &str = "No agendé la hora. ¿Te ayudo con algo más?";
const HANDOFF_REPLY: &str = "Te voy a comunicar con una persona del equipo. Te escribirán por este mismo chat.";
const NO_PROFESSIONALS: &str = "Por ahora no hay profesionales con agenda disponible. Inténtalo más tarde.";
const NOT_UNDERSTOOD: &str = "No encontré esa opción.";
const DAY_FULL: &str = "Ya no quedan horas para ese día.";
const SLOT_GONE: &str = "Esa hora ya no está disponible.";
const SLOT_TAKEN: &str = "Lo siento, esa hora acaba de ser tomada por otra persona.";
const ASK_NAME: &str = "¿Cuál es tu nombre completo?";
const ASK_RUT: &str = "Gracias. Ahora indícame tu RUT (por ejemplo 12.345.678-5).";
const BAD_NAME: &str = "El nombre debe tener al menos 3 letras.";
const BAD_RUT: &str = "Ese RUT no es válido. Revisa el número y el dígito verificador.";
const ASK_PHONE: &str = "¿A qué teléfono te contactamos? Escríbelo o usa este mismo número.";
const BAD_PHONE: &str = "Ese teléfono no es válido. Debe tener entre 8 y 15 dígitos.";
const BAD_PATIENT: &str = "Hubo un problema con tus datos.";
pub(crate) const APOLOGY: &str = "Lo siento, tuvimos un problema técnico. Por favor inténtalo de nuevo en unos minutos.";

const WEEKDAYS: [&str; 7] = ["Lunes", "Martes", "Miércoles", "Jueves", "Viernes", "Sábado", "Domingo"];

/// Booking dialogue. Each call consumes the stored state and one inbound
/// message and returns the next state plus the messages to send.
pub struct ConversationMachine {
    center_id: String,
    agenda: Arc<AgendaService>,
    booking: Arc<BookingService>,
    directory: Arc<dyn Directory>,
    classifier: Arc<dyn IntentClassifier>,
    days_ahead: u32,
}

impl ConversationMachine {
    pub fn new(
        agenda: Arc<AgendaService>,
        booking: Arc<BookingService>,
        directory: Arc<dyn Directory>,
        classifier: Arc<dyn IntentClassifier>,
        days_ahead: u32,
    ) -> Self {
        Self {
            center_id: agenda.center_id().to_string(),
            agenda,
            booking,
            directory,
            classifier,
            days_ahead,
        }
    }

    #[instrument(skip(self, state, message), fields(phone = %message.from, state = state.name()))]
    pub async fn handle(&self, state: ConversationState, message: &InboundMessage, now: NaiveDateTime) -> Outcome {
        if let Some(outcome) = global_command(&state, message) {
            return outcome;
        }

        match self.step(state, message, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Conversation step failed for {}: {}", message.from, e);
                Outcome::end(vec![text(&message.from, APOLOGY)])
            }
        }
    }

    async fn step(
        &self,
        state: ConversationState,
        message: &InboundMessage,
        now: NaiveDateTime,
    ) -> Result<Outcome, AgendaError> {
        let to = message.from.as_str();

        match state {
            ConversationState::Idle => self.on_idle(message).await,
            ConversationState::ChoosingDoctor => self.on_choosing_doctor(message, now).await,
            ConversationState::ChoosingDate { professional_id, professional_name } => {
                self.on_choosing_date(professional_id, professional_name, message, now).await
            }
            ConversationState::ChoosingSlot { professional_id, professional_name, date } => {
                self.on_choosing_slot(professional_id, professional_name, date, message, now).await
            }
            ConversationState::CollectingName { choice } => Ok(on_name(to, choice, message)),
            ConversationState::CollectingRut { choice, name } => Ok(on_rut(to, choice, name, message)),
            ConversationState::CollectingPhone { choice, name, rut } => Ok(on_phone(to, choice, name, rut, message)),
            ConversationState::Confirming { choice, patient } => {
                self.on_confirming(choice, patient, message, now).await
            }
            ConversationState::Handoff => Ok(Outcome::stay(ConversationState::Handoff, Vec::new())),
        }
    }

    // ==============================================================================
    // STEPS
    // ==============================================================================

    async fn on_idle(&self, message: &InboundMessage) -> Result<Outcome, AgendaError> {
        let to = message.from.as_str();
        let classification = match message.selection_id() {
            Some(MENU_BOOK) => Classification::of(Intent::Booking),
            Some(MENU_HUMAN) => Classification::of(Intent::Handoff),
            _ => self.classify(message.display_text()).await,
        };

        match classification.intent {
            Intent::Booking => self.offer_professionals(to, None).await,
            Intent::Handoff => {
                info!("Caller {} asked for a human", to);
                Ok(Outcome::stay(
                    ConversationState::Handoff,
                    vec![
                        text(to, HANDOFF_REPLY),
                        Effect::NotifyHandoff {
                            phone: to.to_string(),
                            last_message: message.display_text().to_string(),
                        },
                    ],
                ))
            }
            Intent::General => {
                let body = classification.say.as_deref().unwrap_or(GREETING);
                Ok(Outcome::end(vec![menu(to, body)]))
            }
        }
    }

    async fn on_choosing_doctor(&self, message: &InboundMessage, now: NaiveDateTime) -> Result<Outcome, AgendaError> {
        let to = message.from.as_str();
        let professionals = self.professionals().await?;
        if professionals.is_empty() {
            return Ok(Outcome::end(vec![text(to, NO_PROFESSIONALS)]));
        }

        match pick_professional(&professionals, message) {
            Some(professional) => self.offer_dates(to, &professional.id, &professional.name, now, None).await,
            None => Ok(Outcome::stay(
                ConversationState::ChoosingDoctor,
                vec![professional_list(to, Some(NOT_UNDERSTOOD), &professionals)],
            )),
        }
    }

    async fn on_choosing_date(
        &self,
        professional_id: String,
        professional_name: String,
        message: &InboundMessage,
        now: NaiveDateTime,
    ) -> Result<Outcome, AgendaError> {
        let to = message.from.as_str();
        let dates = self.bookable_dates(&professional_id, now).await?;
        if dates.is_empty() {
            let note = format!("{} ya no tiene horas disponibles.", professional_name);
            return self.offer_professionals(to, Some(&note)).await;
        }

        match pick_date(&dates, message) {
            Some(date) => self.offer_slots(to, professional_id, professional_name, date, now, None).await,
            None => Ok(Outcome::stay(
                ConversationState::ChoosingDate {
                    professional_id,
                    professional_name: professional_name.clone(),
                },
                vec![date_list(to, Some(NOT_UNDERSTOOD), &professional_name, &dates)],
            )),
        }
    }

    async fn on_choosing_slot(
        &self,
        professional_id: String,
        professional_name: String,
        date: NaiveDate,
        message: &InboundMessage,
        now: NaiveDateTime,
    ) -> Result<Outcome, AgendaError> {
        let to = message.from.as_str();
        let slots = self.bookable_slots(&professional_id, date, now).await?;
        if slots.is_empty() {
            return self.offer_dates(to, &professional_id, &professional_name, now, Some(DAY_FULL)).await;
        }

        let Some(slot) = pick_slot(&slots, message) else {
            let note = if names_a_slot(message) { SLOT_GONE } else { NOT_UNDERSTOOD };
            return Ok(Outcome::stay(
                ConversationState::ChoosingSlot { professional_id, professional_name, date },
                vec![slot_list(to, Some(note), date, &slots)],
            ));
        };

        let choice = SlotChoice {
            professional_id,
            professional_name,
            date,
            slot_id: slot.id.clone(),
            time: slot.time_label(),
        };
        Ok(Outcome::stay(ConversationState::CollectingName { choice }, vec![text(to, ASK_NAME)]))
    }

    async fn on_confirming(
        &self,
        choice: SlotChoice,
        patient: PatientIdentity,
        message: &InboundMessage,
        now: NaiveDateTime,
    ) -> Result<Outcome, AgendaError> {
        let to = message.from.as_str();
        match confirmation(message) {
            Some(true) => self.book(to, choice, patient, now).await,
            Some(false) => Ok(Outcome::end(vec![menu(to, DISCARDED)])),
            None => {
                let prompt = confirmation_prompt(to, &choice, &patient);
                Ok(Outcome::stay(ConversationState::Confirming { choice, patient }, vec![prompt]))
            }
        }
    }

    async fn book(
        &self,
        to: &str,
        choice: SlotChoice,
        patient: PatientIdentity,
        now: NaiveDateTime,
    ) -> Result<Outcome, AgendaError> {
        match self.booking.book(&choice.slot_id, &patient).await {
            Ok(slot) => {
                info!("Caller {} booked {}", to, slot.id);
                let body = format!(
                    "¡Listo! Tu hora con {} quedó agendada para el {} a las {}. Te esperamos.",
                    choice.professional_name,
                    date_label(choice.date),
                    slot.time_label()
                );
                Ok(Outcome::end(vec![text(to, &body)]))
            }
            Err(BookingError::SlotTaken) => {
                info!("Slot {} was taken before {} confirmed", choice.slot_id, to);
                self.offer_slots(to, choice.professional_id, choice.professional_name, choice.date, now, Some(SLOT_TAKEN))
                    .await
            }
            Err(BookingError::InvalidPatient(reason)) => {
                warn!("Patient data of {} rejected at booking: {}", to, reason);
                let body = format!("{} {}", BAD_PATIENT, ASK_NAME);
                Ok(Outcome::stay(ConversationState::CollectingName { choice }, vec![text(to, &body)]))
            }
            Err(e) => {
                error!("Booking {} failed: {}", choice.slot_id, e);
                Ok(Outcome::end(vec![text(to, APOLOGY)]))
            }
        }
    }

    // ==============================================================================
    // OFFERS
    // ==============================================================================

    async fn offer_professionals(&self, to: &str, note: Option<&str>) -> Result<Outcome, AgendaError> {
        let professionals = self.professionals().await?;
        if professionals.is_empty() {
            return Ok(Outcome::end(vec![text(to, NO_PROFESSIONALS)]));
        }
        Ok(Outcome::stay(
            ConversationState::ChoosingDoctor,
            vec![professional_list(to, note, &professionals)],
        ))
    }

    async fn offer_dates(
        &self,
        to: &str,
        professional_id: &str,
        professional_name: &str,
        now: NaiveDateTime,
        note: Option<&str>,
    ) -> Result<Outcome, AgendaError> {
        let dates = self.bookable_dates(professional_id, now).await?;
        if dates.is_empty() {
            let note = format!(
                "{} no tiene horas disponibles en los próximos {} días.",
                professional_name, self.days_ahead
            );
            return self.offer_professionals(to, Some(&note)).await;
        }

        Ok(Outcome::stay(
            ConversationState::ChoosingDate {
                professional_id: professional_id.to_string(),
                professional_name: professional_name.to_string(),
            },
            vec![date_list(to, note, professional_name, &dates)],
        ))
    }

    async fn offer_slots(
        &self,
        to: &str,
        professional_id: String,
        professional_name: String,
        date: NaiveDate,
        now: NaiveDateTime,
        note: Option<&str>,
    ) -> Result<Outcome, AgendaError> {
        let slots = self.bookable_slots(&professional_id, date, now).await?;
        if slots.is_empty() {
            let note = note.map_or_else(|| DAY_FULL.to_string(), |n| format!("{} {}", n, DAY_FULL));
            return self.offer_dates(to, &professional_id, &professional_name, now, Some(&note)).await;
        }

        Ok(Outcome::stay(
            ConversationState::ChoosingSlot { professional_id, professional_name, date },
            vec![slot_list(to, note, date, &slots)],
        ))
    }

    // ==============================================================================
    // QUERIES
    // ==============================================================================

    async fn classify(&self, message: &str) -> Classification {
        let context = format!("Centro médico {}", self.center_id);
        match self.classifier.classify(message, &context).await {
            Ok(classification) => classification,
            Err(e) => {
                warn!("Intent classification failed, answering generally: {}", e);
                Classification::of(Intent::General)
            }
        }
    }

    async fn professionals(&self) -> Result<Vec<Professional>, AgendaError> {
        self.directory
            .professionals(&self.center_id)
            .await
            .map_err(|e| AgendaError::Storage(e.to_string()))
    }

    /// Open slots of the day that have not started yet.
    async fn bookable_slots(
        &self,
        professional_id: &str,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<Vec<Slot>, AgendaError> {
        let mut slots = self.agenda.open_slots(professional_id, date).await?;
        slots.retain(|slot| slot.date.and_time(slot.time) > now);
        slots.sort_by_key(|slot| slot.time);
        Ok(slots)
    }

    async fn bookable_dates(&self, professional_id: &str, now: NaiveDateTime) -> Result<Vec<NaiveDate>, AgendaError> {
        let today = now.date();
        let mut dates = self.agenda.open_dates(professional_id, today, self.days_ahead).await?;
        if dates.first() == Some(&today) && self.bookable_slots(professional_id, today, now).await?.is_empty() {
            dates.remove(0);
        }
        Ok(dates)
    }
}

// ==============================================================================
// PURE STEPS
// ==============================================================================

/// Keywords honoured in every state. Only typed text counts, never a tapped option.
fn global_command(state: &ConversationState, message: &InboundMessage) -> Option<Outcome> {
    let InboundPayload::Text(body) = &message.payload else {
        return None;
    };
    let to = message.from.as_str();

    match normalize_text(body).as_str() {
        "cancelar" if !matches!(state, ConversationState::Idle | ConversationState::Handoff) => {
            Some(Outcome::end(vec![text(to, CANCELLED)]))
        }
        "reiniciar" | "menu" => Some(Outcome::end(vec![menu(to, MENU_PROMPT)])),
        _ => None,
    }
}

fn on_name(to: &str, choice: SlotChoice, message: &InboundMessage) -> Outcome {
    match normalize_name(message.display_text()) {
        Some(name) => Outcome::stay(ConversationState::CollectingRut { choice, name }, vec![text(to, ASK_RUT)]),
        None => Outcome::stay(
            ConversationState::CollectingName { choice },
            vec![text(to, &format!("{} {}", BAD_NAME, ASK_NAME))],
        ),
    }
}

fn on_rut(to: &str, choice: SlotChoice, name: String, message: &InboundMessage) -> Outcome {
    match normalize_rut(message.display_text()) {
        Some(rut) => Outcome::stay(
            ConversationState::CollectingPhone { choice, name, rut },
            vec![phone_prompt(to, ASK_PHONE)],
        ),
        None => Outcome::stay(ConversationState::CollectingRut { choice, name }, vec![text(to, BAD_RUT)]),
    }
}

fn on_phone(to: &str, choice: SlotChoice, name: String, rut: String, message: &InboundMessage) -> Outcome {
    let same_number = message.selection_id() == Some(PHONE_SAME)
        || normalize_text(message.display_text()).contains("mismo");
    let phone = if same_number {
        normalize_phone(to)
    } else {
        normalize_phone(message.display_text())
    };

    match phone {
        Some(phone) => {
            let patient = PatientIdentity { name, rut, phone };
            let prompt = confirmation_prompt(to, &choice, &patient);
            Outcome::stay(ConversationState::Confirming { choice, patient }, vec![prompt])
        }
        None => Outcome::stay(
            ConversationState::CollectingPhone { choice, name, rut },
            vec![phone_prompt(to, BAD_PHONE)],
        ),
    }
}

fn confirmation(message: &InboundMessage) -> Option<bool> {
    match message.selection_id() {
        Some(CONFIRM_YES) => return Some(true),
        Some(CONFIRM_NO) => return Some(false),
        _ => {}
    }
    match normalize_text(message.display_text()).as_str() {
        "si" | "confirmar" | "confirmo" | "ok" | "dale" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

// ==============================================================================
// SELECTION PARSING
// ==============================================================================

/// 1-based position of a typed number within `len` offered options.
fn typed_index(message: &InboundMessage, len: usize) -> Option<usize> {
    let n: usize = message.display_text().trim().parse().ok()?;
    (1..=len).contains(&n).then(|| n - 1)
}

fn pick_professional<'a>(professionals: &'a [Professional], message: &InboundMessage) -> Option<&'a Professional> {
    if let Some(id) = message.selection_id().and_then(|id| id.strip_prefix(PROFESSIONAL_PREFIX)) {
        return professionals.iter().find(|p| p.id == id);
    }
    if let Some(index) = typed_index(message, professionals.len()) {
        return professionals.get(index);
    }

    let typed = normalize_text(message.display_text());
    if typed.chars().count() < 3 {
        return None;
    }
    professionals.iter().find(|p| normalize_text(&p.name).contains(&typed))
}

fn pick_date(dates: &[NaiveDate], message: &InboundMessage) -> Option<NaiveDate> {
    let wanted = match message.selection_id().and_then(|id| id.strip_prefix(DATE_PREFIX)) {
        Some(raw) => NaiveDate::parse_from_str(raw, SLOT_DATE_FORMAT).ok()?,
        None => {
            if let Some(index) = typed_index(message, dates.len()) {
                return dates.get(index).copied();
            }
            let typed = normalize_text(message.display_text());
            return dates.iter().copied().find(|date| {
                date.format(SLOT_DATE_FORMAT).to_string() == typed
                    || date.format("%d/%m").to_string() == typed
                    || normalize_text(&date_label(*date)) == typed
            });
        }
    };
    dates.contains(&wanted).then_some(wanted)
}

fn pick_slot<'a>(slots: &'a [Slot], message: &InboundMessage) -> Option<&'a Slot> {
    if let Some(id) = message.selection_id().and_then(|id| id.strip_prefix(SLOT_PREFIX)) {
        return slots.iter().find(|slot| slot.id.as_str() == id);
    }
    let time = hhmm::parse(message.display_text()).ok()?;
    slots.iter().find(|slot| slot.time == time)
}

/// A slot pick or a typed time, whether or not it is still offered.
fn names_a_slot(message: &InboundMessage) -> bool {
    message.selection_id().is_some_and(|id| id.starts_with(SLOT_PREFIX))
        || hhmm::parse(message.display_text()).is_ok()
}

// ==============================================================================
// MESSAGE BUILDERS
// ==============================================================================

fn text(to: &str, body: &str) -> Effect {
    Effect::SendText { to: to.to_string(), body: body.to_string() }
}

fn with_note(note: Option<&str>, body: &str) -> String {
    match note {
        Some(note) => format!("{} {}", note, body),
        None => body.to_string(),
    }
}

fn menu(to: &str, body: &str) -> Effect {
    Effect::SendButtons {
        to: to.to_string(),
        body: body.to_string(),
        buttons: vec![
            ReplyButton::new(MENU_BOOK, "Agendar hora"),
            ReplyButton::new(MENU_HUMAN, "Hablar con alguien"),
        ],
    }
}

fn phone_prompt(to: &str, body: &str) -> Effect {
    Effect::SendButtons {
        to: to.to_string(),
        body: body.to_string(),
        buttons: vec![ReplyButton::new(PHONE_SAME, "Este mismo número")],
    }
}

fn list(to: &str, body: String, button_label: &str, section: &str, rows: Vec<ListRow>) -> Effect {
    Effect::SendList {
        to: to.to_string(),
        body,
        button_label: button_label.to_string(),
        sections: vec![ListSection { title: section.to_string(), rows }],
    }
}

fn professional_list(to: &str, note: Option<&str>, professionals: &[Professional]) -> Effect {
    let rows = professionals
        .iter()
        .take(MAX_LIST_ROWS)
        .map(|p| ListRow {
            id: format!("{}{}", PROFESSIONAL_PREFIX, p.id),
            title: p.name.clone(),
            description: p.specialty.clone(),
        })
        .collect();
    list(
        to,
        with_note(note, "¿Con qué profesional quieres atenderte?"),
        "Ver profesionales",
        "Profesionales",
        rows,
    )
}

fn date_list(to: &str, note: Option<&str>, professional_name: &str, dates: &[NaiveDate]) -> Effect {
    let rows = dates
        .iter()
        .take(MAX_LIST_ROWS)
        .map(|date| ListRow {
            id: format!("{}{}", DATE_PREFIX, date.format(SLOT_DATE_FORMAT)),
            title: date_label(*date),
            description: None,
        })
        .collect();
    let body = format!("Estos son los días con horas disponibles de {}:", professional_name);
    list(to, with_note(note, &body), "Ver días", "Días", rows)
}

fn slot_list(to: &str, note: Option<&str>, date: NaiveDate, slots: &[Slot]) -> Effect {
    let rows = slots
        .iter()
        .take(MAX_LIST_ROWS)
        .map(|slot| ListRow {
            id: format!("{}{}", SLOT_PREFIX, slot.id),
            title: slot.time_label(),
            description: None,
        })
        .collect();

    let mut body = format!("Horas disponibles el {}:", date_label(date));
    if slots.len() > MAX_LIST_ROWS {
        body.push_str(&format!(
            " Te muestro las primeras {}; si prefieres otra, escríbela como HH:MM.",
            MAX_LIST_ROWS
        ));
    }
    list(to, with_note(note, &body), "Ver horas", "Horas", rows)
}

fn confirmation_prompt(to: &str, choice: &SlotChoice, patient: &PatientIdentity) -> Effect {
    Effect::SendButtons {
        to: to.to_string(),
        body: format!(
            "Revisa tu reserva:\nProfesional: {}\nDía: {}\nHora: {}\nNombre: {}\nRUT: {}\nTeléfono: {}\n¿Confirmas?",
            choice.professional_name,
            date_label(choice.date),
            choice.time,
            patient.name,
            patient.rut,
            patient.phone
        ),
        buttons: vec![
            ReplyButton::new(CONFIRM_YES, "Confirmar"),
            ReplyButton::new(CONFIRM_NO, "No, gracias"),
        ],
    }
}

fn date_label(date: NaiveDate) -> String {
    let weekday = WEEKDAYS[date.weekday().num_days_from_monday() as usize];
    format!("{} {}", weekday, date.format("%d/%m"))
}
