// libs/agenda-cell/src/services/booking.rs
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::models::{BookingError, PatientIdentity, Slot, SlotId};
use crate::services::audit::{AuditEvent, AuditSink};
use crate::services::identity::validate_patient;
use crate::services::repository::{ReserveError, SlotRepository};

/// Tells a patient their booking was cancelled.
#[async_trait]
pub trait CancellationNotifier: Send + Sync {
    async fn notify_cancellation(&self, slot: &Slot) -> anyhow::Result<()>;
}

pub struct BookingService {
    center_id: String,
    repo: Arc<dyn SlotRepository>,
    audit: Arc<dyn AuditSink>,
    notifier: Option<Arc<dyn CancellationNotifier>>,
}

impl BookingService {
    pub fn new(center_id: &str, repo: Arc<dyn SlotRepository>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            center_id: center_id.to_string(),
            repo,
            audit,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CancellationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Compare-and-set reservation. An already booked or closed slot yields
    /// `SlotTaken` and nothing is written.
    #[instrument(skip(self, patient), fields(slot_id = %slot_id))]
    pub async fn book(&self, slot_id: &SlotId, patient: &PatientIdentity) -> Result<Slot, BookingError> {
        let patient = validate_patient(patient)
            .map_err(|e| BookingError::InvalidPatient(e.to_string()))?;

        let key = slot_id
            .parse()
            .filter(|key| key.center_id == self.center_id)
            .ok_or_else(|| BookingError::InvalidSlot(slot_id.clone()))?;

        match self.repo.reserve(&key, &patient).await {
            Ok(slot) => {
                info!("Slot {} booked", slot.id);
                self.audit
                    .log_activity(AuditEvent::slot(
                        "slot_booked",
                        &slot.id,
                        json!({
                            "professional_id": slot.professional_id,
                            "date": slot.date,
                            "time": slot.time_label(),
                            "patient_rut": patient.rut,
                        }),
                    ))
                    .await;
                Ok(slot)
            }
            Err(ReserveError::Taken) => {
                info!("Slot {} already taken", slot_id);
                Err(BookingError::SlotTaken)
            }
            Err(ReserveError::Store(e)) => {
                error!("Booking of {} failed: {}", slot_id, e);
                Err(BookingError::Technical(e.to_string()))
            }
        }
    }

    /// Reverts a booking. Cancelling an open or unknown slot is a no-op that
    /// returns `None`.
    #[instrument(skip(self), fields(slot_id = %slot_id))]
    pub async fn cancel(&self, slot_id: &SlotId) -> Result<Option<Slot>, BookingError> {
        let released = self.repo.release(slot_id).await.map_err(|e| {
            error!("Cancellation of {} failed: {}", slot_id, e);
            BookingError::Technical(e.to_string())
        })?;

        match &released {
            Some(slot) => {
                info!("Booking on {} cancelled", slot_id);
                self.audit
                    .log_activity(AuditEvent::slot(
                        "slot_cancelled",
                        slot_id,
                        json!({
                            "professional_id": slot.professional_id,
                            "date": slot.date,
                            "time": slot.time_label(),
                        }),
                    ))
                    .await;
            }
            None => debug!("Nothing to cancel on {}", slot_id),
        }

        Ok(released)
    }

    /// Cancels, then messages the patient in the background when asked to and
    /// a phone is on file.
    pub async fn cancel_and_notify(&self, slot_id: &SlotId, notify: bool) -> Result<Option<Slot>, BookingError> {
        let released = self.cancel(slot_id).await?;

        if let (true, Some(slot), Some(notifier)) = (notify, released.clone(), self.notifier.clone()) {
            if slot.patient_phone.as_deref().is_some_and(|p| !p.is_empty()) {
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify_cancellation(&slot).await {
                        warn!("Cancellation notice for {} not delivered: {}", slot.id, e);
                    }
                });
            }
        }

        Ok(released)
    }
}
