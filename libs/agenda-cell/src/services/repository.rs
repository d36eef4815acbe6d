// libs/agenda-cell/src/services/repository.rs
//
// Slot persistence. Every implementation must make `reserve` a single atomic
// read-check-write: two concurrent reservations of one slot id never both win.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use shared_database::supabase::{self, SupabaseClient};

use crate::models::{PatientIdentity, Slot, SlotId, SlotKey, SlotOrigin, SLOT_DATE_FORMAT};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed slot document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReserveError {
    #[error("slot already booked or closed")]
    Taken,

    #[error(transparent)]
    Store(#[from] RepositoryError),
}

#[async_trait]
pub trait SlotRepository: Send + Sync {
    async fn get(&self, id: &SlotId) -> Result<Option<Slot>, RepositoryError>;

    /// Writes the slot only when no document with its id exists. Returns
    /// whether it was written.
    async fn insert_if_absent(&self, slot: &Slot) -> Result<bool, RepositoryError>;

    /// Opens or closes a slot that is still available. Booked and missing
    /// slots are left untouched and yield `false`.
    async fn set_active(&self, id: &SlotId, active: bool) -> Result<bool, RepositoryError>;

    /// All slots of a professional between two dates inclusive, chronological.
    async fn list_range(
        &self,
        center_id: &str,
        professional_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, RepositoryError>;

    /// Compare-and-set booking. Creates the slot document when none exists.
    async fn reserve(&self, key: &SlotKey, patient: &PatientIdentity) -> Result<Slot, ReserveError>;

    /// Reverts a booked slot to available. Returns the slot as it was booked,
    /// or `None` when there was nothing to release.
    async fn release(&self, id: &SlotId) -> Result<Option<Slot>, RepositoryError>;
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

#[derive(Default, Clone)]
pub struct InMemorySlotRepository {
    slots: Arc<RwLock<HashMap<SlotId, Slot>>>,
}

impl InMemorySlotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_slots(slots: impl IntoIterator<Item = Slot>) -> Self {
        let repository = Self::new();
        {
            let mut guard = repository.slots.write().await;
            for slot in slots {
                guard.insert(slot.id.clone(), slot);
            }
        }
        repository
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

#[async_trait]
impl SlotRepository for InMemorySlotRepository {
    async fn get(&self, id: &SlotId) -> Result<Option<Slot>, RepositoryError> {
        Ok(self.slots.read().await.get(id).cloned())
    }

    async fn insert_if_absent(&self, slot: &Slot) -> Result<bool, RepositoryError> {
        let mut slots = self.slots.write().await;
        match slots.entry(slot.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let now = Utc::now();
                let mut stored = slot.clone();
                stored.created_at = stored.created_at.or(Some(now));
                stored.updated_at = Some(now);
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn set_active(&self, id: &SlotId, active: bool) -> Result<bool, RepositoryError> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(id) {
            Some(slot) if !slot.is_booked() => {
                slot.active = active;
                slot.updated_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_range(
        &self,
        center_id: &str,
        professional_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, RepositoryError> {
        let slots = self.slots.read().await;
        let mut matching: Vec<Slot> = slots
            .values()
            .filter(|s| s.center_id == center_id && s.professional_id == professional_id)
            .filter(|s| s.date >= from && s.date <= to)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.date, a.time).cmp(&(b.date, b.time)));
        Ok(matching)
    }

    async fn reserve(&self, key: &SlotKey, patient: &PatientIdentity) -> Result<Slot, ReserveError> {
        let id = key.id();
        // The write guard spans read, check and write
        let mut slots = self.slots.write().await;
        let now = Utc::now();

        let mut slot = match slots.get(&id) {
            Some(existing) if !existing.is_open() => return Err(ReserveError::Taken),
            Some(existing) => existing.clone(),
            None => Slot::available(key, SlotOrigin::Manual),
        };
        slot.mark_booked(patient, now);
        slots.insert(id, slot.clone());
        Ok(slot)
    }

    async fn release(&self, id: &SlotId) -> Result<Option<Slot>, RepositoryError> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(id) {
            Some(slot) if slot.is_booked() => {
                let previous = slot.clone();
                slot.mark_available(Utc::now());
                Ok(Some(previous))
            }
            _ => Ok(None),
        }
    }
}

// ==============================================================================
// SUPABASE (POSTGREST) STORE
// ==============================================================================

/// Slots table behind PostgREST. Reservation relies on row-level atomicity of a
/// filtered `PATCH ... status=eq.available` and on `INSERT ... ON CONFLICT DO NOTHING`.
pub struct SupabaseSlotRepository {
    supabase: Arc<SupabaseClient>,
    table_path: String,
}

impl SupabaseSlotRepository {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self {
            supabase,
            table_path: "/rest/v1/slots".to_string(),
        }
    }

    fn id_filter(id: &SlotId) -> String {
        format!("id=eq.{}", urlencoding::encode(id.as_str()))
    }

    fn parse_rows(rows: Vec<Value>) -> Result<Vec<Slot>, RepositoryError> {
        rows.into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Slot>, _>>()
            .map_err(|e| RepositoryError::Malformed(e.to_string()))
    }

    fn booking_patch(patient: &PatientIdentity) -> Value {
        json!({
            "status": "booked",
            "patient_name": patient.name,
            "patient_rut": patient.rut,
            "patient_phone": patient.phone,
            "updated_at": Utc::now().to_rfc3339(),
        })
    }

    async fn try_book_existing(
        &self,
        id: &SlotId,
        patient: &PatientIdentity,
    ) -> Result<Option<Slot>, RepositoryError> {
        let path = format!(
            "{}?{}&status=eq.available&active=eq.true",
            self.table_path,
            Self::id_filter(id)
        );
        let rows: Vec<Value> = self.supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(Self::booking_patch(patient)),
                Some(supabase::return_representation()),
            )
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(Self::parse_rows(rows)?.into_iter().next())
    }

    async fn try_insert_booked(
        &self,
        key: &SlotKey,
        patient: &PatientIdentity,
    ) -> Result<Option<Slot>, RepositoryError> {
        let mut slot = Slot::available(key, SlotOrigin::Manual);
        slot.mark_booked(patient, Utc::now());
        let body = serde_json::to_value(&slot)
            .map_err(|e| RepositoryError::Malformed(e.to_string()))?;

        let path = format!("{}?on_conflict=id", self.table_path);
        let rows: Vec<Value> = self.supabase
            .request_with_headers(
                Method::POST,
                &path,
                None,
                Some(body),
                Some(supabase::ignore_duplicates()),
            )
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(Self::parse_rows(rows)?.into_iter().next())
    }
}

#[async_trait]
impl SlotRepository for SupabaseSlotRepository {
    async fn get(&self, id: &SlotId) -> Result<Option<Slot>, RepositoryError> {
        let path = format!("{}?{}&limit=1", self.table_path, Self::id_filter(id));
        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(Self::parse_rows(rows)?.into_iter().next())
    }

    async fn insert_if_absent(&self, slot: &Slot) -> Result<bool, RepositoryError> {
        let mut body = serde_json::to_value(slot)
            .map_err(|e| RepositoryError::Malformed(e.to_string()))?;
        if let Some(fields) = body.as_object_mut() {
            fields.remove("created_at");
            fields.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }

        let path = format!("{}?on_conflict=id", self.table_path);
        let rows: Vec<Value> = self.supabase
            .request_with_headers(Method::POST, &path, None, Some(body), Some(supabase::ignore_duplicates()))
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(!rows.is_empty())
    }

    async fn set_active(&self, id: &SlotId, active: bool) -> Result<bool, RepositoryError> {
        let path = format!("{}?{}&status=eq.available", self.table_path, Self::id_filter(id));
        let rows: Vec<Value> = self.supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(json!({ "active": active, "updated_at": Utc::now().to_rfc3339() })),
                Some(supabase::return_representation()),
            )
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(!rows.is_empty())
    }

    async fn list_range(
        &self,
        center_id: &str,
        professional_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, RepositoryError> {
        let path = format!(
            "{}?center_id=eq.{}&professional_id=eq.{}&date=gte.{}&date=lte.{}&order=date.asc,time.asc",
            self.table_path,
            urlencoding::encode(center_id),
            urlencoding::encode(professional_id),
            from.format(SLOT_DATE_FORMAT),
            to.format(SLOT_DATE_FORMAT),
        );
        let rows: Vec<Value> = self.supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Self::parse_rows(rows)
    }

    async fn reserve(&self, key: &SlotKey, patient: &PatientIdentity) -> Result<Slot, ReserveError> {
        let id = key.id();

        // A concurrent insert can land between our PATCH and INSERT; one more
        // PATCH round settles it against the now-existing row.
        for attempt in 1..=2 {
            if let Some(slot) = self.try_book_existing(&id, patient).await? {
                debug!("Slot {} booked on attempt {}", id, attempt);
                return Ok(slot);
            }

            if self.get(&id).await?.is_some() {
                return Err(ReserveError::Taken);
            }

            if let Some(slot) = self.try_insert_booked(key, patient).await? {
                debug!("Slot {} created and booked on attempt {}", id, attempt);
                return Ok(slot);
            }
            warn!("Slot {} appeared concurrently during reservation", id);
        }

        Err(ReserveError::Taken)
    }

    async fn release(&self, id: &SlotId) -> Result<Option<Slot>, RepositoryError> {
        let previous = match self.get(id).await? {
            Some(slot) if slot.is_booked() => slot,
            _ => return Ok(None),
        };

        let path = format!("{}?{}&status=eq.booked", self.table_path, Self::id_filter(id));
        let rows: Vec<Value> = self.supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                None,
                Some(json!({
                    "status": "available",
                    "patient_name": null,
                    "patient_rut": null,
                    "patient_phone": null,
                    "updated_at": Utc::now().to_rfc3339(),
                })),
                Some(supabase::return_representation()),
            )
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(if rows.is_empty() { None } else { Some(previous) })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::NaiveTime;

    fn key(time: &str) -> SlotKey {
        SlotKey {
            center_id: "c1".into(),
            professional_id: "p1".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            time: NaiveTime::parse_from_str(time, "%H:%M").unwrap(),
        }
    }

    fn patient() -> PatientIdentity {
        PatientIdentity {
            name: "Ana Rojas".into(),
            rut: "12345678-5".into(),
            phone: "56911112222".into(),
        }
    }

    #[tokio::test]
    async fn insert_if_absent_never_overwrites() {
        let repository = InMemorySlotRepository::new();
        let slot = Slot::available(&key("08:00"), SlotOrigin::Generated);
        assert!(repository.insert_if_absent(&slot).await.unwrap());
        let created = repository.get(&slot.id).await.unwrap().unwrap().created_at;
        assert!(created.is_some());

        let booked = repository.reserve(&key("08:00"), &patient()).await.unwrap();
        assert!(!repository.insert_if_absent(&slot).await.unwrap());

        let stored = repository.get(&slot.id).await.unwrap().unwrap();
        assert!(stored.is_booked());
        assert_eq!(stored.patient_name, booked.patient_name);
        assert_eq!(stored.created_at, created);
        assert_eq!(repository.len().await, 1);
    }

    #[tokio::test]
    async fn set_active_leaves_booked_slots_alone() {
        let open = Slot::available(&key("08:30"), SlotOrigin::Generated);
        let repository = InMemorySlotRepository::with_slots([open.clone()]).await;
        let booked = repository.reserve(&key("09:30"), &patient()).await.unwrap();

        assert!(repository.set_active(&open.id, false).await.unwrap());
        assert!(!repository.get(&open.id).await.unwrap().unwrap().active);
        assert!(repository.set_active(&open.id, true).await.unwrap());
        assert!(repository.get(&open.id).await.unwrap().unwrap().is_open());

        assert!(!repository.set_active(&booked.id, false).await.unwrap());
        assert!(repository.get(&booked.id).await.unwrap().unwrap().active);
        assert!(!repository.set_active(&SlotId::from("slot_missing"), false).await.unwrap());
    }

    #[tokio::test]
    async fn reserve_creates_missing_slot_and_rejects_second_booking() {
        let repository = InMemorySlotRepository::new();
        let booked = repository.reserve(&key("10:00"), &patient()).await.unwrap();
        assert!(booked.is_booked());
        assert!(booked.created_at.is_some());
        assert_eq!(booked.patient_name.as_deref(), Some("Ana Rojas"));

        assert_matches!(
            repository.reserve(&key("10:00"), &patient()).await,
            Err(ReserveError::Taken)
        );
    }

    #[tokio::test]
    async fn closed_slot_cannot_be_reserved() {
        let mut slot = Slot::available(&key("11:00"), SlotOrigin::Generated);
        slot.active = false;
        let repository = InMemorySlotRepository::with_slots([slot]).await;

        assert_matches!(
            repository.reserve(&key("11:00"), &patient()).await,
            Err(ReserveError::Taken)
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let repository = InMemorySlotRepository::new();
        let booked = repository.reserve(&key("12:00"), &patient()).await.unwrap();

        let released = repository.release(&booked.id).await.unwrap();
        assert_eq!(released.unwrap().patient_phone.as_deref(), Some("56911112222"));

        let slot = repository.get(&booked.id).await.unwrap().unwrap();
        assert!(slot.is_open());
        assert!(slot.patient_name.is_none());

        assert_eq!(repository.release(&booked.id).await.unwrap(), None);
        assert_eq!(repository.release(&SlotId::from("slot_missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_range_filters_and_orders() {
        let mut other_day = key("08:00");
        other_day.date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let mut other_professional = key("08:00");
        other_professional.professional_id = "p2".into();

        let repository = InMemorySlotRepository::with_slots([
            Slot::available(&key("09:00"), SlotOrigin::Generated),
            Slot::available(&key("08:00"), SlotOrigin::Generated),
            Slot::available(&other_day, SlotOrigin::Generated),
            Slot::available(&other_professional, SlotOrigin::Generated),
        ])
        .await;

        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let listed = repository.list_range("c1", "p1", day, day).await.unwrap();
        let labels: Vec<_> = listed.iter().map(|s| s.time_label()).collect();
        assert_eq!(labels, vec!["08:00", "09:00"]);
    }
}
