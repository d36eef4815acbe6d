// libs/agenda-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const SLOT_TIME_FORMAT: &str = "%H:%M";
pub const SLOT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Durations staff can pick for an agenda.
pub const ALLOWED_SLOT_DURATIONS: [u32; 6] = [15, 20, 25, 30, 45, 60];

// ==============================================================================
// SLOT IDENTITY
// ==============================================================================

/// Deterministic slot identifier: `slot_{centerId}_{professionalId}_{date}_{time}`.
///
/// Two slots with the same `(center, professional, date, time)` always share an
/// id, which is what makes upserts idempotent across repeated generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(center_id: &str, professional_id: &str, date: NaiveDate, time: NaiveTime) -> Self {
        Self(format!(
            "slot_{}_{}_{}_{}",
            center_id,
            professional_id,
            date.format(SLOT_DATE_FORMAT),
            time.format(SLOT_TIME_FORMAT)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the identifying tuple from the id.
    ///
    /// Date and time are read from the right; the center id is everything up to
    /// the first underscore, so center ids must not contain `_`.
    pub fn parse(&self) -> Option<SlotKey> {
        let rest = self.0.strip_prefix("slot_")?;
        let mut tail = rest.rsplitn(3, '_');
        let time = NaiveTime::parse_from_str(tail.next()?, SLOT_TIME_FORMAT).ok()?;
        let date = NaiveDate::parse_from_str(tail.next()?, SLOT_DATE_FORMAT).ok()?;
        let (center_id, professional_id) = tail.next()?.split_once('_')?;
        if center_id.is_empty() || professional_id.is_empty() {
            return None;
        }

        Some(SlotKey {
            center_id: center_id.to_string(),
            professional_id: professional_id.to_string(),
            date,
            time,
        })
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SlotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub center_id: String,
    pub professional_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl SlotKey {
    pub fn id(&self) -> SlotId {
        SlotId::new(&self.center_id, &self.professional_id, self.date, self.time)
    }
}

// ==============================================================================
// SLOT
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Booked,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Available => write!(f, "available"),
            SlotStatus::Booked => write!(f, "booked"),
        }
    }
}

/// Generated slots come from an agenda grid; manual ones were opened one by one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotOrigin {
    #[default]
    Generated,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PatientIdentity {
    pub name: String,
    pub rut: String,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub id: SlotId,
    pub center_id: String,
    pub professional_id: String,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub status: SlotStatus,
    pub active: bool,
    #[serde(default)]
    pub origin: SlotOrigin,
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub patient_rut: Option<String>,
    #[serde(default)]
    pub patient_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Slot {
    /// An open, unbooked slot with blank patient fields.
    pub fn available(key: &SlotKey, origin: SlotOrigin) -> Self {
        Self {
            id: key.id(),
            center_id: key.center_id.clone(),
            professional_id: key.professional_id.clone(),
            date: key.date,
            time: key.time,
            status: SlotStatus::Available,
            active: true,
            origin,
            patient_name: None,
            patient_rut: None,
            patient_phone: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey {
            center_id: self.center_id.clone(),
            professional_id: self.professional_id.clone(),
            date: self.date,
            time: self.time,
        }
    }

    pub fn is_booked(&self) -> bool {
        self.status == SlotStatus::Booked
    }

    /// Active and not booked: can be offered to a patient.
    pub fn is_open(&self) -> bool {
        self.active && self.status == SlotStatus::Available
    }

    pub fn time_label(&self) -> String {
        self.time.format(SLOT_TIME_FORMAT).to_string()
    }

    pub fn patient(&self) -> Option<PatientIdentity> {
        if !self.is_booked() {
            return None;
        }
        Some(PatientIdentity {
            name: self.patient_name.clone().unwrap_or_default(),
            rut: self.patient_rut.clone().unwrap_or_default(),
            phone: self.patient_phone.clone().unwrap_or_default(),
        })
    }

    pub(crate) fn mark_booked(&mut self, patient: &PatientIdentity, now: DateTime<Utc>) {
        self.status = SlotStatus::Booked;
        self.patient_name = Some(patient.name.clone());
        self.patient_rut = Some(patient.rut.clone());
        self.patient_phone = Some(patient.phone.clone());
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }

    pub(crate) fn mark_available(&mut self, now: DateTime<Utc>) {
        self.status = SlotStatus::Available;
        self.patient_name = None;
        self.patient_rut = None;
        self.patient_phone = None;
        self.updated_at = Some(now);
    }
}

/// Serde adapter keeping slot times as `HH:MM`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SLOT_TIME_FORMAT;

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(SLOT_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Accepts `HH:MM` and the `HH:MM:SS` form Postgres `time` columns return.
    pub fn parse(raw: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(raw.trim(), SLOT_TIME_FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
    }
}

// ==============================================================================
// AGENDA CONFIGURATION
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgendaConfig {
    pub slot_duration: u32,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl AgendaConfig {
    pub fn new(slot_duration: u32, start_time: &str, end_time: &str) -> Result<Self, AgendaError> {
        let start_time = hhmm::parse(start_time)
            .map_err(|_| AgendaError::InvalidTime(start_time.to_string()))?;
        let end_time = hhmm::parse(end_time)
            .map_err(|_| AgendaError::InvalidTime(end_time.to_string()))?;

        let config = Self { slot_duration, start_time, end_time };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgendaError> {
        if !ALLOWED_SLOT_DURATIONS.contains(&self.slot_duration) {
            return Err(AgendaError::InvalidDuration(self.slot_duration));
        }
        if self.start_time >= self.end_time {
            return Err(AgendaError::InvalidRange {
                start: self.start_time.format(SLOT_TIME_FORMAT).to_string(),
                end: self.end_time.format(SLOT_TIME_FORMAT).to_string(),
            });
        }
        Ok(())
    }
}

/// A bookable professional of a center.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Professional {
    pub id: String,
    pub center_id: String,
    pub name: String,
    #[serde(default)]
    pub specialty: Option<String>,
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleSlotRequest {
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkGenerateRequest {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    #[serde(default)]
    pub include_saturday: bool,
    #[serde(default)]
    pub include_sunday: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRangeRequest {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSlotRequest {
    pub patient_name: String,
    pub patient_rut: String,
    pub patient_phone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelSlotRequest {
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    /// Grid time with no persisted slot.
    Empty,
    Open,
    Closed,
    Booked,
    PendingOpen,
    PendingClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendaCell {
    pub time: String,
    pub slot_id: SlotId,
    pub state: CellState,
    pub patient_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendaDayView {
    pub professional_id: String,
    pub date: NaiveDate,
    pub cells: Vec<AgendaCell>,
    pub has_pending_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemFailure {
    pub slot_id: SlotId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitSummary {
    pub opened: usize,
    pub closed: usize,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplySummary {
    pub upserted: usize,
    pub deactivated: usize,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSummary {
    pub created: usize,
    pub skipped_existing: usize,
    pub failures: Vec<ItemFailure>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgendaError {
    #[error("Slot duration must be one of 15, 20, 25, 30, 45 or 60 minutes (got {0})")]
    InvalidDuration(u32),

    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("Start time {start} must be before end time {end}")]
    InvalidRange { start: String, end: String },

    #[error("Date range {from} to {to} is inverted")]
    InvalidDateRange { from: NaiveDate, to: NaiveDate },

    #[error("Slot {0} is booked; cancel the booking instead")]
    SlotBooked(SlotId),

    #[error("No agenda configured for professional {0}")]
    AgendaNotConfigured(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Failure modes of a booking attempt. `SLOT_TAKEN` is the expected conflict.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    #[error("SLOT_TAKEN")]
    SlotTaken,

    #[error("Invalid patient data: {0}")]
    InvalidPatient(String),

    #[error("Unknown slot: {0}")]
    InvalidSlot(SlotId),

    #[error("TECHNICAL_ERROR: {0}")]
    Technical(String),
}

impl BookingError {
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::SlotTaken => "SLOT_TAKEN",
            BookingError::InvalidPatient(_) => "INVALID_PATIENT",
            BookingError::InvalidSlot(_) => "INVALID_SLOT",
            BookingError::Technical(_) => "TECHNICAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, SLOT_DATE_FORMAT).unwrap()
    }

    fn time(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, SLOT_TIME_FORMAT).unwrap()
    }

    #[test]
    fn slot_id_is_deterministic() {
        let a = SlotId::new("c1", "doc-7", date("2024-03-04"), time("08:20"));
        let b = SlotId::new("c1", "doc-7", date("2024-03-04"), time("08:20"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "slot_c1_doc-7_2024-03-04_08:20");
    }

    #[test]
    fn slot_id_parses_back_even_with_underscored_professional() {
        let id = SlotId::new("c1", "doc_7_b", date("2024-03-04"), time("17:45"));
        let key = id.parse().unwrap();
        assert_eq!(key.center_id, "c1");
        assert_eq!(key.professional_id, "doc_7_b");
        assert_eq!(key.date, date("2024-03-04"));
        assert_eq!(key.time, time("17:45"));
        assert_eq!(key.id(), id);
    }

    #[test]
    fn malformed_slot_ids_do_not_parse() {
        assert!(SlotId::from("appointment_42").parse().is_none());
        assert!(SlotId::from("slot_c1_2024-03-04_08:00").parse().is_none());
        assert!(SlotId::from("slot_c1_doc_2024-13-04_08:00").parse().is_none());
    }

    #[test]
    fn slot_serializes_times_as_hh_mm() {
        let key = SlotKey {
            center_id: "c1".into(),
            professional_id: "p1".into(),
            date: date("2024-03-04"),
            time: time("09:05"),
        };
        let json = serde_json::to_value(Slot::available(&key, SlotOrigin::Generated)).unwrap();
        assert_eq!(json["time"], "09:05");
        assert_eq!(json["date"], "2024-03-04");
        assert_eq!(json["status"], "available");
        assert!(json.get("created_at").is_none());

        let mut row = json.clone();
        row["time"] = "09:05:00".into();
        let parsed: Slot = serde_json::from_value(row).unwrap();
        assert_eq!(parsed.time, time("09:05"));
    }

    #[test]
    fn agenda_config_validation() {
        assert!(AgendaConfig::new(20, "08:00", "09:00").is_ok());
        assert_eq!(
            AgendaConfig::new(17, "08:00", "09:00"),
            Err(AgendaError::InvalidDuration(17))
        );
        assert!(matches!(
            AgendaConfig::new(30, "10:00", "09:00"),
            Err(AgendaError::InvalidRange { .. })
        ));
        assert_eq!(
            AgendaConfig::new(30, "8am", "09:00"),
            Err(AgendaError::InvalidTime("8am".to_string()))
        );
    }
}
