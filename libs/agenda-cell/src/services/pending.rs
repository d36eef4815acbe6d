// libs/agenda-cell/src/services/pending.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{AgendaError, Slot, SlotId, SlotKey, SlotOrigin};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingScope {
    pub professional_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    StagedOpen,
    UnstagedOpen,
    StagedClose,
    UnstagedClose,
}

/// Staged open/close edits for one `(professional, date)` selection.
///
/// `adds` holds times with no open persisted slot; `deletes` holds ids of
/// persisted open slots. A booked slot is never staged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingEdits {
    scope: Option<PendingScope>,
    adds: BTreeSet<NaiveTime>,
    deletes: BTreeSet<SlotId>,
}

/// The writes a commit has to perform.
#[derive(Debug, Clone, Default)]
pub struct PendingOperations {
    pub opens: Vec<Slot>,
    pub closes: Vec<SlotId>,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points the store at a selection. Switching date or professional drops
    /// everything staged for the previous one. Returns true when it reset.
    pub fn select(&mut self, professional_id: &str, date: NaiveDate) -> bool {
        let same = self
            .scope
            .as_ref()
            .is_some_and(|s| s.professional_id == professional_id && s.date == date);
        if same {
            return false;
        }

        let had_changes = self.has_pending_changes();
        self.reset();
        self.scope = Some(PendingScope {
            professional_id: professional_id.to_string(),
            date,
        });
        had_changes
    }

    pub fn toggle(
        &mut self,
        time: NaiveTime,
        existing: Option<&Slot>,
    ) -> Result<ToggleOutcome, AgendaError> {
        match existing {
            Some(slot) if slot.is_booked() => Err(AgendaError::SlotBooked(slot.id.clone())),
            Some(slot) if slot.active => {
                if self.deletes.remove(&slot.id) {
                    Ok(ToggleOutcome::UnstagedClose)
                } else {
                    self.deletes.insert(slot.id.clone());
                    Ok(ToggleOutcome::StagedClose)
                }
            }
            // Absent or closed: staging reopens it under the same id
            _ => {
                if self.adds.remove(&time) {
                    Ok(ToggleOutcome::UnstagedOpen)
                } else {
                    self.adds.insert(time);
                    Ok(ToggleOutcome::StagedOpen)
                }
            }
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.adds.is_empty() || !self.deletes.is_empty()
    }

    pub fn reset(&mut self) {
        self.adds.clear();
        self.deletes.clear();
    }

    pub fn is_staged_open(&self, time: &NaiveTime) -> bool {
        self.adds.contains(time)
    }

    pub fn is_staged_close(&self, id: &SlotId) -> bool {
        self.deletes.contains(id)
    }

    pub fn adds(&self) -> impl Iterator<Item = &NaiveTime> {
        self.adds.iter()
    }

    /// Translates staged edits into writes. Opened slots are manual.
    pub fn to_operations(&self, center_id: &str) -> PendingOperations {
        let Some(scope) = &self.scope else {
            return PendingOperations::default();
        };

        let opens = self
            .adds
            .iter()
            .map(|time| {
                let key = SlotKey {
                    center_id: center_id.to_string(),
                    professional_id: scope.professional_id.clone(),
                    date: scope.date,
                    time: *time,
                };
                Slot::available(&key, SlotOrigin::Manual)
            })
            .collect();

        PendingOperations {
            opens,
            closes: self.deletes.iter().cloned().collect(),
        }
    }
}

// ==============================================================================
// PER-USER REGISTRY
// ==============================================================================

/// One staging store per staff user.
#[derive(Debug, Clone, Default)]
pub struct PendingEditRegistry {
    edits: Arc<RwLock<HashMap<String, PendingEdits>>>,
}

impl PendingEditRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's edits for the selection, resetting them when the selection changed.
    pub async fn snapshot(&self, user_id: &str, professional_id: &str, date: NaiveDate) -> PendingEdits {
        let mut edits = self.edits.write().await;
        let entry = edits.entry(user_id.to_string()).or_default();
        if entry.select(professional_id, date) {
            debug!("Discarded pending edits of {} after selection change", user_id);
        }
        entry.clone()
    }

    pub async fn toggle(
        &self,
        user_id: &str,
        professional_id: &str,
        date: NaiveDate,
        time: NaiveTime,
        existing: Option<&Slot>,
    ) -> Result<(ToggleOutcome, PendingEdits), AgendaError> {
        let mut edits = self.edits.write().await;
        let entry = edits.entry(user_id.to_string()).or_default();
        entry.select(professional_id, date);
        let outcome = entry.toggle(time, existing)?;
        Ok((outcome, entry.clone()))
    }

    /// Removes and returns the staged edits when they belong to the selection.
    pub async fn take(&self, user_id: &str, professional_id: &str, date: NaiveDate) -> PendingEdits {
        let mut edits = self.edits.write().await;
        let entry = edits.entry(user_id.to_string()).or_default();
        entry.select(professional_id, date);
        let taken = entry.clone();
        entry.reset();
        taken
    }
}
