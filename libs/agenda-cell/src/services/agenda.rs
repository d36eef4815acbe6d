// libs/agenda-cell/src/services/agenda.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime};
use futures::future::join_all;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::models::{
    hhmm, AgendaCell, AgendaConfig, AgendaDayView, AgendaError, ApplySummary, BulkGenerateRequest,
    BulkSummary, CellState, CommitSummary, ItemFailure, Slot, SlotKey, SyncRangeRequest,
    SLOT_TIME_FORMAT,
};
use crate::services::audit::{AuditEvent, AuditSink};
use crate::services::bulk::{generate_bulk, included_days};
use crate::services::directory::Directory;
use crate::services::grid::{generate_day, grid_times};
use crate::services::pending::{PendingEditRegistry, PendingEdits, ToggleOutcome};
use crate::services::reconcile::{apply, reconcile};
use crate::services::repository::SlotRepository;

const WRITE_CONCURRENCY: usize = 8;

/// Staff-side agenda operations for one center.
pub struct AgendaService {
    center_id: String,
    repo: Arc<dyn SlotRepository>,
    directory: Arc<dyn Directory>,
    audit: Arc<dyn AuditSink>,
    pending: PendingEditRegistry,
}

impl AgendaService {
    pub fn new(
        center_id: &str,
        repo: Arc<dyn SlotRepository>,
        directory: Arc<dyn Directory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            center_id: center_id.to_string(),
            repo,
            directory,
            audit,
            pending: PendingEditRegistry::new(),
        }
    }

    pub fn center_id(&self) -> &str {
        &self.center_id
    }

    pub fn directory(&self) -> Arc<dyn Directory> {
        self.directory.clone()
    }

    fn key(&self, professional_id: &str, date: NaiveDate, time: NaiveTime) -> SlotKey {
        SlotKey {
            center_id: self.center_id.clone(),
            professional_id: professional_id.to_string(),
            date,
            time,
        }
    }

    pub async fn agenda_config(&self, professional_id: &str) -> Result<AgendaConfig, AgendaError> {
        self.directory
            .agenda_config(professional_id)
            .await
            .map_err(|e| AgendaError::Storage(e.to_string()))?
            .ok_or_else(|| AgendaError::AgendaNotConfigured(professional_id.to_string()))
    }

    async fn slots_between(
        &self,
        professional_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, AgendaError> {
        self.repo
            .list_range(&self.center_id, professional_id, from, to)
            .await
            .map_err(|e| AgendaError::Storage(e.to_string()))
    }

    // ==============================================================================
    // DAY VIEW & PENDING EDITS
    // ==============================================================================

    /// Grid times merged with persisted slots and the user's staged edits.
    #[instrument(skip(self))]
    pub async fn day_view(
        &self,
        user_id: &str,
        professional_id: &str,
        date: NaiveDate,
    ) -> Result<AgendaDayView, AgendaError> {
        let config = self.agenda_config(professional_id).await?;
        let persisted = self.slots_between(professional_id, date, date).await?;
        let edits = self.pending.snapshot(user_id, professional_id, date).await;

        self.build_view(professional_id, date, &config, &persisted, &edits)
    }

    fn build_view(
        &self,
        professional_id: &str,
        date: NaiveDate,
        config: &AgendaConfig,
        persisted: &[Slot],
        edits: &PendingEdits,
    ) -> Result<AgendaDayView, AgendaError> {
        let by_time: HashMap<NaiveTime, &Slot> = persisted.iter().map(|s| (s.time, s)).collect();

        let mut times: BTreeSet<NaiveTime> = grid_times(config)?.into_iter().collect();
        times.extend(by_time.keys().copied());
        times.extend(edits.adds().copied());

        let cells = times
            .into_iter()
            .map(|time| {
                let slot = by_time.get(&time).copied();
                let state = match slot {
                    Some(s) if s.is_booked() => CellState::Booked,
                    Some(s) if s.active && edits.is_staged_close(&s.id) => CellState::PendingClose,
                    Some(s) if s.active => CellState::Open,
                    _ if edits.is_staged_open(&time) => CellState::PendingOpen,
                    Some(_) => CellState::Closed,
                    None => CellState::Empty,
                };
                AgendaCell {
                    time: time.format(SLOT_TIME_FORMAT).to_string(),
                    slot_id: self.key(professional_id, date, time).id(),
                    state,
                    patient_name: slot.and_then(|s| s.patient_name.clone()),
                }
            })
            .collect();

        Ok(AgendaDayView {
            professional_id: professional_id.to_string(),
            date,
            cells,
            has_pending_changes: edits.has_pending_changes(),
        })
    }

    #[instrument(skip(self))]
    pub async fn toggle(
        &self,
        user_id: &str,
        professional_id: &str,
        date: NaiveDate,
        time: &str,
    ) -> Result<(ToggleOutcome, AgendaDayView), AgendaError> {
        let time = hhmm::parse(time).map_err(|_| AgendaError::InvalidTime(time.to_string()))?;
        let config = self.agenda_config(professional_id).await?;
        let existing = self
            .repo
            .get(&self.key(professional_id, date, time).id())
            .await
            .map_err(|e| AgendaError::Storage(e.to_string()))?;

        let (outcome, edits) = self
            .pending
            .toggle(user_id, professional_id, date, time, existing.as_ref())
            .await?;

        let persisted = self.slots_between(professional_id, date, date).await?;
        let view = self.build_view(professional_id, date, &config, &persisted, &edits)?;
        Ok((outcome, view))
    }

    pub async fn discard_pending(&self, user_id: &str, professional_id: &str, date: NaiveDate) {
        self.pending.take(user_id, professional_id, date).await;
    }

    /// Writes the staged edits, one item at a time. A failed item is reported
    /// and does not stop the others.
    #[instrument(skip(self))]
    pub async fn commit_pending(
        &self,
        user_id: &str,
        professional_id: &str,
        date: NaiveDate,
    ) -> Result<CommitSummary, AgendaError> {
        let edits = self.pending.take(user_id, professional_id, date).await;
        let operations = edits.to_operations(&self.center_id);
        let mut summary = CommitSummary::default();

        for slot in &operations.opens {
            // Reopening only ever touches a slot that is still unbooked
            let written = match self.repo.insert_if_absent(slot).await {
                Ok(true) => Ok(true),
                Ok(false) => self.repo.set_active(&slot.id, true).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(true) => summary.opened += 1,
                Ok(false) => summary.failures.push(ItemFailure {
                    slot_id: slot.id.clone(),
                    reason: AgendaError::SlotBooked(slot.id.clone()).to_string(),
                }),
                Err(e) => {
                    warn!("Opening {} failed: {}", slot.id, e);
                    summary.failures.push(ItemFailure { slot_id: slot.id.clone(), reason: e.to_string() });
                }
            }
        }

        for id in &operations.closes {
            match self.repo.set_active(id, false).await {
                Ok(true) => summary.closed += 1,
                // Booked after it was staged: left alone
                Ok(false) => summary.failures.push(ItemFailure {
                    slot_id: id.clone(),
                    reason: AgendaError::SlotBooked(id.clone()).to_string(),
                }),
                Err(e) => {
                    warn!("Closing {} failed: {}", id, e);
                    summary.failures.push(ItemFailure { slot_id: id.clone(), reason: e.to_string() });
                }
            }
        }

        if summary.opened + summary.closed > 0 {
            self.audit
                .log_activity(AuditEvent {
                    action: "agenda_committed".to_string(),
                    entity_type: "agenda".to_string(),
                    entity_id: format!("{}_{}", professional_id, date),
                    details: json!({
                        "user_id": user_id,
                        "opened": summary.opened,
                        "closed": summary.closed,
                        "failed": summary.failures.len(),
                    }),
                })
                .await;
        }

        info!(opened = summary.opened, closed = summary.closed, "Pending edits committed");
        Ok(summary)
    }

    // ==============================================================================
    // RANGE OPERATIONS
    // ==============================================================================

    #[instrument(skip(self, request))]
    pub async fn bulk_generate(
        &self,
        professional_id: &str,
        request: &BulkGenerateRequest,
    ) -> Result<BulkSummary, AgendaError> {
        let config = self.agenda_config(professional_id).await?;
        let existing = self
            .slots_between(professional_id, request.date_from, request.date_to)
            .await?;
        let fresh = generate_bulk(professional_id, &self.center_id, request, &config, &existing)?;

        let grid_size = included_days(request)?.len() * grid_times(&config)?.len();
        let mut summary = BulkSummary {
            skipped_existing: grid_size.saturating_sub(fresh.len()),
            ..Default::default()
        };

        for batch in fresh.chunks(WRITE_CONCURRENCY) {
            let results = join_all(batch.iter().map(|slot| self.repo.insert_if_absent(slot))).await;
            for (slot, result) in batch.iter().zip(results) {
                match result {
                    Ok(true) => summary.created += 1,
                    // Created concurrently since the range was read
                    Ok(false) => summary.skipped_existing += 1,
                    Err(e) => {
                        warn!("Bulk creation of {} failed: {}", slot.id, e);
                        summary.failures.push(ItemFailure { slot_id: slot.id.clone(), reason: e.to_string() });
                    }
                }
            }
        }

        self.audit
            .log_activity(AuditEvent {
                action: "agenda_bulk_generated".to_string(),
                entity_type: "agenda".to_string(),
                entity_id: professional_id.to_string(),
                details: json!({
                    "date_from": request.date_from,
                    "date_to": request.date_to,
                    "created": summary.created,
                    "skipped_existing": summary.skipped_existing,
                }),
            })
            .await;

        Ok(summary)
    }

    /// Brings a range in line with the current agenda configuration.
    ///
    /// Existing slots on the grid stay as they are, missing grid times are
    /// created, and generated slots that fell off the grid are closed. Booked
    /// slots are never closed here.
    #[instrument(skip(self, request))]
    pub async fn sync_range(
        &self,
        professional_id: &str,
        request: &SyncRangeRequest,
    ) -> Result<ApplySummary, AgendaError> {
        if request.date_from > request.date_to {
            return Err(AgendaError::InvalidDateRange { from: request.date_from, to: request.date_to });
        }

        let config = self.agenda_config(professional_id).await?;
        let current = self
            .slots_between(professional_id, request.date_from, request.date_to)
            .await?;
        let by_id: HashMap<_, _> = current.iter().map(|s| (s.id.clone(), s)).collect();

        let mut target = Vec::new();
        let mut day = request.date_from;
        while day <= request.date_to {
            for generated in generate_day(day, professional_id, &self.center_id, &config)? {
                let slot = by_id.get(&generated.id).map(|s| (*s).clone()).unwrap_or(generated);
                target.push(slot);
            }
            day += Duration::days(1);
        }

        let mut plan = reconcile(&current, &target);
        plan.spare_booked(&current);

        if plan.is_empty() {
            return Ok(ApplySummary::default());
        }

        let summary = apply(self.repo.as_ref(), &plan).await;
        self.audit
            .log_activity(AuditEvent {
                action: "agenda_synced".to_string(),
                entity_type: "agenda".to_string(),
                entity_id: professional_id.to_string(),
                details: json!({
                    "date_from": request.date_from,
                    "date_to": request.date_to,
                    "upserted": summary.upserted,
                    "deactivated": summary.deactivated,
                }),
            })
            .await;

        Ok(summary)
    }

    // ==============================================================================
    // PATIENT-FACING QUERIES
    // ==============================================================================

    /// Live open slots of a day, chronological.
    pub async fn open_slots(&self, professional_id: &str, date: NaiveDate) -> Result<Vec<Slot>, AgendaError> {
        let slots = self.slots_between(professional_id, date, date).await?;
        Ok(slots.into_iter().filter(Slot::is_open).collect())
    }

    /// Days in `[from, from + days)` with at least one open slot.
    pub async fn open_dates(
        &self,
        professional_id: &str,
        from: NaiveDate,
        days: u32,
    ) -> Result<Vec<NaiveDate>, AgendaError> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let to = from + Duration::days(i64::from(days) - 1);
        let slots = self.slots_between(professional_id, from, to).await?;

        let dates: BTreeSet<NaiveDate> = slots.iter().filter(|s| s.is_open()).map(|s| s.date).collect();
        Ok(dates.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Professional, SlotId, SlotStatus};
    use crate::services::audit::TracingAuditSink;
    use crate::services::directory::StaticDirectory;
    use crate::models::PatientIdentity;
    use crate::services::repository::testing::{BookAfterRead, FailingWrites};
    use crate::services::repository::InMemorySlotRepository;
    use assert_matches::assert_matches;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    fn service_with(repo: Arc<InMemorySlotRepository>) -> AgendaService {
        service_on(repo)
    }

    fn service_on(repo: Arc<dyn SlotRepository>) -> AgendaService {
        let directory = StaticDirectory::new()
            .with_professional(
                Professional {
                    id: "p1".into(),
                    center_id: "c1".into(),
                    name: "Dra. Soto".into(),
                    specialty: None,
                },
                Some(AgendaConfig::new(30, "09:00", "11:00").unwrap()),
            )
            .with_professional(
                Professional {
                    id: "p2".into(),
                    center_id: "c1".into(),
                    name: "Dr. Vera".into(),
                    specialty: None,
                },
                None,
            );
        AgendaService::new("c1", repo, Arc::new(directory), Arc::new(TracingAuditSink))
    }

    fn slot_key(time: &str) -> SlotKey {
        SlotKey {
            center_id: "c1".into(),
            professional_id: "p1".into(),
            date: day(),
            time: hhmm::parse(time).unwrap(),
        }
    }

    fn patient() -> PatientIdentity {
        PatientIdentity {
            name: "Ana Rojas".into(),
            rut: "12345678-5".into(),
            phone: "56911112222".into(),
        }
    }

    fn week() -> BulkGenerateRequest {
        BulkGenerateRequest {
            date_from: day(),
            date_to: day() + Duration::days(6),
            include_saturday: false,
            include_sunday: false,
        }
    }

    fn states(view: &AgendaDayView) -> Vec<(String, CellState)> {
        view.cells.iter().map(|c| (c.time.clone(), c.state)).collect()
    }

    #[tokio::test]
    async fn toggle_and_commit_round_trip() {
        let repo = Arc::new(InMemorySlotRepository::new());
        let service = service_with(repo.clone());

        let (outcome, view) = service.toggle("u1", "p1", day(), "09:30").await.unwrap();
        assert_eq!(outcome, ToggleOutcome::StagedOpen);
        assert!(view.has_pending_changes);
        assert_eq!(states(&view)[1], ("09:30".to_string(), CellState::PendingOpen));
        assert!(repo.is_empty().await);

        let summary = service.commit_pending("u1", "p1", day()).await.unwrap();
        assert_eq!(summary.opened, 1);
        assert_eq!(summary.closed, 0);

        let view = service.day_view("u1", "p1", day()).await.unwrap();
        assert!(!view.has_pending_changes);
        assert_eq!(
            states(&view),
            vec![
                ("09:00".to_string(), CellState::Empty),
                ("09:30".to_string(), CellState::Open),
                ("10:00".to_string(), CellState::Empty),
                ("10:30".to_string(), CellState::Empty),
            ]
        );

        service.toggle("u1", "p1", day(), "09:30").await.unwrap();
        let summary = service.commit_pending("u1", "p1", day()).await.unwrap();
        assert_eq!(summary.closed, 1);
        let view = service.day_view("u1", "p1", day()).await.unwrap();
        assert_eq!(states(&view)[1].1, CellState::Closed);
    }

    #[tokio::test]
    async fn booked_cell_rejects_toggle() {
        let key = slot_key("10:00");
        let mut slot = Slot::available(&key, crate::models::SlotOrigin::Generated);
        slot.status = SlotStatus::Booked;
        slot.patient_name = Some("Ana".into());
        let repo = Arc::new(InMemorySlotRepository::with_slots([slot]).await);
        let service = service_with(repo.clone());

        assert_matches!(
            service.toggle("u1", "p1", day(), "10:00").await,
            Err(AgendaError::SlotBooked(_))
        );
        let view = service.day_view("u1", "p1", day()).await.unwrap();
        assert_eq!(view.cells[2].state, CellState::Booked);
        assert_eq!(view.cells[2].patient_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn unconfigured_professional_is_reported() {
        let service = service_with(Arc::new(InMemorySlotRepository::new()));
        assert_matches!(
            service.day_view("u1", "p2", day()).await,
            Err(AgendaError::AgendaNotConfigured(id)) if id == "p2"
        );
        assert_matches!(
            service.toggle("u1", "p1", day(), "9h").await,
            Err(AgendaError::InvalidTime(_))
        );
    }

    #[tokio::test]
    async fn bulk_generation_skips_existing_and_reports_counts() {
        let repo = Arc::new(InMemorySlotRepository::new());
        let service = service_with(repo.clone());
        let request = BulkGenerateRequest {
            date_from: day(),
            date_to: day() + Duration::days(6),
            include_saturday: false,
            include_sunday: false,
        };

        let first = service.bulk_generate("p1", &request).await.unwrap();
        assert_eq!(first.created, 20);
        assert_eq!(first.skipped_existing, 0);

        let second = service.bulk_generate("p1", &request).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped_existing, 20);
        assert_eq!(repo.len().await, 20);
    }

    #[tokio::test]
    async fn sync_closes_off_grid_slots_but_keeps_bookings() {
        // Slots from an older 08:00-09:00 agenda
        let mut booked = Slot::available(&slot_key("08:30"), crate::models::SlotOrigin::Generated);
        booked.status = SlotStatus::Booked;
        let repo = Arc::new(
            InMemorySlotRepository::with_slots([
                Slot::available(&slot_key("08:00"), crate::models::SlotOrigin::Generated),
                booked,
            ])
            .await,
        );
        let service = service_with(repo.clone());

        let request = SyncRangeRequest { date_from: day(), date_to: day() };
        let summary = service.sync_range("p1", &request).await.unwrap();
        assert_eq!(summary.upserted, 4);
        assert_eq!(summary.deactivated, 1);

        let stale = SlotId::new("c1", "p1", day(), hhmm::parse("08:00").unwrap());
        assert!(!repo.get(&stale).await.unwrap().unwrap().active);
        let booked = SlotId::new("c1", "p1", day(), hhmm::parse("08:30").unwrap());
        assert!(repo.get(&booked).await.unwrap().unwrap().active);

        let again = service.sync_range("p1", &request).await.unwrap();
        assert_eq!(again.upserted + again.deactivated, 0);
    }

    #[tokio::test]
    async fn open_dates_only_lists_days_with_free_slots() {
        let repo = Arc::new(InMemorySlotRepository::new());
        let service = service_with(repo.clone());
        let request = BulkGenerateRequest {
            date_from: day(),
            date_to: day() + Duration::days(1),
            include_saturday: true,
            include_sunday: true,
        };
        service.bulk_generate("p1", &request).await.unwrap();

        let second_day = day() + Duration::days(1);
        for slot in repo.list_range("c1", "p1", second_day, second_day).await.unwrap() {
            repo.set_active(&slot.id, false).await.unwrap();
        }

        assert_eq!(service.open_dates("p1", day(), 7).await.unwrap(), vec![day()]);
        assert_eq!(service.open_slots("p1", day()).await.unwrap().len(), 4);
        assert!(service.open_slots("p1", second_day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bulk_generation_keeps_a_booking_made_after_the_read() {
        let repo = Arc::new(BookAfterRead::new(InMemorySlotRepository::new(), slot_key("09:00"), patient()));
        let service = service_on(repo.clone());

        let summary = service.bulk_generate("p1", &week()).await.unwrap();
        assert_eq!(summary.created, 19);
        assert_eq!(summary.skipped_existing, 1);

        let stored = repo.inner().get(&slot_key("09:00").id()).await.unwrap().unwrap();
        assert!(stored.is_booked());
        assert_eq!(stored.patient_name.as_deref(), Some("Ana Rojas"));
    }

    #[tokio::test]
    async fn bulk_generation_reports_failed_items_and_writes_the_rest() {
        let failing = slot_key("09:30").id();
        let repo = Arc::new(FailingWrites::new(InMemorySlotRepository::new(), [failing.as_str()]));
        let service = service_on(repo.clone());

        let summary = service.bulk_generate("p1", &week()).await.unwrap();
        assert_eq!(summary.created, 19);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].slot_id, failing);
        assert_eq!(repo.inner().len().await, 19);
        assert!(repo.inner().get(&slot_key("10:00").id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn commit_leaves_slots_booked_after_staging() {
        let open = Slot::available(&slot_key("09:00"), crate::models::SlotOrigin::Generated);
        let repo = Arc::new(InMemorySlotRepository::with_slots([open]).await);
        let service = service_with(repo.clone());

        service.toggle("u1", "p1", day(), "09:00").await.unwrap();
        service.toggle("u1", "p1", day(), "09:30").await.unwrap();

        // Both cells get booked from the chat before the commit
        repo.reserve(&slot_key("09:00"), &patient()).await.unwrap();
        repo.reserve(&slot_key("09:30"), &patient()).await.unwrap();

        let summary = service.commit_pending("u1", "p1", day()).await.unwrap();
        assert_eq!(summary.opened + summary.closed, 0);
        assert_eq!(summary.failures.len(), 2);
        for time in ["09:00", "09:30"] {
            let stored = repo.get(&slot_key(time).id()).await.unwrap().unwrap();
            assert!(stored.is_booked());
            assert!(stored.active);
        }
    }

    #[tokio::test]
    async fn commit_reports_a_failed_item_and_applies_the_others() {
        let failing = slot_key("10:00").id();
        let repo = Arc::new(FailingWrites::new(InMemorySlotRepository::new(), [failing.as_str()]));
        let service = service_on(repo.clone());

        for time in ["09:00", "10:00", "10:30"] {
            service.toggle("u1", "p1", day(), time).await.unwrap();
        }
        let summary = service.commit_pending("u1", "p1", day()).await.unwrap();

        assert_eq!(summary.opened, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].slot_id, failing);
        assert!(repo.inner().get(&slot_key("10:30").id()).await.unwrap().unwrap().is_open());
    }
}
