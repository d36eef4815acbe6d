// libs/agenda-cell/src/services/reconcile.rs
//
// Delta sync between persisted slots and a desired slot set.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::models::{AgendaError, ApplySummary, ItemFailure, Slot, SlotId, SlotOrigin};
use crate::services::repository::{RepositoryError, SlotRepository};

/// Concurrent writes in flight while applying a plan.
const APPLY_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub upserts: Vec<Slot>,
    pub deactivations: Vec<SlotId>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deactivations.is_empty()
    }

    /// Drops booked slots from the deactivation list.
    pub fn spare_booked(&mut self, current: &[Slot]) {
        let booked: HashSet<&SlotId> = current
            .iter()
            .filter(|s| s.is_booked())
            .map(|s| &s.id)
            .collect();
        self.deactivations.retain(|id| !booked.contains(id));
    }
}

/// Field-level comparison; timestamps and patient data are not looked at.
fn differs(current: &Slot, target: &Slot) -> bool {
    current.status != target.status || current.active != target.active || current.time != target.time
}

/// Computes the minimal writes turning `current` into `target`.
///
/// Target slots are upserted when missing or when status, active flag or time
/// changed. Generated, still-active current slots missing from the target are
/// deactivated, booked ones included. The caller applies the plan.
pub fn reconcile(current: &[Slot], target: &[Slot]) -> ReconciliationPlan {
    let by_id: HashMap<&SlotId, &Slot> = current.iter().map(|s| (&s.id, s)).collect();

    let upserts = target
        .iter()
        .filter(|t| by_id.get(&t.id).map_or(true, |c| differs(c, t)))
        .cloned()
        .collect();

    let target_ids: HashSet<&SlotId> = target.iter().map(|t| &t.id).collect();
    let deactivations = current
        .iter()
        .filter(|c| c.origin == SlotOrigin::Generated && c.active)
        .filter(|c| !target_ids.contains(&c.id))
        .map(|c| c.id.clone())
        .collect();

    ReconciliationPlan { upserts, deactivations }
}

/// Creates a target slot, or brings an existing unbooked one to the target's
/// active flag. `Ok(false)` means the stored slot is booked.
async fn write_target(repo: &dyn SlotRepository, slot: &Slot) -> Result<bool, RepositoryError> {
    if repo.insert_if_absent(slot).await? {
        return Ok(true);
    }
    repo.set_active(&slot.id, slot.active).await
}

/// Applies a plan item by item. A failed write is recorded and its siblings
/// still run. Booked slots are never written.
pub async fn apply(repo: &dyn SlotRepository, plan: &ReconciliationPlan) -> ApplySummary {
    let mut summary = ApplySummary::default();

    for batch in plan.upserts.chunks(APPLY_CONCURRENCY) {
        let results = join_all(batch.iter().map(|slot| write_target(repo, slot))).await;
        for (slot, result) in batch.iter().zip(results) {
            match result {
                Ok(true) => summary.upserted += 1,
                Ok(false) => summary.failures.push(ItemFailure {
                    slot_id: slot.id.clone(),
                    reason: AgendaError::SlotBooked(slot.id.clone()).to_string(),
                }),
                Err(e) => {
                    warn!("Write of {} failed: {}", slot.id, e);
                    summary.failures.push(ItemFailure { slot_id: slot.id.clone(), reason: e.to_string() });
                }
            }
        }
    }

    for batch in plan.deactivations.chunks(APPLY_CONCURRENCY) {
        let results = join_all(batch.iter().map(|id| repo.set_active(id, false))).await;
        for (id, result) in batch.iter().zip(results) {
            match result {
                Ok(true) => summary.deactivated += 1,
                Ok(false) => debug!("Slot {} is booked or gone, left as is", id),
                Err(e) => {
                    warn!("Deactivation of {} failed: {}", id, e);
                    summary.failures.push(ItemFailure { slot_id: id.clone(), reason: e.to_string() });
                }
            }
        }
    }

    debug!(
        upserted = summary.upserted,
        deactivated = summary.deactivated,
        failed = summary.failures.len(),
        "Reconciliation plan applied"
    );
    summary
}
