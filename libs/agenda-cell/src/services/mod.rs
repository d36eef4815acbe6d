pub mod agenda;
pub mod audit;
pub mod booking;
pub mod bulk;
pub mod directory;
pub mod grid;
pub mod identity;
pub mod pending;
pub mod reconcile;
pub mod repository;

pub use agenda::AgendaService;
pub use audit::{AuditEvent, AuditSink, SupabaseAuditSink, TracingAuditSink};
pub use booking::{BookingService, CancellationNotifier};
pub use directory::{Directory, StaticDirectory, SupabaseDirectory};
pub use pending::{PendingEditRegistry, PendingEdits, ToggleOutcome};
pub use reconcile::{reconcile, ReconciliationPlan};
pub use repository::{
    InMemorySlotRepository, RepositoryError, ReserveError, SlotRepository, SupabaseSlotRepository,
};
