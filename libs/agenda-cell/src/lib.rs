// =====================================================================================
// AGENDA CELL - SLOT GRID, STAGED EDITS, DELTA SYNC & BOOKING
// =====================================================================================

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use models::{
    AgendaConfig, AgendaError, BookingError, PatientIdentity, Professional, Slot, SlotId,
    SlotKey, SlotOrigin, SlotStatus,
};

pub use router::{agenda_routes, AgendaState};
