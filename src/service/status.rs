//! Reservation status transitions and their time guards.
//!
//! ```text
//! Pending  ──► Approved ──► Completed
//!    │  │          │
//!    │  └──► Rejected
//!    └─────┴──────►  Canceled
//! ```

use crate::engine::EngineError;
use crate::model::{DateTime, Reservation, ReservationStatus};

pub fn can_transition_to(from: ReservationStatus, to: ReservationStatus) -> bool {
    use ReservationStatus::*;
    matches!(
        (from, to),
        (Pending, Approved)
            | (Pending, Rejected)
            | (Pending, Canceled)
            | (Approved, Canceled)
            | (Approved, Completed)
    )
}

pub fn is_terminal(status: ReservationStatus) -> bool {
    use ReservationStatus::*;
    matches!(status, Rejected | Canceled | Completed)
}

/// The window has not closed yet; status changes are only allowed before `end`.
fn check_still_open(reservation: &Reservation, now: DateTime) -> Result<(), EngineError> {
    if now < reservation.schedule.end {
        Ok(())
    } else {
        Err(EngineError::InvalidTimeToModifyStatus {
            id: reservation.id,
            end: reservation.schedule.end,
        })
    }
}

fn check_transition(reservation: &Reservation, to: ReservationStatus) -> Result<(), EngineError> {
    if can_transition_to(reservation.status, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidReservationStatus {
            id: reservation.id,
            status: reservation.status,
        })
    }
}

/// Pending or approved, and the window still open. Status is checked first.
pub fn check_cancellable(reservation: &Reservation, now: DateTime) -> Result<(), EngineError> {
    check_transition(reservation, ReservationStatus::Canceled)?;
    check_still_open(reservation, now)
}

/// Approve or reject: only a pending reservation whose window is still open.
pub fn check_decidable(
    reservation: &Reservation,
    to: ReservationStatus,
    now: DateTime,
) -> Result<(), EngineError> {
    check_transition(reservation, to)?;
    check_still_open(reservation, now)
}

pub fn check_completable(reservation: &Reservation) -> Result<(), EngineError> {
    check_transition(reservation, ReservationStatus::Completed)
}

/// A pending reservation whose window has fully passed.
pub fn is_expired(reservation: &Reservation, now: DateTime) -> bool {
    reservation.status == ReservationStatus::Pending && reservation.schedule.has_ended(now)
}
