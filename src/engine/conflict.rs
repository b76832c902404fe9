use chrono::Duration;

use crate::limits::MAX_RESERVATION_HOURS;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_schedule(schedule: &Schedule) -> Result<(), EngineError> {
    if schedule.start >= schedule.end {
        return Err(EngineError::InvalidWindow {
            start: schedule.start,
            end: schedule.end,
        });
    }
    if schedule.end - schedule.start > Duration::hours(MAX_RESERVATION_HOURS) {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// The resource is active and is the kind the reference claims it is.
pub(crate) fn check_accepts(rs: &ResourceState, resource: ResourceRef) -> Result<(), EngineError> {
    if rs.lifecycle != Lifecycle::Active || rs.resource_ref() != resource {
        return Err(EngineError::ResourceNotFound(resource.id()));
    }
    Ok(())
}

/// Fail with the first active, still-occupying reservation on `rs` that
/// overlaps `schedule`.
pub(crate) fn check_no_conflict(rs: &ResourceState, schedule: &Schedule) -> Result<(), EngineError> {
    for existing in rs.overlapping(schedule) {
        if existing.is_active() && existing.status.is_occupying() {
            return Err(EngineError::Conflict(existing.id));
        }
    }
    Ok(())
}
