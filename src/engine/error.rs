use ulid::Ulid;

use crate::model::{DateTime, ReservationStatus, UtilizationStatus};

#[derive(Debug)]
pub enum EngineError {
    ReservationNotFound(Ulid),
    ResourceNotFound(Ulid),
    UserNotFound(String),
    OccupancyNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Another reservation already holds the resource in that window.
    Conflict(Ulid),
    InvalidReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    InvalidTimeToModifyStatus {
        id: Ulid,
        end: DateTime,
    },
    InvalidTimeUnit {
        start: DateTime,
        end: DateTime,
    },
    InvalidLeadTime {
        start: DateTime,
    },
    InvalidWindow {
        start: DateTime,
        end: DateTime,
    },
    InvalidOccupancyStatus {
        id: Ulid,
        status: UtilizationStatus,
    },
    HasChildren(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ReservationNotFound(_)
                | EngineError::ResourceNotFound(_)
                | EngineError::UserNotFound(_)
                | EngineError::OccupancyNotFound(_)
        )
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::ReservationNotFound(_)
            | EngineError::ResourceNotFound(_)
            | EngineError::UserNotFound(_)
            | EngineError::OccupancyNotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Conflict(_) => "23P01",
            EngineError::InvalidReservationStatus { .. }
            | EngineError::InvalidOccupancyStatus { .. } => "55000",
            EngineError::InvalidTimeToModifyStatus { .. } => "55P04",
            EngineError::InvalidTimeUnit { .. } => "22007",
            EngineError::InvalidLeadTime { .. } => "22008",
            EngineError::InvalidWindow { .. } => "22023",
            EngineError::HasChildren(_) => "2BP01",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::UserNotFound(who) => write!(f, "user not found: {who}"),
            EngineError::OccupancyNotFound(id) => write!(f, "occupancy not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            EngineError::InvalidReservationStatus { id, status } => {
                write!(f, "reservation {id} cannot be modified in status {status}")
            }
            EngineError::InvalidTimeToModifyStatus { id, end } => {
                write!(f, "reservation {id} ended at {end}; its status can no longer change")
            }
            EngineError::InvalidTimeUnit { start, end } => {
                write!(f, "[{start}, {end}) is not aligned to the reservation time unit")
            }
            EngineError::InvalidLeadTime { start } => {
                write!(f, "start {start} does not leave the required lead time")
            }
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window: start {start} is not before end {end}")
            }
            EngineError::InvalidOccupancyStatus { id, status } => {
                write!(f, "occupancy {id} is already {}", status.as_str())
            }
            EngineError::HasChildren(id) => {
                write!(f, "cannot deactivate space {id}: has active chairs")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
