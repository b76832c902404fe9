use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock date-time of the venue. Reservations are local to a venue, so
/// there is no zone attached.
pub type DateTime = NaiveDateTime;

/// Half-open reservation window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub start: DateTime,
    pub end: DateTime,
}

impl Schedule {
    pub fn new(start: DateTime, end: DateTime) -> Self {
        debug_assert!(start < end, "Schedule start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Schedule) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn has_ended(&self, now: DateTime) -> bool {
        now > self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
    Completed,
}

impl ReservationStatus {
    /// Statuses that can still turn into a real occupancy.
    pub const OCCUPYING: [ReservationStatus; 2] =
        [ReservationStatus::Pending, ReservationStatus::Approved];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Approved => "APPROVED",
            ReservationStatus::Rejected => "REJECTED",
            ReservationStatus::Canceled => "CANCELED",
            ReservationStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_occupying(&self) -> bool {
        Self::OCCUPYING.contains(self)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ReservationStatus::Pending),
            "APPROVED" => Ok(ReservationStatus::Approved),
            "REJECTED" => Ok(ReservationStatus::Rejected),
            "CANCELED" | "CANCELLED" => Ok(ReservationStatus::Canceled),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// Soft-delete flag carried by every persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Inactive,
}

/// What a reservation or occupancy is held against: exactly one chair or one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceRef {
    Chair(Ulid),
    Space(Ulid),
}

impl ResourceRef {
    pub fn id(&self) -> Ulid {
        match self {
            ResourceRef::Chair(id) | ResourceRef::Space(id) => *id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceRef::Chair(_) => "CHAIR",
            ResourceRef::Space(_) => "SPACE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Space,
    Chair { space_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource: ResourceRef,
    pub schedule: Schedule,
    pub status: ReservationStatus,
    pub lifecycle: Lifecycle,
}

impl Reservation {
    /// A freshly requested reservation: pending and active.
    pub fn requested(id: Ulid, user_id: Ulid, resource: ResourceRef, schedule: Schedule) -> Self {
        Self {
            id,
            user_id,
            resource,
            schedule,
            status: ReservationStatus::Pending,
            lifecycle: Lifecycle::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn info(&self) -> ReservationInfo {
        ReservationInfo {
            id: self.id,
            resource: self.resource,
            start: self.schedule.start,
            end: self.schedule.end,
            status: self.status,
        }
    }
}

/// Outcome of a compare-and-set status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub reservation: Reservation,
    /// False when the reservation was already in the target status.
    pub written: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UtilizationStatus {
    CheckIn,
    CheckOut,
    ForceCheckOut,
}

impl UtilizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UtilizationStatus::CheckIn => "CHECK_IN",
            UtilizationStatus::CheckOut => "CHECK_OUT",
            UtilizationStatus::ForceCheckOut => "FORCE_CHECK_OUT",
        }
    }
}

/// Where an occupancy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyKind {
    Reservation {
        reservation_id: Ulid,
        user_id: Ulid,
        resource: ResourceRef,
    },
    WalkIn {
        user_id: Ulid,
        resource: ResourceRef,
    },
}

/// The actual use of a resource, backed by either a reservation or a walk-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub id: Ulid,
    pub schedule: Schedule,
    pub status: UtilizationStatus,
    pub lifecycle: Lifecycle,
    pub kind: OccupancyKind,
}

impl Occupancy {
    pub fn resource(&self) -> ResourceRef {
        match self.kind {
            OccupancyKind::Reservation { resource, .. } | OccupancyKind::WalkIn { resource, .. } => {
                resource
            }
        }
    }

    pub fn user_id(&self) -> Ulid {
        match self.kind {
            OccupancyKind::Reservation { user_id, .. } | OccupancyKind::WalkIn { user_id, .. } => {
                user_id
            }
        }
    }

    pub fn reservation_id(&self) -> Option<Ulid> {
        match self.kind {
            OccupancyKind::Reservation { reservation_id, .. } => Some(reservation_id),
            OccupancyKind::WalkIn { .. } => None,
        }
    }

    pub fn source_name(&self) -> &'static str {
        match self.kind {
            OccupancyKind::Reservation { .. } => "RESERVATION",
            OccupancyKind::WalkIn { .. } => "WALK_IN",
        }
    }

    /// Stop the occupancy now. The end stamp is `now` even when that is
    /// earlier than the planned end, but never before the start.
    pub fn end_with(&mut self, status: UtilizationStatus, now: DateTime) {
        self.status = status;
        self.schedule.end = now.max(self.schedule.start);
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub lifecycle: Lifecycle,
    /// Reservations made directly against this resource, sorted by `schedule.start`.
    /// Equal starts keep insertion order.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, kind: ResourceKind, name: Option<String>) -> Self {
        Self {
            id,
            kind,
            name,
            lifecycle: Lifecycle::Active,
            reservations: Vec::new(),
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        match self.kind {
            ResourceKind::Space => ResourceRef::Space(self.id),
            ResourceKind::Chair { .. } => ResourceRef::Chair(self.id),
        }
    }

    pub fn parent_space(&self) -> Option<Ulid> {
        match self.kind {
            ResourceKind::Chair { space_id } => Some(space_id),
            ResourceKind::Space => None,
        }
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            lifecycle: self.lifecycle,
        }
    }

    /// Insert reservation maintaining sort order by start (stable for ties).
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let start = reservation.schedule.start;
        let pos = self
            .reservations
            .partition_point(|r| r.schedule.start <= start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose window overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Schedule) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.schedule.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.schedule.end > query.start)
    }

    /// Reservations with `after < end < before`, in start order.
    pub fn ending_between(
        &self,
        after: DateTime,
        before: DateTime,
    ) -> impl Iterator<Item = &Reservation> {
        // end < before implies start < before.
        let right_bound = self
            .reservations
            .partition_point(|r| r.schedule.start < before);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.schedule.end > after && r.schedule.end < before)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        id: Ulid,
        name: Option<String>,
    },
    ChairCreated {
        id: Ulid,
        space_id: Ulid,
        name: Option<String>,
    },
    ResourceDeactivated {
        id: Ulid,
    },
    UserRegistered {
        id: Ulid,
        email: String,
        nickname: Option<String>,
    },
    UserDeactivated {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        user_id: Ulid,
        resource: ResourceRef,
        schedule: Schedule,
    },
    ReservationStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: ReservationStatus,
    },
    ReservationDeactivated {
        id: Ulid,
        resource_id: Ulid,
    },
    OccupancyStarted {
        occupancy: Occupancy,
    },
    OccupancyEnded {
        id: Ulid,
        status: UtilizationStatus,
        end: DateTime,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub lifecycle: Lifecycle,
}

impl ResourceInfo {
    pub fn resource_ref(&self) -> ResourceRef {
        match self.kind {
            ResourceKind::Space => ResourceRef::Space(self.id),
            ResourceKind::Chair { .. } => ResourceRef::Chair(self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub email: String,
    pub nickname: Option<String>,
    pub lifecycle: Lifecycle,
}

/// Outward projection of a reservation. Listings and conflict queries return
/// this rather than the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resource: ResourceRef,
    pub start: DateTime,
    pub end: DateTime,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Id of the last reservation of the previous page.
    pub after: Option<Ulid>,
    pub size: usize,
}

impl PageRequest {
    pub fn first(size: usize) -> Self {
        Self { after: None, size }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice<T> {
    pub content: Vec<T>,
    pub has_next: bool,
}

impl<T> Slice<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            has_next: self.has_next,
        }
    }
}
