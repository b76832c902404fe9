//! User-facing reservation use cases on top of the store seams.
//!
//! Every operation reads `now` once from the injected [`Clock`] and applies
//! the time rules, the status machine and the conflict resolver against it.

pub mod conflict;
pub mod status;

use std::sync::Arc;

use tracing::debug;
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::rules::TimeRules;
use crate::store::{OccupancyStore, ReservationStore, ResourceDirectory, UserDirectory};

use conflict::ConflictResolver;

pub struct ReservationService {
    reservations: Arc<dyn ReservationStore>,
    occupancies: Arc<dyn OccupancyStore>,
    users: Arc<dyn UserDirectory>,
    resources: Arc<dyn ResourceDirectory>,
    clock: Arc<dyn Clock>,
    rules: TimeRules,
}

impl ReservationService {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        occupancies: Arc<dyn OccupancyStore>,
        users: Arc<dyn UserDirectory>,
        resources: Arc<dyn ResourceDirectory>,
        clock: Arc<dyn Clock>,
        rules: TimeRules,
    ) -> Self {
        Self {
            reservations,
            occupancies,
            users,
            resources,
            clock,
            rules,
        }
    }

    /// All four seams backed by one engine.
    pub fn from_engine(engine: Arc<Engine>, clock: Arc<dyn Clock>, rules: TimeRules) -> Self {
        Self::new(
            engine.clone(),
            engine.clone(),
            engine.clone(),
            engine,
            clock,
            rules,
        )
    }

    pub fn rules(&self) -> TimeRules {
        self.rules
    }

    pub fn now(&self) -> DateTime {
        self.clock.now()
    }

    fn conflicts(&self) -> ConflictResolver<'_> {
        ConflictResolver::new(self.reservations.as_ref(), self.resources.as_ref())
    }

    async fn active_user(&self, email: &str) -> Result<UserInfo, EngineError> {
        self.users
            .find_user_by_email_and_state(email, Lifecycle::Active)
            .await?
            .ok_or_else(|| EngineError::UserNotFound(email.to_string()))
    }

    async fn active_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        self.resources
            .find_resource_by_id_and_state(id, Lifecycle::Active)
            .await?
            .ok_or(EngineError::ResourceNotFound(id))
    }

    async fn active_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .find_by_id_and_state(id, Lifecycle::Active)
            .await?
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Request a chair or space for `[start, end)` on behalf of the user
    /// with `email`. The new reservation is pending.
    pub async fn reserve(
        &self,
        id: Ulid,
        email: &str,
        resource_id: Ulid,
        start: DateTime,
        end: DateTime,
    ) -> Result<ReservationInfo, EngineError> {
        let now = self.clock.now();
        let user = self.active_user(email).await?;
        let resource = self.active_resource(resource_id).await?;
        self.rules.validate_window(start, end, now)?;

        let reservation = Reservation::requested(
            id,
            user.id,
            resource.resource_ref(),
            Schedule::new(start, end),
        );
        let info = reservation.info();
        self.reservations.insert_reservation(reservation).await?;
        Ok(info)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        Ok(self.active_reservation(id).await?.info())
    }

    /// One page of the user's active reservations in `status`, newest start
    /// first. Listing pending reservations first rejects the ones whose
    /// window has already passed.
    pub async fn list_user_reservations(
        &self,
        email: &str,
        status: ReservationStatus,
        page: PageRequest,
    ) -> Result<Slice<ReservationInfo>, EngineError> {
        let user = self.active_user(email).await?;
        if status == ReservationStatus::Pending {
            self.reject_expired(user.id).await?;
        }
        let slice = self
            .reservations
            .find_slice_by_user_and_status_and_state(user.id, status, Lifecycle::Active, page)
            .await?;
        Ok(slice.map(|r| r.info()))
    }

    /// Reject every pending reservation of the user whose window has ended.
    /// Returns how many this pass rejected.
    pub async fn reject_expired(&self, user_id: Ulid) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let pending = self
            .reservations
            .find_all_by_user_and_status_and_state(
                user_id,
                ReservationStatus::Pending,
                Lifecycle::Active,
            )
            .await?;

        let mut rejected = 0;
        for reservation in pending.iter().filter(|r| status::is_expired(r, now)) {
            match self
                .reservations
                .compare_and_set_status(
                    reservation.id,
                    ReservationStatus::Pending,
                    ReservationStatus::Rejected,
                )
                .await
            {
                Ok(write) if write.written => rejected += 1,
                // Someone else moved it out of pending first.
                Ok(_) => {}
                Err(EngineError::InvalidReservationStatus { .. })
                | Err(EngineError::ReservationNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if rejected > 0 {
            metrics::counter!(crate::observability::RESERVATIONS_EXPIRED_TOTAL)
                .increment(rejected as u64);
            debug!("rejected {rejected} expired reservations of user {user_id}");
        }
        Ok(rejected)
    }

    /// Cancel a pending or approved reservation before its window closes.
    /// The window itself is left untouched.
    pub async fn cancel(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let reservation = self.active_reservation(id).await?;
        status::check_cancellable(&reservation, self.clock.now())?;
        let updated = self
            .reservations
            .compare_and_set_status(id, reservation.status, ReservationStatus::Canceled)
            .await?;
        Ok(updated.reservation.info())
    }

    pub async fn approve(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        self.decide(id, ReservationStatus::Approved).await
    }

    pub async fn reject(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        self.decide(id, ReservationStatus::Rejected).await
    }

    async fn decide(&self, id: Ulid, to: ReservationStatus) -> Result<ReservationInfo, EngineError> {
        let reservation = self.active_reservation(id).await?;
        status::check_decidable(&reservation, to, self.clock.now())?;
        let updated = self
            .reservations
            .compare_and_set_status(id, ReservationStatus::Pending, to)
            .await?;
        Ok(updated.reservation.info())
    }

    pub async fn complete(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let reservation = self.active_reservation(id).await?;
        status::check_completable(&reservation)?;
        let updated = self
            .reservations
            .compare_and_set_status(id, ReservationStatus::Approved, ReservationStatus::Completed)
            .await?;
        Ok(updated.reservation.info())
    }

    pub async fn conflicts_for_chair_and_date(
        &self,
        chair_id: Ulid,
        at: DateTime,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        self.conflicts().for_chair(chair_id, at).await
    }

    /// Includes reservations held on any of the space's chairs.
    pub async fn conflicts_for_space_and_date(
        &self,
        space_id: Ulid,
        at: DateTime,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        self.conflicts().for_space(space_id, at).await
    }

    /// Start occupying the resource of an approved reservation. The
    /// occupancy runs to the reservation's end and never starts before the
    /// reservation does. A reservation can be checked in once.
    pub async fn check_in(&self, id: Ulid, reservation_id: Ulid) -> Result<Occupancy, EngineError> {
        let now = self.clock.now();
        let reservation = self.active_reservation(reservation_id).await?;
        if reservation.status != ReservationStatus::Approved {
            return Err(EngineError::InvalidReservationStatus {
                id: reservation_id,
                status: reservation.status,
            });
        }
        if now >= reservation.schedule.end {
            return Err(EngineError::InvalidTimeToModifyStatus {
                id: reservation_id,
                end: reservation.schedule.end,
            });
        }

        let occupancy = Occupancy {
            id,
            schedule: Schedule::new(now.max(reservation.schedule.start), reservation.schedule.end),
            status: UtilizationStatus::CheckIn,
            lifecycle: Lifecycle::Active,
            kind: OccupancyKind::Reservation {
                reservation_id,
                user_id: reservation.user_id,
                resource: reservation.resource,
            },
        };
        self.occupancies.insert_occupancy(occupancy.clone()).await?;
        Ok(occupancy)
    }

    /// Occupy a resource right now without a reservation, until `end`.
    pub async fn walk_in(
        &self,
        id: Ulid,
        email: &str,
        resource_id: Ulid,
        end: DateTime,
    ) -> Result<Occupancy, EngineError> {
        let now = self.clock.now();
        let user = self.active_user(email).await?;
        let resource = self.active_resource(resource_id).await?;
        if end <= now {
            return Err(EngineError::InvalidWindow { start: now, end });
        }

        let occupancy = Occupancy {
            id,
            schedule: Schedule::new(now, end),
            status: UtilizationStatus::CheckIn,
            lifecycle: Lifecycle::Active,
            kind: OccupancyKind::WalkIn {
                user_id: user.id,
                resource: resource.resource_ref(),
            },
        };
        self.occupancies.insert_occupancy(occupancy.clone()).await?;
        Ok(occupancy)
    }

    pub async fn check_out(&self, id: Ulid) -> Result<Occupancy, EngineError> {
        self.end_occupancy(id, UtilizationStatus::CheckOut).await
    }

    /// Staff-initiated end of an occupancy; stamps the end at now.
    pub async fn force_check_out(&self, id: Ulid) -> Result<Occupancy, EngineError> {
        self.end_occupancy(id, UtilizationStatus::ForceCheckOut).await
    }

    async fn end_occupancy(&self, id: Ulid, status: UtilizationStatus) -> Result<Occupancy, EngineError> {
        let now = self.clock.now();
        self.occupancies.end_occupancy(id, status, now).await
    }

    pub async fn get_occupancy(&self, id: Ulid) -> Result<Occupancy, EngineError> {
        self.occupancies
            .find_occupancy_by_id_and_state(id, Lifecycle::Active)
            .await?
            .ok_or(EngineError::OccupancyNotFound(id))
    }
}
