//! Persistence seams the reservation service is written against.
//!
//! Every lookup takes the lifecycle it wants explicitly; nothing filters
//! soft-deleted records implicitly.

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Persist a new reservation. Fails with `Conflict` if an occupying
    /// reservation already holds the resource in an overlapping window.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), EngineError>;

    /// Move a reservation from `from` to `to`. Already being in `to` is a
    /// no-op reported with `written: false`; any other current status fails
    /// with `InvalidReservationStatus`.
    async fn compare_and_set_status(
        &self,
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<StatusWrite, EngineError>;

    async fn find_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<Reservation>, EngineError>;

    async fn find_all_by_user_and_status_and_state(
        &self,
        user_id: Ulid,
        status: ReservationStatus,
        lifecycle: Lifecycle,
    ) -> Result<Vec<Reservation>, EngineError>;

    /// One page ordered by start descending.
    async fn find_slice_by_user_and_status_and_state(
        &self,
        user_id: Ulid,
        status: ReservationStatus,
        lifecycle: Lifecycle,
        page: PageRequest,
    ) -> Result<Slice<Reservation>, EngineError>;

    /// Reservations held directly against `resource` with a status in
    /// `statuses` and `after < end < before`, ordered by start.
    async fn find_all_by_resource_and_status_in_and_end_between(
        &self,
        resource: ResourceRef,
        statuses: &[ReservationStatus],
        after: DateTime,
        before: DateTime,
        lifecycle: Lifecycle,
    ) -> Result<Vec<Reservation>, EngineError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user_by_email_and_state(
        &self,
        email: &str,
        lifecycle: Lifecycle,
    ) -> Result<Option<UserInfo>, EngineError>;

    async fn find_user_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<UserInfo>, EngineError>;
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn find_resource_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<ResourceInfo>, EngineError>;

    async fn find_chairs_by_space_and_state(
        &self,
        space_id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Vec<ResourceInfo>, EngineError>;
}

#[async_trait]
pub trait OccupancyStore: Send + Sync {
    async fn insert_occupancy(&self, occupancy: Occupancy) -> Result<(), EngineError>;

    async fn find_occupancy_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<Occupancy>, EngineError>;

    /// End a checked-in occupancy with `status`, stamping `end`.
    async fn end_occupancy(
        &self,
        id: Ulid,
        status: UtilizationStatus,
        end: DateTime,
    ) -> Result<Occupancy, EngineError>;
}
