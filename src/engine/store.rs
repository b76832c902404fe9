use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;
use crate::store::{OccupancyStore, ReservationStore, ResourceDirectory, UserDirectory};

use super::{Engine, EngineError};

#[async_trait]
impl ReservationStore for Engine {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), EngineError> {
        self.create_reservation(reservation).await
    }

    async fn compare_and_set_status(
        &self,
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<StatusWrite, EngineError> {
        self.transition_reservation(id, from, to).await
    }

    async fn find_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<Reservation>, EngineError> {
        Ok(self
            .get_reservation(&id)
            .await
            .filter(|r| r.lifecycle == lifecycle))
    }

    async fn find_all_by_user_and_status_and_state(
        &self,
        user_id: Ulid,
        status: ReservationStatus,
        lifecycle: Lifecycle,
    ) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.user_reservations_with(&user_id, status, lifecycle).await)
    }

    async fn find_slice_by_user_and_status_and_state(
        &self,
        user_id: Ulid,
        status: ReservationStatus,
        lifecycle: Lifecycle,
        page: PageRequest,
    ) -> Result<Slice<Reservation>, EngineError> {
        self.user_reservation_slice(&user_id, status, lifecycle, page)
            .await
    }

    async fn find_all_by_resource_and_status_in_and_end_between(
        &self,
        resource: ResourceRef,
        statuses: &[ReservationStatus],
        after: DateTime,
        before: DateTime,
        lifecycle: Lifecycle,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.reservations_ending_between(resource, statuses, after, before, lifecycle)
            .await
    }
}

#[async_trait]
impl UserDirectory for Engine {
    async fn find_user_by_email_and_state(
        &self,
        email: &str,
        lifecycle: Lifecycle,
    ) -> Result<Option<UserInfo>, EngineError> {
        Ok(self
            .get_user_by_email(email)
            .filter(|u| u.lifecycle == lifecycle))
    }

    async fn find_user_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<UserInfo>, EngineError> {
        Ok(self.get_user(&id).filter(|u| u.lifecycle == lifecycle))
    }
}

#[async_trait]
impl ResourceDirectory for Engine {
    async fn find_resource_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<ResourceInfo>, EngineError> {
        Ok(self
            .get_resource_info(&id)
            .await
            .filter(|r| r.lifecycle == lifecycle))
    }

    async fn find_chairs_by_space_and_state(
        &self,
        space_id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Vec<ResourceInfo>, EngineError> {
        let mut chairs = self.chairs_of_space(&space_id).await;
        chairs.retain(|c| c.lifecycle == lifecycle);
        Ok(chairs)
    }
}

#[async_trait]
impl OccupancyStore for Engine {
    async fn insert_occupancy(&self, occupancy: Occupancy) -> Result<(), EngineError> {
        self.start_occupancy(occupancy).await
    }

    async fn find_occupancy_by_id_and_state(
        &self,
        id: Ulid,
        lifecycle: Lifecycle,
    ) -> Result<Option<Occupancy>, EngineError> {
        Ok(self
            .get_occupancy_snapshot(&id)
            .await
            .filter(|o| o.lifecycle == lifecycle))
    }

    async fn end_occupancy(
        &self,
        id: Ulid,
        status: UtilizationStatus,
        end: DateTime,
    ) -> Result<Occupancy, EngineError> {
        Engine::end_occupancy(self, id, status, end).await
    }
}
