use chrono::NaiveTime;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;
use crate::store::{ReservationStore, ResourceDirectory};

/// Exclusive upper bound of the calendar day holding `at`: next midnight.
pub fn day_limit(at: DateTime) -> Result<DateTime, EngineError> {
    at.date()
        .succ_opt()
        .map(|d| d.and_time(NaiveTime::MIN))
        .ok_or(EngineError::LimitExceeded("date out of range"))
}

/// Reservations that can still occupy a resource during the rest of a day.
pub struct ConflictResolver<'a> {
    reservations: &'a dyn ReservationStore,
    resources: &'a dyn ResourceDirectory,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(reservations: &'a dyn ReservationStore, resources: &'a dyn ResourceDirectory) -> Self {
        Self {
            reservations,
            resources,
        }
    }

    async fn active_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        self.resources
            .find_resource_by_id_and_state(id, Lifecycle::Active)
            .await?
            .ok_or(EngineError::ResourceNotFound(id))
    }

    async fn direct(
        &self,
        resource: ResourceRef,
        at: DateTime,
        limit: DateTime,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.reservations
            .find_all_by_resource_and_status_in_and_end_between(
                resource,
                &ReservationStatus::OCCUPYING,
                at,
                limit,
                Lifecycle::Active,
            )
            .await
    }

    pub async fn for_chair(&self, chair_id: Ulid, at: DateTime) -> Result<Vec<ReservationInfo>, EngineError> {
        let chair = self.active_resource(chair_id).await?;
        if !matches!(chair.kind, ResourceKind::Chair { .. }) {
            return Err(EngineError::ResourceNotFound(chair_id));
        }
        let limit = day_limit(at)?;
        let found = self.direct(ResourceRef::Chair(chair_id), at, limit).await?;
        Ok(sorted_infos(found))
    }

    /// Reservations on the space itself followed by those on each of its
    /// active chairs, then stable-sorted by start.
    pub async fn for_space(&self, space_id: Ulid, at: DateTime) -> Result<Vec<ReservationInfo>, EngineError> {
        let space = self.active_resource(space_id).await?;
        if space.kind != ResourceKind::Space {
            return Err(EngineError::ResourceNotFound(space_id));
        }
        let limit = day_limit(at)?;

        let mut found = self.direct(ResourceRef::Space(space_id), at, limit).await?;
        let chairs = self
            .resources
            .find_chairs_by_space_and_state(space_id, Lifecycle::Active)
            .await?;
        for chair in chairs {
            found.extend(self.direct(chair.resource_ref(), at, limit).await?);
        }
        Ok(sorted_infos(found))
    }
}

fn sorted_infos(mut found: Vec<Reservation>) -> Vec<ReservationInfo> {
    found.sort_by_key(|r| r.schedule.start);
    found.iter().map(Reservation::info).collect()
}
