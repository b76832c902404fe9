use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// A reservation regardless of its lifecycle.
    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let resource_id = self.get_resource_for_reservation(id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.reservation(id).cloned()
    }

    /// All of a user's reservations in creation order.
    pub async fn reservations_for_user(&self, user_id: &Ulid) -> Vec<Reservation> {
        let ids = self
            .user_reservations
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_reservation(&id).await {
                out.push(r);
            }
        }
        out
    }

    pub async fn user_reservations_with(
        &self,
        user_id: &Ulid,
        status: ReservationStatus,
        lifecycle: Lifecycle,
    ) -> Vec<Reservation> {
        let mut matching: Vec<_> = self
            .reservations_for_user(user_id)
            .await
            .into_iter()
            .filter(|r| r.status == status && r.lifecycle == lifecycle)
            .collect();
        matching.sort_by_key(|r| Reverse((r.schedule.start, r.id)));
        matching
    }

    /// One page of a user's reservations, newest start first.
    ///
    /// `page.after` is the id of the last row of the previous page. A cursor
    /// that no longer matches the filter still positions the page by its
    /// `(start, id)` key.
    pub async fn user_reservation_slice(
        &self,
        user_id: &Ulid,
        status: ReservationStatus,
        lifecycle: Lifecycle,
        page: PageRequest,
    ) -> Result<Slice<Reservation>, EngineError> {
        let size = page.size.clamp(1, MAX_PAGE_SIZE);
        let ordered = self.user_reservations_with(user_id, status, lifecycle).await;

        let skip = match page.after {
            None => 0,
            Some(cursor_id) => {
                let cursor = self
                    .get_reservation(&cursor_id)
                    .await
                    .ok_or(EngineError::ReservationNotFound(cursor_id))?;
                let key = Reverse((cursor.schedule.start, cursor.id));
                ordered.partition_point(|r| Reverse((r.schedule.start, r.id)) <= key)
            }
        };

        let mut content: Vec<_> = ordered.into_iter().skip(skip).take(size + 1).collect();
        let has_next = content.len() > size;
        content.truncate(size);
        Ok(Slice { content, has_next })
    }

    /// Reservations made directly against `resource` whose end lies strictly
    /// between `after` and `before`, in start order.
    pub async fn reservations_ending_between(
        &self,
        resource: ResourceRef,
        statuses: &[ReservationStatus],
        after: DateTime,
        before: DateTime,
        lifecycle: Lifecycle,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource.id())
            .ok_or(EngineError::ResourceNotFound(resource.id()))?;
        let guard = rs.read().await;
        if guard.resource_ref() != resource {
            return Err(EngineError::ResourceNotFound(resource.id()));
        }
        Ok(guard
            .ending_between(after, before)
            .filter(|r| r.lifecycle == lifecycle && statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    pub async fn get_resource_info(&self, id: &Ulid) -> Option<ResourceInfo> {
        let rs = self.get_resource(id)?;
        let guard = rs.read().await;
        Some(guard.info())
    }

    pub async fn chairs_of_space(&self, space_id: &Ulid) -> Vec<ResourceInfo> {
        let chair_ids = self
            .children
            .get(space_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(chair_ids.len());
        for id in chair_ids {
            if let Some(info) = self.get_resource_info(&id).await {
                out.push(info);
            }
        }
        out
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn get_user_by_email(&self, email: &str) -> Option<UserInfo> {
        let id = *self.user_emails.get(email)?.value();
        self.get_user(&id)
    }

    pub async fn get_occupancy_snapshot(&self, id: &Ulid) -> Option<Occupancy> {
        let occ = self.get_occupancy(id)?;
        let guard = occ.lock().await;
        Some(guard.clone())
    }
}
