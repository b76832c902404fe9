use std::collections::HashSet;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_accepts, check_no_conflict, validate_schedule};
use super::{Engine, EngineError, SharedResourceState, WalCommand};

impl Engine {
    pub async fn create_space(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.check_new_resource(id, name.as_deref())?;
        let event = Event::SpaceCreated { id, name };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        Ok(())
    }

    pub async fn create_chair(
        &self,
        id: Ulid,
        space_id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.check_new_resource(id, name.as_deref())?;
        if id == space_id {
            return Err(EngineError::AlreadyExists(id));
        }
        let space = self
            .get_resource(&space_id)
            .ok_or(EngineError::ResourceNotFound(space_id))?;
        {
            let guard = space.read().await;
            check_accepts(&guard, ResourceRef::Space(space_id))?;
        }

        let event = Event::ChairCreated { id, space_id, name };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        Ok(())
    }

    fn check_new_resource(&self, id: Ulid, name: Option<&str>) -> Result<(), EngineError> {
        if self.resources.len() >= MAX_RESOURCES_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    /// Soft-delete a chair or space. A space keeps its place while any of its
    /// chairs is still active.
    pub async fn deactivate_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        if self.has_active_chairs(&id).await {
            return Err(EngineError::HasChildren(id));
        }
        let mut guard = rs.write().await;
        if guard.lifecycle == Lifecycle::Inactive {
            return Err(EngineError::ResourceNotFound(id));
        }
        let event = Event::ResourceDeactivated { id };
        self.persist_and_apply(&mut guard, &event).await
    }

    async fn has_active_chairs(&self, space_id: &Ulid) -> bool {
        let chair_ids = self
            .children
            .get(space_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for chair_id in chair_ids {
            if let Some(chair) = self.get_resource(&chair_id)
                && chair.read().await.lifecycle == Lifecycle::Active {
                    return true;
                }
        }
        false
    }

    pub async fn register_user(
        &self,
        id: Ulid,
        email: String,
        nickname: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.users.len() >= MAX_USERS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if email.is_empty() || email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email length out of range"));
        }
        if let Some(ref n) = nickname
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("nickname too long"));
            }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.user_emails.get(&email) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }

        let event = Event::UserRegistered { id, email, nickname };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        Ok(())
    }

    pub async fn deactivate_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        match self.users.get(&id) {
            Some(user) if user.lifecycle == Lifecycle::Active => {}
            _ => return Err(EngineError::UserNotFound(id.to_string())),
        }
        let event = Event::UserDeactivated { id };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        Ok(())
    }

    /// Persist a new pending reservation unless something already holds the
    /// resource in that window.
    ///
    /// A chair is blocked by its own reservations and by reservations of its
    /// space. A space is blocked only by reservations made against the space.
    /// Chair bookings take the space's write lock first, so bookings inside
    /// one space are serialized.
    pub async fn create_reservation(&self, reservation: Reservation) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        validate_schedule(&reservation.schedule)?;
        if self.reservation_to_resource.contains_key(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }
        let resource_id = reservation.resource.id();
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        let event = Event::ReservationCreated {
            id: reservation.id,
            user_id: reservation.user_id,
            resource: reservation.resource,
            schedule: reservation.schedule,
        };

        match reservation.resource {
            ResourceRef::Space(_) => {
                let mut guard = rs.write().await;
                check_accepts(&guard, reservation.resource)?;
                if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
                    return Err(EngineError::LimitExceeded("too many reservations on resource"));
                }
                check_no_conflict(&guard, &reservation.schedule)?;
                self.persist_and_apply(&mut guard, &event).await?;
            }
            ResourceRef::Chair(_) => {
                let space_id = rs
                    .read()
                    .await
                    .parent_space()
                    .ok_or(EngineError::ResourceNotFound(resource_id))?;
                let space = self
                    .get_resource(&space_id)
                    .ok_or(EngineError::ResourceNotFound(space_id))?;
                let space_guard = space.write().await;
                let mut guard = rs.write().await;
                check_accepts(&guard, reservation.resource)?;
                if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
                    return Err(EngineError::LimitExceeded("too many reservations on resource"));
                }
                check_no_conflict(&space_guard, &reservation.schedule)?;
                check_no_conflict(&guard, &reservation.schedule)?;
                self.persist_and_apply(&mut guard, &event).await?;
            }
        }

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        Ok(())
    }

    /// Compare-and-set on a reservation's status. Re-applying the current
    /// status is a no-op and writes nothing.
    pub async fn transition_reservation(
        &self,
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<StatusWrite, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .filter(|r| r.is_active())
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;

        if current.status == to {
            return Ok(StatusWrite {
                reservation: current,
                written: false,
            });
        }
        if current.status != from {
            return Err(EngineError::InvalidReservationStatus {
                id,
                status: current.status,
            });
        }

        let event = Event::ReservationStatusChanged {
            id,
            resource_id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(
            crate::observability::RESERVATION_TRANSITIONS_TOTAL,
            "status" => to.as_str()
        )
        .increment(1);

        let reservation = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        Ok(StatusWrite {
            reservation,
            written: true,
        })
    }

    /// Soft-delete a reservation. Its status is left as it was.
    pub async fn deactivate_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        if !guard.reservation(&id).is_some_and(|r| r.is_active()) {
            return Err(EngineError::ReservationNotFound(id));
        }
        let event = Event::ReservationDeactivated { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Record a check-in or walk-in. A reservation backs at most one
    /// occupancy; a second check-in fails with `AlreadyExists` naming the
    /// first occupancy.
    pub async fn start_occupancy(&self, occupancy: Occupancy) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        validate_schedule(&occupancy.schedule)?;
        if self.occupancies.contains_key(&occupancy.id) {
            return Err(EngineError::AlreadyExists(occupancy.id));
        }
        let resource = occupancy.resource();
        let rs = self
            .get_resource(&resource.id())
            .ok_or(EngineError::ResourceNotFound(resource.id()))?;
        // Held until applied so racing check-ins of one reservation serialize.
        let guard = rs.write().await;
        check_accepts(&guard, resource)?;
        if let Some(reservation_id) = occupancy.reservation_id()
            && let Some(existing) = self.reservation_occupancy.get(&reservation_id)
        {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }

        let event = Event::OccupancyStarted { occupancy };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        Ok(())
    }

    /// End a checked-in occupancy. Only `CheckIn` can be ended; ending twice
    /// fails with `InvalidOccupancyStatus`.
    pub async fn end_occupancy(
        &self,
        id: Ulid,
        status: UtilizationStatus,
        end: DateTime,
    ) -> Result<Occupancy, EngineError> {
        let _gate = self.commit_gate.read().await;
        let occ = self
            .get_occupancy(&id)
            .ok_or(EngineError::OccupancyNotFound(id))?;
        let mut guard = occ.lock().await;
        if guard.lifecycle != Lifecycle::Active {
            return Err(EngineError::OccupancyNotFound(id));
        }
        if guard.status != UtilizationStatus::CheckIn {
            return Err(EngineError::InvalidOccupancyStatus {
                id,
                status: guard.status,
            });
        }

        let event = Event::OccupancyEnded { id, status, end };
        self.wal_append(&event).await?;
        guard.end_with(status, end);
        Ok(guard.clone())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// No mutation runs between the snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        let mut visited = HashSet::new();

        fn emit_resource(
            id: Ulid,
            resources: &dashmap::DashMap<Ulid, SharedResourceState>,
            events: &mut Vec<Event>,
            reservations: &mut Vec<Event>,
            visited: &mut HashSet<Ulid>,
        ) -> Result<(), EngineError> {
            if !visited.insert(id) {
                return Ok(());
            }
            let rs = match resources.get(&id) {
                Some(e) => e.value().clone(),
                None => return Ok(()),
            };
            let guard = rs
                .try_read()
                .map_err(|_| EngineError::WalError("resource write-locked during compaction".into()))?;

            // Spaces before their chairs.
            if let Some(space_id) = guard.parent_space() {
                emit_resource(space_id, resources, events, reservations, visited)?;
            }

            match guard.kind {
                ResourceKind::Space => events.push(Event::SpaceCreated {
                    id: guard.id,
                    name: guard.name.clone(),
                }),
                ResourceKind::Chair { space_id } => events.push(Event::ChairCreated {
                    id: guard.id,
                    space_id,
                    name: guard.name.clone(),
                }),
            }

            for r in &guard.reservations {
                reservations.push(Event::ReservationCreated {
                    id: r.id,
                    user_id: r.user_id,
                    resource: r.resource,
                    schedule: r.schedule,
                });
                if r.status != ReservationStatus::Pending {
                    reservations.push(Event::ReservationStatusChanged {
                        id: r.id,
                        resource_id: guard.id,
                        status: r.status,
                    });
                }
                if !r.is_active() {
                    reservations.push(Event::ReservationDeactivated {
                        id: r.id,
                        resource_id: guard.id,
                    });
                }
            }
            // Deactivation goes after the reservations so replay restores them first.
            if guard.lifecycle == Lifecycle::Inactive {
                reservations.push(Event::ResourceDeactivated { id: guard.id });
            }
            Ok(())
        }

        for entry in self.users.iter() {
            let user = entry.value();
            events.push(Event::UserRegistered {
                id: user.id,
                email: user.email.clone(),
                nickname: user.nickname.clone(),
            });
            if user.lifecycle == Lifecycle::Inactive {
                events.push(Event::UserDeactivated { id: user.id });
            }
        }

        let mut reservation_events = Vec::new();
        let resource_ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        for id in resource_ids {
            emit_resource(
                id,
                &self.resources,
                &mut events,
                &mut reservation_events,
                &mut visited,
            )?;
        }
        events.append(&mut reservation_events);

        let occupancies: Vec<_> = self.occupancies.iter().map(|e| e.value().clone()).collect();
        for occ in occupancies {
            let guard = occ.lock().await;
            events.push(Event::OccupancyStarted {
                occupancy: guard.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
