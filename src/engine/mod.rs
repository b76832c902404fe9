mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedOccupancy = Arc<Mutex<Occupancy>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before running the non-append command.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// WAL-backed in-memory reservation store for one venue.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_to_resource: DashMap<Ulid, Ulid>,
    /// Space → chairs index.
    pub(super) children: DashMap<Ulid, Vec<Ulid>>,
    pub(super) users: DashMap<Ulid, UserInfo>,
    pub(super) user_emails: DashMap<String, Ulid>,
    /// User → reservation ids in creation order.
    pub(super) user_reservations: DashMap<Ulid, Vec<Ulid>>,
    pub(super) occupancies: DashMap<Ulid, SharedOccupancy>,
    /// Reservation → the occupancy its check-in started.
    pub(super) reservation_occupancy: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared from their first check until their event is
    /// applied; compaction holds it exclusively, so its snapshot matches the log.
    /// Taken before any resource or occupancy lock.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a reservation-level event to its resource. Caller holds the write lock.
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    reservation_index: &DashMap<Ulid, Ulid>,
    user_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::ReservationCreated {
            id,
            user_id,
            resource,
            schedule,
        } => {
            rs.insert_reservation(Reservation::requested(*id, *user_id, *resource, *schedule));
            reservation_index.insert(*id, resource.id());
            user_index.entry(*user_id).or_default().push(*id);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = *status;
            }
        }
        Event::ReservationDeactivated { id, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.lifecycle = Lifecycle::Inactive;
            }
        }
        Event::ResourceDeactivated { .. } => {
            rs.lifecycle = Lifecycle::Inactive;
        }
        // Directory and occupancy events are handled at the DashMap level, not here
        Event::SpaceCreated { .. }
        | Event::ChairCreated { .. }
        | Event::UserRegistered { .. }
        | Event::UserDeactivated { .. }
        | Event::OccupancyStarted { .. }
        | Event::OccupancyEnded { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            wal_tx,
            reservation_to_resource: DashMap::new(),
            children: DashMap::new(),
            users: DashMap::new(),
            user_emails: DashMap::new(),
            user_reservations: DashMap::new(),
            occupancies: DashMap::new(),
            reservation_occupancy: DashMap::new(),
            commit_gate: RwLock::new(()),
        };

        // Replay events. We're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may run
        // inside an async context (e.g. lazy venue creation).
        for event in &events {
            match event_resource_id(event) {
                Some(resource_id) => {
                    if let Some(rs) = engine.get_resource(&resource_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        apply_to_resource(
                            &mut guard,
                            event,
                            &engine.reservation_to_resource,
                            &engine.user_reservations,
                        );
                    }
                }
                None => engine.apply_directory_event(event),
            }
        }

        Ok(engine)
    }

    /// Apply an event that doesn't live on a resource's reservation list.
    pub(super) fn apply_directory_event(&self, event: &Event) {
        match event {
            Event::SpaceCreated { id, name } => {
                let rs = ResourceState::new(*id, ResourceKind::Space, name.clone());
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ChairCreated { id, space_id, name } => {
                let rs = ResourceState::new(
                    *id,
                    ResourceKind::Chair {
                        space_id: *space_id,
                    },
                    name.clone(),
                );
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
                self.children.entry(*space_id).or_default().push(*id);
            }
            Event::UserRegistered { id, email, nickname } => {
                self.users.insert(
                    *id,
                    UserInfo {
                        id: *id,
                        email: email.clone(),
                        nickname: nickname.clone(),
                        lifecycle: Lifecycle::Active,
                    },
                );
                self.user_emails.insert(email.clone(), *id);
            }
            Event::UserDeactivated { id } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.lifecycle = Lifecycle::Inactive;
                }
            }
            Event::OccupancyStarted { occupancy } => {
                if let Some(reservation_id) = occupancy.reservation_id() {
                    self.reservation_occupancy.insert(reservation_id, occupancy.id);
                }
                self.occupancies
                    .insert(occupancy.id, Arc::new(Mutex::new(occupancy.clone())));
            }
            Event::OccupancyEnded { id, status, end } => {
                if let Some(occ) = self.get_occupancy(id)
                    && let Ok(mut guard) = occ.try_lock()
                {
                    guard.end_with(*status, *end);
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub fn get_occupancy(&self, id: &Ulid) -> Option<SharedOccupancy> {
        self.occupancies.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(
            rs,
            event,
            &self.reservation_to_resource,
            &self.user_reservations,
        );
        Ok(())
    }

    /// Lookup reservation → resource, get resource, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_reservation(reservation_id)
            .ok_or(EngineError::ReservationNotFound(*reservation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}

/// The resource whose reservation list an event touches, if any.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { resource, .. } => Some(resource.id()),
        Event::ReservationStatusChanged { resource_id, .. }
        | Event::ReservationDeactivated { resource_id, .. } => Some(*resource_id),
        Event::ResourceDeactivated { id } => Some(*id),
        Event::SpaceCreated { .. }
        | Event::ChairCreated { .. }
        | Event::UserRegistered { .. }
        | Event::UserDeactivated { .. }
        | Event::OccupancyStarted { .. }
        | Event::OccupancyEnded { .. } => None,
    }
}
