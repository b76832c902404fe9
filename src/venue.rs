use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::clock::Clock;
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::rules::TimeRules;
use crate::service::ReservationService;

/// One venue: its engine (and WAL) plus the reservation service on top.
pub struct Venue {
    pub engine: Arc<Engine>,
    pub service: ReservationService,
}

/// Manages per-venue engines. Venue = database name from the pgwire connection.
pub struct VenueManager {
    venues: DashMap<String, Arc<Venue>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    clock: Arc<dyn Clock>,
    rules: TimeRules,
}

impl VenueManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        clock: Arc<dyn Clock>,
        rules: TimeRules,
    ) -> Self {
        Self {
            venues: DashMap::new(),
            data_dir,
            compact_threshold,
            clock,
            rules,
        }
    }

    /// Get or lazily open the venue. Opening replays its WAL and starts its compactor.
    pub fn get_or_create(&self, name: &str) -> io::Result<Arc<Venue>> {
        if let Some(venue) = self.venues.get(name) {
            return Ok(venue.value().clone());
        }
        if name.len() > MAX_VENUE_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "venue name too long",
            ));
        }

        if self.venues.len() >= MAX_VENUES {
            return Err(io::Error::other("too many venues"));
        }

        // Keeps the WAL inside data_dir.
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty venue name",
            ));
        }

        let venue = match self.venues.entry(name.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let engine = Arc::new(Engine::new(self.data_dir.join(format!("{safe_name}.wal")))?);
                let service = ReservationService::from_engine(
                    engine.clone(),
                    self.clock.clone(),
                    self.rules,
                );
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                e.insert(Arc::new(Venue { engine, service })).clone()
            }
        };

        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.venues.len() as f64);
        info!("opened venue {safe_name}");
        Ok(venue)
    }

    pub fn venue_count(&self) -> usize {
        self.venues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatbook_test_venue").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> VenueManager {
        let now = NaiveDate::from_ymd_opt(2030, 3, 15)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        VenueManager::new(dir, 1000, Arc::new(ManualClock::new(now)), TimeRules::default())
    }

    #[tokio::test]
    async fn venue_isolation() {
        let vm = manager(test_data_dir("isolation"));

        let a = vm.get_or_create("venue_a").unwrap();
        let b = vm.get_or_create("venue_b").unwrap();

        let space = Ulid::new();
        a.engine.create_space(space, Some("Hall".into())).await.unwrap();
        b.engine.create_space(space, None).await.unwrap();

        a.engine
            .register_user(Ulid::new(), "guest@example.com".into(), None)
            .await
            .unwrap();
        assert!(b.engine.get_user_by_email("guest@example.com").is_none());
        assert_eq!(
            a.engine.get_resource_info(&space).await.unwrap().name.as_deref(),
            Some("Hall")
        );
        assert_eq!(b.engine.get_resource_info(&space).await.unwrap().name, None);
    }

    #[tokio::test]
    async fn venue_lazy_creation() {
        let dir = test_data_dir("lazy");
        let vm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _venue = vm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn same_venue_returned() {
        let vm = manager(test_data_dir("same"));

        let v1 = vm.get_or_create("foo").unwrap();
        let v2 = vm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&v1, &v2));
        assert_eq!(vm.venue_count(), 1);
    }

    #[tokio::test]
    async fn venue_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let vm = manager(dir.clone());

        let _venue = vm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(vm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn venue_name_too_long() {
        let vm = manager(test_data_dir("name_too_long"));

        let err = vm
            .get_or_create(&"x".repeat(MAX_VENUE_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("venue name too long"));
    }

    #[tokio::test]
    async fn venue_count_limit() {
        let vm = manager(test_data_dir("count_limit"));

        for i in 0..MAX_VENUES {
            vm.get_or_create(&format!("v{i}")).unwrap();
        }
        let err = vm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many venues"));
    }
}
