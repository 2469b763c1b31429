//! In-process store for tests and `STORE=memory` runs.
//!
//! Writes apply immediately under one lock. Inside a transaction each write also pushes
//! an undo step onto the transaction, so rollback (or rollback to a savepoint) restores
//! the previous values. There is no isolation between concurrent transactions.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    current_transaction, CoordinateRepo, DriverRepo, NearbyDriver, RideRepo, SessionRepo, Store,
    Transaction, TransactionManager, TxBackend, TxOptions, UserRepo,
};
use crate::calculator;
use crate::entities::{
    Coordinates, Driver, DriverSession, DriverStatus, Location, Ride, RideEvent, RideStatus,
    RideType,
};
use crate::error::{driver_not_found, ride_not_found, Error, Result};

#[derive(Default)]
struct Tables {
    drivers: HashMap<Uuid, Driver>,
    rides: HashMap<Uuid, Ride>,
    ride_events: Vec<RideEvent>,
    counters: HashMap<NaiveDate, u32>,
    sessions: HashMap<Uuid, DriverSession>,
    last_locations: HashMap<Uuid, Location>,
    location_history: Vec<LocationRecord>,
    roles: HashMap<Uuid, BTreeSet<String>>,
}

/// One entry of the location history.
#[derive(Clone, Debug)]
pub struct LocationRecord {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub ride_id: Option<Uuid>,
    pub location: Location,
    pub recorded_at: DateTime<Utc>,
}

type Undo = Box<dyn FnOnce(&mut Tables) + Send>;

enum LogEntry {
    Savepoint(String),
    Undo(Undo),
}

#[derive(Clone, Debug, PartialEq)]
pub enum TxOp {
    Begin(TxOptions),
    Savepoint(String),
    RollbackTo(String),
    Release(String),
    Commit,
    Rollback,
}

pub struct MemoryTxBackend {
    tables: Arc<Mutex<Tables>>,
    journal: Arc<Mutex<Vec<TxOp>>>,
}

impl MemoryTxBackend {
    /// A backend with no tables behind it; only the journal is observable.
    pub fn detached() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn journal(&self) -> Vec<TxOp> {
        self.journal.lock().clone()
    }
}

#[async_trait]
impl TxBackend for MemoryTxBackend {
    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn Transaction>> {
        self.journal.lock().push(TxOp::Begin(options));

        Ok(Arc::new(MemoryTransaction {
            tables: self.tables.clone(),
            journal: self.journal.clone(),
            log: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    journal: Arc<Mutex<Vec<TxOp>>>,
    log: Mutex<Vec<LogEntry>>,
    finished: AtomicBool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Error::Unexpected("transaction already finished".into()));
        }
        Ok(())
    }

    fn push_undo(&self, undo: Undo) {
        self.log.lock().push(LogEntry::Undo(undo));
    }

    fn undo_until(&self, savepoint: Option<&str>) -> Result<()> {
        let mut log = self.log.lock();
        let mut tables = self.tables.lock();

        while let Some(entry) = log.pop() {
            match entry {
                LogEntry::Undo(undo) => undo(&mut tables),
                LogEntry::Savepoint(name) if Some(name.as_str()) == savepoint => {
                    // the savepoint survives a rollback to it
                    log.push(LogEntry::Savepoint(name));
                    return Ok(());
                }
                LogEntry::Savepoint(_) => {}
            }
        }

        match savepoint {
            Some(name) => Err(Error::Unexpected(format!("savepoint {name} does not exist"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn savepoint(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.log.lock().push(LogEntry::Savepoint(name.into()));
        self.journal.lock().push(TxOp::Savepoint(name.into()));
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.journal.lock().push(TxOp::RollbackTo(name.into()));
        self.undo_until(Some(name))
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.journal.lock().push(TxOp::Release(name.into()));
        self.log
            .lock()
            .retain(|entry| !matches!(entry, LogEntry::Savepoint(n) if n == name));
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.finished.store(true, Ordering::SeqCst);
        self.journal.lock().push(TxOp::Commit);
        self.log.lock().clear();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.finished.store(true, Ordering::SeqCst);
        self.journal.lock().push(TxOp::Rollback);
        self.undo_until(None)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Dropped without commit or rollback: undo everything, as a dropped sqlx transaction does.
impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.journal.lock().push(TxOp::Rollback);
            let _ = self.undo_until(None);
        }
    }
}

pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    backend: Arc<MemoryTxBackend>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let tables = Arc::new(Mutex::new(Tables::default()));
        let backend = Arc::new(MemoryTxBackend {
            tables: tables.clone(),
            journal: Arc::new(Mutex::new(Vec::new())),
        });

        Arc::new(Self { tables, backend })
    }

    pub fn store(self: &Arc<Self>) -> Store {
        Store {
            drivers: self.clone(),
            rides: self.clone(),
            sessions: self.clone(),
            coordinates: self.clone(),
            users: self.clone(),
            tx: TransactionManager::new(self.backend.clone()),
        }
    }

    pub fn journal(&self) -> Vec<TxOp> {
        self.backend.journal()
    }

    /// Runs `f` against the tables; the undo step it returns is attached to the
    /// current transaction, if there is one.
    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<(T, Option<Undo>)>) -> Result<T> {
        let (value, undo) = {
            let mut tables = self.tables.lock();
            f(&mut tables)?
        };

        if let (Some(undo), Some(tx)) = (undo, current_transaction()) {
            if let Some(tx) = tx.as_any().downcast_ref::<MemoryTransaction>() {
                tx.push_undo(undo);
            }
        }

        Ok(value)
    }

    /// Every recorded position of `driver_id`, oldest first.
    pub fn history(&self, driver_id: Uuid) -> Vec<LocationRecord> {
        self.read(|t| {
            t.location_history
                .iter()
                .filter(|record| record.driver_id == driver_id)
                .cloned()
                .collect()
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.lock())
    }
}

#[async_trait]
impl DriverRepo for MemoryStore {
    async fn create(&self, driver: &Driver) -> Result<()> {
        let driver = driver.clone();

        self.write(move |t| {
            if t.drivers.values().any(|d| d.license_number == driver.license_number) {
                return Err(Error::LicenseAlreadyRegistered);
            }

            let id = driver.id;
            t.drivers.insert(id, driver);
            Ok(((), Some(Box::new(move |t: &mut Tables| {
                t.drivers.remove(&id);
            }) as Undo)))
        })
    }

    async fn get(&self, id: Uuid) -> Result<Driver> {
        self.read(|t| t.drivers.get(&id).cloned())
            .ok_or_else(|| driver_not_found(&id))
    }

    async fn license_exists(&self, license_number: &str) -> Result<bool> {
        Ok(self.read(|t| t.drivers.values().any(|d| d.license_number == license_number)))
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: DriverStatus,
        new: DriverStatus,
    ) -> Result<DriverStatus> {
        self.write(|t| {
            let driver = t.drivers.get_mut(&id).ok_or_else(|| driver_not_found(&id))?;
            let previous = driver.status;

            if previous != expected {
                return Ok((previous, None));
            }

            driver.status = new;
            Ok((previous, Some(Box::new(move |t: &mut Tables| {
                if let Some(driver) = t.drivers.get_mut(&id) {
                    driver.status = previous;
                }
            }) as Undo)))
        })
    }

    async fn find_available_nearby(
        &self,
        pickup: &Coordinates,
        vehicle_class: RideType,
        max_distance_km: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>> {
        let mut nearby: Vec<NearbyDriver> = self.read(|t| {
            t.drivers
                .values()
                .filter(|d| d.status == DriverStatus::Available && d.vehicle_class == vehicle_class)
                .filter_map(|d| {
                    let location = t.last_locations.get(&d.id)?;
                    let distance_km = calculator::distance_km(&location.coordinates, pickup);

                    (distance_km <= max_distance_km).then(|| NearbyDriver {
                        driver: d.clone(),
                        location: location.clone(),
                        distance_km,
                    })
                })
                .collect()
        });

        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        nearby.truncate(limit);

        Ok(nearby)
    }

    async fn record_completed_ride(&self, id: Uuid, earnings: f64) -> Result<()> {
        self.write(|t| {
            let driver = t.drivers.get_mut(&id).ok_or_else(|| driver_not_found(&id))?;
            driver.total_rides += 1;
            driver.total_earnings += earnings;

            Ok(((), Some(Box::new(move |t: &mut Tables| {
                if let Some(driver) = t.drivers.get_mut(&id) {
                    driver.total_rides -= 1;
                    driver.total_earnings -= earnings;
                }
            }) as Undo)))
        })
    }
}

#[async_trait]
impl RideRepo for MemoryStore {
    async fn create(&self, ride: &Ride) -> Result<()> {
        let ride = ride.clone();

        self.write(move |t| {
            let id = ride.id;
            t.rides.insert(id, ride);
            Ok(((), Some(Box::new(move |t: &mut Tables| {
                t.rides.remove(&id);
            }) as Undo)))
        })
    }

    async fn get(&self, id: Uuid) -> Result<Ride> {
        self.read(|t| t.rides.get(&id).cloned())
            .ok_or_else(|| ride_not_found(&id))
    }

    async fn save_transition(&self, ride: &Ride, expected: RideStatus) -> Result<bool> {
        let ride = ride.clone();

        self.write(move |t| {
            let stored = t.rides.get_mut(&ride.id).ok_or_else(|| ride_not_found(&ride.id))?;

            if stored.status != expected {
                return Ok((false, None));
            }

            let previous = std::mem::replace(stored, ride);
            Ok((true, Some(Box::new(move |t: &mut Tables| {
                t.rides.insert(previous.id, previous);
            }) as Undo)))
        })
    }

    async fn append_event(&self, event: &RideEvent) -> Result<()> {
        let event = event.clone();

        self.write(move |t| {
            let id = event.id;
            t.ride_events.push(event);
            Ok(((), Some(Box::new(move |t: &mut Tables| {
                t.ride_events.retain(|e| e.id != id);
            }) as Undo)))
        })
    }

    async fn events(&self, ride_id: Uuid) -> Result<Vec<RideEvent>> {
        Ok(self.read(|t| {
            t.ride_events
                .iter()
                .filter(|e| e.ride_id == ride_id)
                .cloned()
                .collect()
        }))
    }

    async fn next_daily_sequence(&self, date: NaiveDate) -> Result<u32> {
        self.write(|t| {
            let counter = t.counters.entry(date).or_insert(0);
            *counter += 1;
            Ok((*counter, None))
        })
    }

    async fn find_active_for_driver(&self, driver_id: Uuid) -> Result<Option<Ride>> {
        Ok(self.read(|t| {
            t.rides
                .values()
                .find(|r| r.driver_id == Some(driver_id) && r.status.is_active())
                .cloned()
        }))
    }
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn create(&self, session: &DriverSession) -> Result<()> {
        let session = session.clone();

        self.write(move |t| {
            let id = session.id;
            t.sessions.insert(id, session);
            Ok(((), Some(Box::new(move |t: &mut Tables| {
                t.sessions.remove(&id);
            }) as Undo)))
        })
    }

    async fn find_open(&self, driver_id: Uuid) -> Result<Option<DriverSession>> {
        Ok(self.read(|t| {
            t.sessions
                .values()
                .find(|s| s.driver_id == driver_id && s.is_open())
                .cloned()
        }))
    }

    async fn add_ride(&self, session_id: Uuid, earnings: f64) -> Result<()> {
        self.write(|t| {
            let session = t
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            session.total_rides += 1;
            session.total_earnings += earnings;

            Ok(((), Some(Box::new(move |t: &mut Tables| {
                if let Some(session) = t.sessions.get_mut(&session_id) {
                    session.total_rides -= 1;
                    session.total_earnings -= earnings;
                }
            }) as Undo)))
        })
    }

    async fn close(&self, session_id: Uuid, ended_at: DateTime<Utc>) -> Result<DriverSession> {
        self.write(|t| {
            let session = t
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            let previous = session.ended_at;
            session.ended_at = Some(ended_at);

            Ok((session.clone(), Some(Box::new(move |t: &mut Tables| {
                if let Some(session) = t.sessions.get_mut(&session_id) {
                    session.ended_at = previous;
                }
            }) as Undo)))
        })
    }
}

#[async_trait]
impl CoordinateRepo for MemoryStore {
    async fn record(&self, driver_id: Uuid, location: &Location, ride_id: Option<Uuid>) -> Result<()> {
        let location = location.clone();

        self.write(move |t| {
            let previous = t.last_locations.insert(driver_id, location.clone());
            let id = Uuid::new_v4();
            t.location_history.push(LocationRecord {
                id,
                driver_id,
                ride_id,
                location,
                recorded_at: Utc::now(),
            });

            Ok(((), Some(Box::new(move |t: &mut Tables| {
                t.location_history.retain(|record| record.id != id);
                match previous {
                    Some(previous) => t.last_locations.insert(driver_id, previous),
                    None => t.last_locations.remove(&driver_id),
                };
            }) as Undo)))
        })
    }

    async fn last_known(&self, driver_id: Uuid) -> Result<Location> {
        self.read(|t| t.last_locations.get(&driver_id).cloned())
            .ok_or_else(|| Error::not_found("coordinate", driver_id))
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn assign_role(&self, user_id: Uuid, role: &str) -> Result<()> {
        let role = role.to_string();

        self.write(move |t| {
            let inserted = t.roles.entry(user_id).or_default().insert(role.clone());
            let undo = inserted.then(|| {
                Box::new(move |t: &mut Tables| {
                    if let Some(roles) = t.roles.get_mut(&user_id) {
                        roles.remove(&role);
                    }
                }) as Undo
            });

            Ok(((), undo))
        })
    }

    async fn roles(&self, user_id: Uuid) -> Result<Vec<String>> {
        Ok(self.read(|t| {
            t.roles
                .get(&user_id)
                .map(|roles| roles.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }
}

#[cfg(test)]
fn test_driver(status: DriverStatus) -> Driver {
    let mut driver = Driver::new(Uuid::new_v4(), "AB123456".into(), RideType::Economy);
    driver.status = status;
    driver
}

#[tokio::test]
async fn compare_and_set_reports_previous_status() {
    let store = MemoryStore::new();
    let driver = test_driver(DriverStatus::Available);
    DriverRepo::create(store.as_ref(), &driver).await.unwrap();

    let previous = store
        .compare_and_set_status(driver.id, DriverStatus::Available, DriverStatus::Busy)
        .await
        .unwrap();
    assert_eq!(previous, DriverStatus::Available);

    let previous = store
        .compare_and_set_status(driver.id, DriverStatus::Available, DriverStatus::Busy)
        .await
        .unwrap();
    assert_eq!(previous, DriverStatus::Busy);

    let err = store
        .compare_and_set_status(Uuid::new_v4(), DriverStatus::Available, DriverStatus::Busy)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn concurrent_reservations_have_exactly_one_winner() {
    let store = MemoryStore::new();
    let driver = test_driver(DriverStatus::Available);
    DriverRepo::create(store.as_ref(), &driver).await.unwrap();

    let attempts = (0..8).map(|_| {
        let store = store.clone();
        let id = driver.id;
        tokio::spawn(async move {
            store
                .compare_and_set_status(id, DriverStatus::Available, DriverStatus::Busy)
                .await
                .unwrap()
        })
    });

    let results = futures::future::join_all(attempts).await;
    let winners = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|previous| *previous == DriverStatus::Available)
        .count();

    assert_eq!(winners, 1);
}

#[tokio::test]
async fn rollback_restores_previous_values() {
    let memory = MemoryStore::new();
    let store = memory.store();
    let driver = test_driver(DriverStatus::Available);
    store.drivers.create(&driver).await.unwrap();

    let result: Result<()> = store
        .tx
        .run(|| async {
            store
                .drivers
                .compare_and_set_status(driver.id, DriverStatus::Available, DriverStatus::Busy)
                .await?;
            store.users.assign_role(driver.id, "driver").await?;
            Err(Error::Cancelled)
        })
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(
        store.drivers.get(driver.id).await.unwrap().status,
        DriverStatus::Available
    );
    assert!(store.users.roles(driver.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn savepoint_rollback_keeps_outer_writes() {
    let memory = MemoryStore::new();
    let store = memory.store();
    let driver = test_driver(DriverStatus::Offline);
    store.drivers.create(&driver).await.unwrap();

    store
        .tx
        .run(|| async {
            store.users.assign_role(driver.id, "driver").await?;

            let inner: Result<()> = store
                .tx
                .run(|| async {
                    store
                        .drivers
                        .compare_and_set_status(driver.id, DriverStatus::Offline, DriverStatus::Available)
                        .await?;
                    Err(Error::DriverAlreadyOnline)
                })
                .await;
            assert!(inner.is_err());

            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(store.users.roles(driver.id).await.unwrap(), vec!["driver".to_string()]);
    assert_eq!(
        store.drivers.get(driver.id).await.unwrap().status,
        DriverStatus::Offline
    );
}

#[tokio::test]
async fn nearby_drivers_are_ordered_by_distance() {
    let memory = MemoryStore::new();
    let store = memory.store();
    let pickup = Coordinates {
        latitude: 43.222,
        longitude: 76.851,
    };

    let far = test_driver(DriverStatus::Available);
    let mut near = test_driver(DriverStatus::Available);
    near.license_number = "CD654321".into();
    let mut busy = test_driver(DriverStatus::Busy);
    busy.license_number = "EF111111".into();

    for (driver, location) in [
        (&far, Location::new(43.240, 76.851)),
        (&near, Location::new(43.223, 76.851)),
        (&busy, Location::new(43.222, 76.851)),
    ] {
        store.drivers.create(driver).await.unwrap();
        store.coordinates.record(driver.id, &location, None).await.unwrap();
    }

    let nearby = store
        .drivers
        .find_available_nearby(&pickup, RideType::Economy, 5.0, 10)
        .await
        .unwrap();

    let ids: Vec<Uuid> = nearby.iter().map(|n| n.driver.id).collect();
    assert_eq!(ids, vec![near.id, far.id]);
    assert!(nearby[0].distance_km < nearby[1].distance_km);

    let none = store
        .drivers
        .find_available_nearby(&pickup, RideType::Business, 5.0, 10)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn rolled_back_location_leaves_other_drivers_history_alone() {
    let memory = MemoryStore::new();
    let store = memory.store();
    let (ours, theirs) = (Uuid::new_v4(), Uuid::new_v4());

    let result: Result<()> = store
        .tx
        .run(|| async {
            store
                .coordinates
                .record(ours, &Location::new(43.22, 76.85), None)
                .await?;

            // lands outside this transaction, after our write
            let other = memory.clone();
            tokio::spawn(async move {
                CoordinateRepo::record(other.as_ref(), theirs, &Location::new(43.30, 76.90), None)
                    .await
            })
            .await
            .unwrap()?;

            Err(Error::Cancelled)
        })
        .await;

    assert!(result.is_err());
    assert!(memory.history(ours).is_empty());
    assert_eq!(memory.history(theirs).len(), 1);
    assert_eq!(
        store.coordinates.last_known(theirs).await.unwrap().coordinates.latitude,
        43.30
    );
}
