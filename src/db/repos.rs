use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::entities::{
    Coordinates, Driver, DriverSession, DriverStatus, Location, Ride, RideEvent, RideStatus,
    RideType,
};
use crate::error::Result;

#[derive(Clone, Debug)]
pub struct NearbyDriver {
    pub driver: Driver,
    pub location: Location,
    pub distance_km: f64,
}

#[async_trait]
pub trait DriverRepo: Send + Sync {
    async fn create(&self, driver: &Driver) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Driver>;

    async fn license_exists(&self, license_number: &str) -> Result<bool>;

    /// Sets `new` only if the stored status is `expected`, in a single atomic step.
    /// Always returns the status observed before the write; the swap happened iff it
    /// equals `expected`.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: DriverStatus,
        new: DriverStatus,
    ) -> Result<DriverStatus>;

    /// AVAILABLE drivers of the given class with a last-known location within
    /// `max_distance_km` of `pickup`, nearest first.
    async fn find_available_nearby(
        &self,
        pickup: &Coordinates,
        vehicle_class: RideType,
        max_distance_km: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>>;

    async fn record_completed_ride(&self, id: Uuid, earnings: f64) -> Result<()>;
}

#[async_trait]
pub trait RideRepo: Send + Sync {
    async fn create(&self, ride: &Ride) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Ride>;

    /// Persists the ride's status, driver, fares and per-transition timestamps, but only
    /// while the stored status still equals `expected`. Returns whether the row was written.
    async fn save_transition(&self, ride: &Ride, expected: RideStatus) -> Result<bool>;

    async fn append_event(&self, event: &RideEvent) -> Result<()>;

    async fn events(&self, ride_id: Uuid) -> Result<Vec<RideEvent>>;

    /// Increments and returns the ride counter for `date`, starting at 1.
    async fn next_daily_sequence(&self, date: NaiveDate) -> Result<u32>;

    async fn find_active_for_driver(&self, driver_id: Uuid) -> Result<Option<Ride>>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create(&self, session: &DriverSession) -> Result<()>;

    async fn find_open(&self, driver_id: Uuid) -> Result<Option<DriverSession>>;

    async fn add_ride(&self, session_id: Uuid, earnings: f64) -> Result<()>;

    /// Ends the session and returns its final totals.
    async fn close(&self, session_id: Uuid, ended_at: DateTime<Utc>) -> Result<DriverSession>;
}

#[async_trait]
pub trait CoordinateRepo: Send + Sync {
    /// Appends to the location history and replaces the last-known location.
    async fn record(&self, driver_id: Uuid, location: &Location, ride_id: Option<Uuid>) -> Result<()>;

    async fn last_known(&self, driver_id: Uuid) -> Result<Location>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn assign_role(&self, user_id: Uuid, role: &str) -> Result<()>;

    async fn roles(&self, user_id: Uuid) -> Result<Vec<String>>;
}
