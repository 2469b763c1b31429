use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::User;
use crate::entities::{Driver, DriverSession, Location, Ride, RideEvent, RideType};
use crate::error::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRide {
    pub pickup: Location,
    pub destination: Location,
    pub ride_type: RideType,
}

#[async_trait]
pub trait RideAPI {
    async fn create_ride(&self, user: User, request: NewRide) -> Result<Ride, Error>;

    async fn find_ride(&self, user: User, id: Uuid) -> Result<Ride, Error>;

    async fn ride_events(&self, user: User, id: Uuid) -> Result<Vec<RideEvent>, Error>;

    async fn cancel_ride(&self, user: User, id: Uuid, reason: Option<String>)
        -> Result<Ride, Error>;
}

#[async_trait]
pub trait DriverAPI {
    async fn register_driver(
        &self,
        user: User,
        license_number: String,
        vehicle_class: RideType,
    ) -> Result<Driver, Error>;

    async fn find_driver(&self, user: User, id: Uuid) -> Result<Driver, Error>;

    /// Opens a shift. A starting location makes the driver visible to dispatch at once.
    async fn go_online(
        &self,
        user: User,
        id: Uuid,
        location: Option<Location>,
    ) -> Result<DriverSession, Error>;

    /// Closes the shift and returns its totals.
    async fn go_offline(&self, user: User, id: Uuid) -> Result<DriverSession, Error>;

    async fn update_location(
        &self,
        user: User,
        driver_id: Uuid,
        location: Location,
    ) -> Result<(), Error>;

    async fn confirm_en_route(&self, user: User, ride_id: Uuid) -> Result<Ride, Error>;

    async fn start_ride(&self, user: User, ride_id: Uuid) -> Result<Ride, Error>;

    async fn complete_ride(&self, user: User, ride_id: Uuid) -> Result<Ride, Error>;
}

pub trait API: RideAPI + DriverAPI {}
