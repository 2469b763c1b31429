use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Coordinates, DriverStatus, Location, RideStatus, RideType};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideRequested {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub pickup_location: Location,
    pub destination_location: Location,
    pub ride_type: RideType,
    pub estimated_fare: f64,
    pub max_distance_km: f64,
    /// Overrides the configured search timeout when set.
    pub timeout_seconds: Option<u64>,
    pub correlation_id: Uuid,
    pub priority: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideStatusUpdate {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub timestamp: DateTime<Utc>,
    pub driver_id: Option<Uuid>,
    pub correlation_id: Uuid,
    pub final_fare: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverStatusUpdate {
    pub driver_id: Uuid,
    pub status: DriverStatus,
    pub ride_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverInfo {
    pub license_number: String,
    pub vehicle_class: RideType,
    pub rating: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverMatchResponse {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub accepted: bool,
    pub estimated_arrival_minutes: i32,
    pub driver_location: Option<Coordinates>,
    pub driver_info: DriverInfo,
    pub correlation_id: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    RideRequested,
    RideStatusUpdate,
    DriverStatusUpdate,
    DriverMatchResponse,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::RideRequested,
        Topic::RideStatusUpdate,
        Topic::DriverStatusUpdate,
        Topic::DriverMatchResponse,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Topic::RideRequested => "ride.requested",
            Topic::RideStatusUpdate => "ride.status",
            Topic::DriverStatusUpdate => "driver.status",
            Topic::DriverMatchResponse => "driver.match_response",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Event {
    RideRequested(RideRequested),
    RideStatusUpdate(RideStatusUpdate),
    DriverStatusUpdate(DriverStatusUpdate),
    DriverMatchResponse(DriverMatchResponse),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::RideRequested(_) => Topic::RideRequested,
            Event::RideStatusUpdate(_) => Topic::RideStatusUpdate,
            Event::DriverStatusUpdate(_) => Topic::DriverStatusUpdate,
            Event::DriverMatchResponse(_) => Topic::DriverMatchResponse,
        }
    }
}

impl From<RideRequested> for Event {
    fn from(e: RideRequested) -> Self {
        Event::RideRequested(e)
    }
}

impl From<RideStatusUpdate> for Event {
    fn from(e: RideStatusUpdate) -> Self {
        Event::RideStatusUpdate(e)
    }
}

impl From<DriverStatusUpdate> for Event {
    fn from(e: DriverStatusUpdate) -> Self {
        Event::DriverStatusUpdate(e)
    }
}

impl From<DriverMatchResponse> for Event {
    fn from(e: DriverMatchResponse) -> Self {
        Event::DriverMatchResponse(e)
    }
}

#[test]
fn events_serialize_with_their_name() {
    let event: Event = DriverStatusUpdate {
        driver_id: Uuid::nil(),
        status: DriverStatus::Busy,
        ride_id: None,
        timestamp: Utc::now(),
    }
    .into();

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["event"], "DriverStatusUpdate");
    assert_eq!(value["payload"]["status"], "BUSY");
    assert_eq!(event.topic().name(), "driver.status");
}
