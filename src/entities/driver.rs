use chrono::{DateTime, Utc};
use oso::PolarClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::entities::RideType;
use crate::error::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub license_number: String,
    pub vehicle_class: RideType,
    pub status: Status,
    pub rating: f64,
    pub total_rides: i64,
    pub total_earnings: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Offline,
    Available,
    Busy,
    EnRoute,
    Arrived,
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Available => "AVAILABLE",
            Self::Busy => "BUSY",
            Self::EnRoute => "EN_ROUTE",
            Self::Arrived => "ARRIVED",
        }
    }

    /// On a ride in any phase.
    pub fn is_engaged(&self) -> bool {
        matches!(self, Self::Busy | Self::EnRoute | Self::Arrived)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(Self::Offline),
            "AVAILABLE" => Ok(Self::Available),
            "BUSY" => Ok(Self::Busy),
            "EN_ROUTE" => Ok(Self::EnRoute),
            "ARRIVED" => Ok(Self::Arrived),
            _ => Err(Error::Unexpected(format!("unknown driver status {s}"))),
        }
    }
}

impl Driver {
    pub fn new(user_id: Uuid, license_number: String, vehicle_class: RideType) -> Self {
        Self {
            id: user_id,
            license_number,
            vehicle_class,
            status: Status::Offline,
            rating: 5.0,
            total_rides: 0,
            total_earnings: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == Status::Available
    }
}

impl PolarClass for Driver {
    fn get_polar_class_builder() -> oso::ClassBuilder<Driver> {
        oso::Class::builder()
            .name("Driver")
            .add_attribute_getter("id", |recv: &Driver| recv.id)
    }

    fn get_polar_class() -> oso::Class {
        let builder = Driver::get_polar_class_builder();
        builder.build()
    }
}

/// One online shift. A driver has at most one open session at a time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverSession {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_rides: i64,
    pub total_earnings: f64,
}

impl DriverSession {
    pub fn open(driver_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver_id,
            started_at: Utc::now(),
            ended_at: None,
            total_rides: 0,
            total_earnings: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn online_minutes(&self) -> i64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_minutes()
    }
}

#[test]
fn driver_status_round_trips_through_its_name() {
    for status in [
        Status::Offline,
        Status::Available,
        Status::Busy,
        Status::EnRoute,
        Status::Arrived,
    ] {
        assert_eq!(status.name().parse::<Status>().unwrap(), status);
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            serde_json::json!(status.name())
        );
    }

    assert!("IDLE".parse::<Status>().is_err());
}

#[test]
fn new_driver_starts_offline() {
    let driver = Driver::new(Uuid::new_v4(), "AB123456".into(), RideType::Comfort);

    assert_eq!(driver.status, Status::Offline);
    assert!(!driver.is_available());
    assert!(!driver.status.is_engaged());
}
