use chrono::{DateTime, NaiveDate, Utc};
use oso::PolarClass;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::calculator;
use crate::entities::Location;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideType {
    Economy,
    Comfort,
    Business,
}

impl RideType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Economy => "ECONOMY",
            Self::Comfort => "COMFORT",
            Self::Business => "BUSINESS",
        }
    }
}

impl FromStr for RideType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECONOMY" => Ok(Self::Economy),
            "COMFORT" => Ok(Self::Comfort),
            "BUSINESS" => Ok(Self::Business),
            _ => Err(Error::InvalidInput),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Requested,
    Matched,
    EnRoute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Matched => "MATCHED",
            Self::EnRoute => "EN_ROUTE",
            Self::Arrived => "ARRIVED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// A driver is attached and the ride is not over yet.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Matched | Self::EnRoute | Self::Arrived | Self::InProgress
        )
    }

    /// The ride state machine. Every legal move is listed here; anything else is rejected.
    pub fn on(&self, transition: &Transition) -> Option<Status> {
        use Transition::*;

        match (self, transition) {
            (Self::Requested, Match { .. }) => Some(Self::Matched),
            (Self::Matched, DepartToPickup) => Some(Self::EnRoute),
            (Self::EnRoute, ArriveAtPickup) => Some(Self::Arrived),
            (Self::Arrived, StartTrip) => Some(Self::InProgress),
            (Self::InProgress, CompleteTrip { .. }) => Some(Self::Completed),
            (Self::Requested | Self::Matched, Cancel { .. }) => Some(Self::Cancelled),
            _ => None,
        }
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
            "REQUESTED" => Ok(Self::Requested),
            "MATCHED" => Ok(Self::Matched),
            "EN_ROUTE" => Ok(Self::EnRoute),
            "ARRIVED" => Ok(Self::Arrived),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(Error::Unexpected(format!("unknown ride status {s}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Transition {
    Match { driver_id: Uuid },
    DepartToPickup,
    ArriveAtPickup,
    StartTrip,
    CompleteTrip { final_fare: f64 },
    Cancel { reason: Option<String> },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Match { .. } => "driver_matched",
            Self::DepartToPickup => "driver_en_route",
            Self::ArriveAtPickup => "driver_arrived",
            Self::StartTrip => "ride_started",
            Self::CompleteTrip { .. } => "ride_completed",
            Self::Cancel { .. } => "ride_cancelled",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub number: String,
    pub status: Status,
    pub ride_type: RideType,
    pub passenger_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup: Location,
    pub destination: Location,
    pub estimated_fare: f64,
    pub estimated_duration_minutes: i32,
    pub estimated_distance_km: f64,
    pub priority: i32,
    pub final_fare: Option<f64>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Ride {
    pub fn new(
        number: String,
        passenger_id: Uuid,
        ride_type: RideType,
        pickup: Location,
        destination: Location,
    ) -> Self {
        let created_at = Utc::now();
        let distance = calculator::distance_km(&pickup.coordinates, &destination.coordinates);
        let duration = calculator::duration_minutes(distance);

        Self {
            id: Uuid::new_v4(),
            number,
            status: Status::Requested,
            ride_type,
            passenger_id,
            driver_id: None,
            pickup,
            destination,
            estimated_fare: calculator::fare(ride_type, distance, duration),
            estimated_duration_minutes: duration,
            estimated_distance_km: distance,
            priority: calculator::priority(ride_type, distance, &created_at),
            final_fare: None,
            cancellation_reason: None,
            created_at,
            matched_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    pub fn is_passenger(&self, user_id: Uuid) -> bool {
        self.passenger_id == user_id
    }

    pub fn is_driver(&self, user_id: Uuid) -> bool {
        self.driver_id == Some(user_id)
    }

    /// Moves the ride along the state machine and stamps the matching timestamp column.
    /// Returns the status the ride was in before. A rejected transition leaves the ride untouched.
    pub(crate) fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) -> Result<Status, Error> {
        let previous = self.status;
        let next = previous.on(transition).ok_or_else(|| match transition {
            Transition::Cancel { .. } => Error::RideCannotBeCancelled,
            _ => Error::InvalidRideTransition {
                status: previous.to_string(),
                event: transition.name().into(),
            },
        })?;

        match transition {
            Transition::Match { driver_id } => {
                self.driver_id = Some(*driver_id);
                self.matched_at = Some(at);
            }
            Transition::DepartToPickup => {}
            Transition::ArriveAtPickup => self.arrived_at = Some(at),
            Transition::StartTrip => self.started_at = Some(at),
            Transition::CompleteTrip { final_fare } => {
                self.final_fare = Some(*final_fare);
                self.completed_at = Some(at);
            }
            Transition::Cancel { reason } => {
                self.cancellation_reason = reason.clone();
                self.cancelled_at = Some(at);
            }
        }

        self.status = next;
        Ok(previous)
    }
}

impl PolarClass for Ride {
    fn get_polar_class_builder() -> oso::ClassBuilder<Ride> {
        oso::Class::builder()
            .name("Ride")
            .add_attribute_getter("id", |recv: &Ride| recv.id)
            .add_attribute_getter("status", |recv: &Ride| recv.status.name().to_string())
            .add_method("is_passenger", Ride::is_passenger)
            .add_method("is_driver", Ride::is_driver)
    }

    fn get_polar_class() -> oso::Class {
        let builder = Ride::get_polar_class_builder();
        builder.build()
    }
}

/// Immutable audit record appended on every successful transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideEvent {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub event_type: String,
    pub from_status: Option<Status>,
    pub to_status: Status,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl RideEvent {
    pub fn new(
        ride_id: Uuid,
        event_type: impl Into<String>,
        from_status: Option<Status>,
        to_status: Status,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ride_id,
            event_type: event_type.into(),
            from_status,
            to_status,
            payload,
            created_at: Utc::now(),
        }
    }
}

pub fn ride_number(date: NaiveDate, sequence: u32) -> String {
    format!("RIDE_{}_{:03}", date.format("%Y%m%d"), sequence)
}

#[cfg(test)]
fn almaty_ride() -> Ride {
    Ride::new(
        ride_number(Utc::now().date_naive(), 1),
        Uuid::new_v4(),
        RideType::Economy,
        Location::new(43.222, 76.851),
        Location::new(43.238, 76.889),
    )
}

#[test]
fn new_ride_is_requested_with_estimates() {
    let ride = almaty_ride();

    assert_eq!(ride.status, Status::Requested);
    assert!(ride.estimated_distance_km > 0.0);
    assert!(ride.estimated_duration_minutes > 0);
    assert!(ride.estimated_fare > calculator::tariff(RideType::Economy).base);
    assert!(ride.driver_id.is_none());
}

#[test]
fn ride_number_format() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();

    assert_eq!(ride_number(date, 1), "RIDE_20240307_001");
    assert_eq!(ride_number(date, 42), "RIDE_20240307_042");
    assert_eq!(ride_number(date, 1234), "RIDE_20240307_1234");
}

#[test]
fn happy_path_walks_every_state_once() {
    let mut ride = almaty_ride();
    let driver_id = Uuid::new_v4();
    let now = Utc::now();

    let path = [
        (Transition::Match { driver_id }, Status::Matched),
        (Transition::DepartToPickup, Status::EnRoute),
        (Transition::ArriveAtPickup, Status::Arrived),
        (Transition::StartTrip, Status::InProgress),
        (Transition::CompleteTrip { final_fare: 1500.0 }, Status::Completed),
    ];

    for (transition, expected) in path.iter() {
        ride.apply(transition, now).unwrap();
        assert_eq!(ride.status, *expected);
    }

    assert_eq!(ride.driver_id, Some(driver_id));
    assert_eq!(ride.final_fare, Some(1500.0));
    assert!(ride.matched_at.is_some());
    assert!(ride.arrived_at.is_some());
    assert!(ride.started_at.is_some());
    assert!(ride.completed_at.is_some());
    assert!(ride.status.is_terminal());
}

#[test]
fn transitions_cannot_be_skipped_or_repeated() {
    let mut ride = almaty_ride();
    let now = Utc::now();

    let err = ride.apply(&Transition::StartTrip, now).unwrap_err();
    assert!(matches!(err, Error::InvalidRideTransition { .. }));
    assert_eq!(ride.status, Status::Requested);
    assert!(ride.started_at.is_none());

    ride.apply(&Transition::Match { driver_id: Uuid::new_v4() }, now)
        .unwrap();
    let err = ride
        .apply(&Transition::Match { driver_id: Uuid::new_v4() }, now)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRideTransition { .. }));
}

#[test]
fn cancellation_only_before_pickup_leg() {
    let now = Utc::now();
    let cancel = Transition::Cancel {
        reason: Some("changed plans".into()),
    };

    let mut requested = almaty_ride();
    assert_eq!(requested.apply(&cancel, now).unwrap(), Status::Requested);
    assert_eq!(requested.status, Status::Cancelled);
    assert_eq!(requested.cancellation_reason.as_deref(), Some("changed plans"));

    let mut matched = almaty_ride();
    matched
        .apply(&Transition::Match { driver_id: Uuid::new_v4() }, now)
        .unwrap();
    assert_eq!(matched.apply(&cancel, now).unwrap(), Status::Matched);

    let mut en_route = matched.clone();
    en_route.status = Status::EnRoute;
    assert!(matches!(
        en_route.apply(&cancel, now),
        Err(Error::RideCannotBeCancelled)
    ));

    let mut completed = almaty_ride();
    completed.status = Status::Completed;
    assert!(matches!(
        completed.apply(&cancel, now),
        Err(Error::RideCannotBeCancelled)
    ));
    assert!(completed.cancelled_at.is_none());
}
