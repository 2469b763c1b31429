use super::Engine;

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::DriverAPI,
    auth::{Platform, User, DRIVER_ROLE, SYSTEM_ROLE},
    broker::{DriverStatusUpdate, RideStatusUpdate},
    calculator,
    entities::{Driver, DriverSession, DriverStatus, Location, Ride, RideStatus, RideType, Transition},
    error::{Error, ErrorContext, Result},
};

static LICENSE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}\d{6}$").expect("license pattern is valid"));

impl Engine {
    /// The ride's driver, provided `user` is that driver (or a system user) and may
    /// perform `action` on the ride.
    fn assigned_driver(&self, user: &User, ride: &Ride, action: &str) -> Result<Uuid> {
        let driver_id = ride.driver_id.ok_or(Error::DriverRideMismatch)?;

        if driver_id != user.id && !user.has_role(SYSTEM_ROLE.into()) {
            return Err(Error::DriverRideMismatch);
        }

        self.authorize(user.clone(), action.to_string(), ride.clone())?;

        Ok(driver_id)
    }

    async fn publish_statuses(
        &self,
        ride: &Ride,
        driver_id: Uuid,
        driver_status: DriverStatus,
    ) -> Result<()> {
        let now = Utc::now();

        self.publish(RideStatusUpdate {
            ride_id: ride.id,
            status: ride.status,
            timestamp: now,
            driver_id: Some(driver_id),
            correlation_id: Uuid::new_v4(),
            final_fare: ride.final_fare,
        })
        .await
        .context(|| format!("publish status of ride {}", ride.id))?;

        let ride_id = (!ride.status.is_terminal()).then(|| ride.id);
        self.publish(DriverStatusUpdate {
            driver_id,
            status: driver_status,
            ride_id,
            timestamp: now,
        })
        .await
        .context(|| format!("publish status of driver {driver_id}"))
    }
}

#[async_trait]
impl DriverAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn register_driver(
        &self,
        user: User,
        license_number: String,
        vehicle_class: RideType,
    ) -> Result<Driver, Error> {
        if !LICENSE_PATTERN.is_match(&license_number) {
            return Err(Error::InvalidLicenseFormat);
        }

        self.authorize(user.clone(), "register_driver", Platform::default())?;

        let driver = self
            .store
            .tx
            .run(|| async {
                if self.store.drivers.license_exists(&license_number).await? {
                    return Err(Error::LicenseAlreadyRegistered);
                }
                if self.store.drivers.get(user.id).await.is_ok() {
                    tracing::info!("user already has a driver record");
                    return Err(Error::InvalidInput);
                }

                let driver = Driver::new(user.id, license_number.clone(), vehicle_class);
                self.store.drivers.create(&driver).await?;
                self.store.users.assign_role(user.id, DRIVER_ROLE).await?;

                Ok(driver)
            })
            .await
            .context(|| format!("register driver {}", user.id))?;

        tracing::info!(driver_id = %driver.id, "driver registered");

        Ok(driver)
    }

    #[tracing::instrument(skip(self))]
    async fn find_driver(&self, user: User, id: Uuid) -> Result<Driver, Error> {
        let driver = self
            .store
            .drivers
            .get(id)
            .await
            .context(|| format!("load driver {id}"))?;

        self.authorize(user, "read", driver.clone())?;

        Ok(driver)
    }

    #[tracing::instrument(skip(self, location))]
    async fn go_online(
        &self,
        user: User,
        id: Uuid,
        location: Option<Location>,
    ) -> Result<DriverSession, Error> {
        if matches!(&location, Some(location) if !location.coordinates.is_valid()) {
            return Err(Error::InvalidInput);
        }

        let driver = self
            .store
            .drivers
            .get(id)
            .await
            .context(|| format!("load driver {id}"))?;

        self.authorize(user, "go_online", driver)?;

        let session = self
            .store
            .tx
            .run(|| async {
                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(id, DriverStatus::Offline, DriverStatus::Available)
                    .await?;
                if previous != DriverStatus::Offline {
                    return Err(Error::DriverAlreadyOnline);
                }

                if let Some(stale) = self.store.sessions.find_open(id).await? {
                    tracing::warn!(session_id = %stale.id, "closing session left open");
                    self.store.sessions.close(stale.id, Utc::now()).await?;
                }

                let session = DriverSession::open(id);
                self.store.sessions.create(&session).await?;

                if let Some(location) = &location {
                    self.store.coordinates.record(id, location, None).await?;
                }

                Ok(session)
            })
            .await
            .context(|| format!("bring driver {id} online"))?;

        tracing::info!(session_id = %session.id, "driver online");

        self.publish(DriverStatusUpdate {
            driver_id: id,
            status: DriverStatus::Available,
            ride_id: None,
            timestamp: session.started_at,
        })
        .await
        .context(|| format!("publish status of driver {id}"))?;

        Ok(session)
    }

    #[tracing::instrument(skip(self))]
    async fn go_offline(&self, user: User, id: Uuid) -> Result<DriverSession, Error> {
        let driver = self
            .store
            .drivers
            .get(id)
            .await
            .context(|| format!("load driver {id}"))?;

        self.authorize(user, "go_offline", driver)?;

        let session = self
            .store
            .tx
            .run(|| async {
                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(id, DriverStatus::Available, DriverStatus::Offline)
                    .await?;
                match previous {
                    DriverStatus::Available => {}
                    DriverStatus::Offline => return Err(Error::DriverAlreadyOffline),
                    _ => return Err(Error::DriverNotAvailable),
                }

                let session = self
                    .store
                    .sessions
                    .find_open(id)
                    .await?
                    .ok_or_else(|| Error::not_found("session", id))?;

                self.store.sessions.close(session.id, Utc::now()).await
            })
            .await
            .context(|| format!("take driver {id} offline"))?;

        tracing::info!(
            session_id = %session.id,
            rides = session.total_rides,
            earnings = session.total_earnings,
            minutes = session.online_minutes(),
            "driver offline"
        );

        self.publish(DriverStatusUpdate {
            driver_id: id,
            status: DriverStatus::Offline,
            ride_id: None,
            timestamp: Utc::now(),
        })
        .await
        .context(|| format!("publish status of driver {id}"))?;

        Ok(session)
    }

    #[tracing::instrument(skip(self, location))]
    async fn update_location(
        &self,
        user: User,
        driver_id: Uuid,
        location: Location,
    ) -> Result<(), Error> {
        if !location.coordinates.is_valid() {
            return Err(Error::InvalidInput);
        }

        let driver = self
            .store
            .drivers
            .get(driver_id)
            .await
            .context(|| format!("load driver {driver_id}"))?;

        self.authorize(user, "update_location", driver)?;

        let ride = self
            .store
            .rides
            .find_active_for_driver(driver_id)
            .await
            .context(|| format!("find active ride of driver {driver_id}"))?;

        self.store
            .coordinates
            .record(driver_id, &location, ride.map(|ride| ride.id))
            .await
            .context(|| format!("record location of driver {driver_id}"))
    }

    #[tracing::instrument(skip(self))]
    async fn confirm_en_route(&self, user: User, ride_id: Uuid) -> Result<Ride, Error> {
        let ride = self
            .store
            .rides
            .get(ride_id)
            .await
            .context(|| format!("load ride {ride_id}"))?;
        let driver_id = self.assigned_driver(&user, &ride, "depart")?;

        let ride = self
            .lifecycle
            .depart(ride_id, driver_id, json!({ "confirmed_by": user.id }))
            .await?;

        self.publish_statuses(&ride, driver_id, DriverStatus::EnRoute)
            .await?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn start_ride(&self, user: User, ride_id: Uuid) -> Result<Ride, Error> {
        let ride = self
            .store
            .rides
            .get(ride_id)
            .await
            .context(|| format!("load ride {ride_id}"))?;
        let driver_id = self.assigned_driver(&user, &ride, "start")?;

        let transition = Transition::StartTrip;
        let ride = self
            .store
            .tx
            .run(|| async {
                let (ride, _) = self
                    .lifecycle
                    .transition(ride_id, transition.clone(), json!({ "started_by": user.id }))
                    .await?;

                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(driver_id, DriverStatus::Arrived, DriverStatus::Busy)
                    .await?;
                if previous != DriverStatus::Arrived {
                    tracing::warn!(%driver_id, %previous, "driver status out of step with ride");
                }

                Ok(ride)
            })
            .await
            .context(|| format!("start ride {ride_id}"))?;

        self.lifecycle.announce(&ride, &transition).await;
        self.lifecycle.track(&ride);
        self.publish_statuses(&ride, driver_id, DriverStatus::Busy)
            .await?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn complete_ride(&self, user: User, ride_id: Uuid) -> Result<Ride, Error> {
        let ride = self
            .store
            .rides
            .get(ride_id)
            .await
            .context(|| format!("load ride {ride_id}"))?;
        let driver_id = self.assigned_driver(&user, &ride, "complete")?;

        if ride.status != RideStatus::InProgress {
            return Err(Error::InvalidRideTransition {
                status: ride.status.to_string(),
                event: "ride_completed".into(),
            });
        }

        // billed by whole minutes, at least one
        let started_at = ride.started_at.unwrap_or(ride.created_at);
        let seconds = (Utc::now() - started_at).num_seconds().max(0);
        let minutes = ((seconds + 59) / 60).max(1) as i32;
        let final_fare = calculator::fare(ride.ride_type, ride.estimated_distance_km, minutes);
        let earnings = calculator::driver_earnings(final_fare, self.dispatch.earnings_share);

        let transition = Transition::CompleteTrip { final_fare };
        let ride = self
            .store
            .tx
            .run(|| async {
                let (ride, _) = self
                    .lifecycle
                    .transition(
                        ride_id,
                        transition.clone(),
                        json!({ "completed_by": user.id, "minutes": minutes }),
                    )
                    .await?;

                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(driver_id, DriverStatus::Busy, DriverStatus::Available)
                    .await?;
                if previous != DriverStatus::Busy {
                    tracing::warn!(%driver_id, %previous, "driver status out of step with ride");
                }

                self.store
                    .drivers
                    .record_completed_ride(driver_id, earnings)
                    .await?;
                if let Some(session) = self.store.sessions.find_open(driver_id).await? {
                    self.store.sessions.add_ride(session.id, earnings).await?;
                }

                Ok(ride)
            })
            .await
            .context(|| format!("complete ride {ride_id}"))?;

        tracing::info!(final_fare, earnings, minutes, "ride completed");

        self.lifecycle.announce(&ride, &transition).await;
        self.publish_statuses(&ride, driver_id, DriverStatus::Available)
            .await?;

        Ok(ride)
    }
}
