use super::Engine;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::{NewRide, RideAPI},
    auth::{Platform, User},
    broker::{DriverStatusUpdate, RideRequested, RideStatusUpdate},
    entities::{ride_number, DriverStatus, Location, Ride, RideEvent, RideStatus, Transition},
    error::{Error, ErrorContext},
};

impl Engine {
    /// Fills in a missing address from the geocoder. Failures only cost the address.
    async fn fill_address(&self, location: &mut Location) {
        if location.address.is_some() {
            return;
        }

        let geocoder = match &self.geocoder {
            Some(geocoder) => geocoder,
            None => return,
        };

        match geocoder.reverse_geocode(location.coordinates).await {
            Ok(address) => location.address = address,
            Err(err) => tracing::warn!(error = %err, "reverse geocoding failed"),
        }
    }
}

#[async_trait]
impl RideAPI for Engine {
    #[tracing::instrument(skip(self, request), fields(user_id = %user.id, ride_type = request.ride_type.name()))]
    async fn create_ride(&self, user: User, request: NewRide) -> Result<Ride, Error> {
        let NewRide {
            mut pickup,
            mut destination,
            ride_type,
        } = request;

        if !pickup.coordinates.is_valid() || !destination.coordinates.is_valid() {
            return Err(Error::InvalidInput);
        }

        self.authorize(user.clone(), "create_ride", Platform::default())?;

        self.fill_address(&mut pickup).await;
        self.fill_address(&mut destination).await;

        let passenger_id = user.id;
        let ride = self
            .store
            .tx
            .run(|| async move {
                let today = Utc::now().date_naive();
                let sequence = self.store.rides.next_daily_sequence(today).await?;
                let ride = Ride::new(
                    ride_number(today, sequence),
                    passenger_id,
                    ride_type,
                    pickup,
                    destination,
                );

                self.store.rides.create(&ride).await?;
                self.store
                    .rides
                    .append_event(&RideEvent::new(
                        ride.id,
                        "ride_requested",
                        None,
                        RideStatus::Requested,
                        json!(ride),
                    ))
                    .await?;

                Ok(ride)
            })
            .await
            .context(|| format!("create ride for passenger {passenger_id}"))?;

        tracing::info!(ride_id = %ride.id, ride_number = %ride.number, fare = ride.estimated_fare, "ride requested");

        self.publish(RideRequested {
            ride_id: ride.id,
            ride_number: ride.number.clone(),
            passenger_id,
            pickup_location: ride.pickup.clone(),
            destination_location: ride.destination.clone(),
            ride_type: ride.ride_type,
            estimated_fare: ride.estimated_fare,
            max_distance_km: self.dispatch.max_distance_km,
            timeout_seconds: None,
            correlation_id: Uuid::new_v4(),
            priority: ride.priority,
        })
        .await
        .context(|| format!("publish request of ride {}", ride.id))?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn find_ride(&self, user: User, id: Uuid) -> Result<Ride, Error> {
        let ride = self
            .store
            .rides
            .get(id)
            .await
            .context(|| format!("load ride {id}"))?;

        self.authorize(user, "read", ride.clone())?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self))]
    async fn ride_events(&self, user: User, id: Uuid) -> Result<Vec<RideEvent>, Error> {
        let ride = self.find_ride(user, id).await?;

        self.store
            .tx
            .run_read_only(|| self.store.rides.events(ride.id))
            .await
            .context(|| format!("load events of ride {id}"))
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_ride(
        &self,
        user: User,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<Ride, Error> {
        let ride = self
            .store
            .rides
            .get(id)
            .await
            .context(|| format!("load ride {id}"))?;

        self.authorize(user.clone(), "cancel", ride)?;

        let transition = Transition::Cancel {
            reason: reason.clone(),
        };
        let trigger = json!({ "cancelled_by": user.id, "reason": reason });

        let (ride, freed) = self
            .store
            .tx
            .run(|| async {
                let (ride, previous) = self
                    .lifecycle
                    .transition(id, transition.clone(), trigger)
                    .await?;

                let mut freed = None;
                if let (RideStatus::Matched, Some(driver_id)) = (previous, ride.driver_id) {
                    let status = self
                        .store
                        .drivers
                        .compare_and_set_status(driver_id, DriverStatus::Busy, DriverStatus::Available)
                        .await?;

                    if status == DriverStatus::Busy {
                        freed = Some(driver_id);
                    } else {
                        tracing::warn!(%driver_id, %status, "matched driver was not BUSY");
                    }
                }

                Ok((ride, freed))
            })
            .await
            .context(|| format!("cancel ride {id}"))?;

        if self.stop_search(id) {
            tracing::info!("driver search stopped by cancellation");
        }

        self.lifecycle.announce(&ride, &transition).await;
        if let Some(driver_id) = ride.driver_id {
            self.lifecycle.stop_tracking(ride.id, driver_id);
            let message = json!({
                "type": "ride_cancelled",
                "ride_id": ride.id,
                "reason": ride.cancellation_reason,
            });
            self.lifecycle.notify_driver(driver_id, &message).await;
        }

        let now = Utc::now();
        self.publish(RideStatusUpdate {
            ride_id: ride.id,
            status: RideStatus::Cancelled,
            timestamp: now,
            driver_id: ride.driver_id,
            correlation_id: Uuid::new_v4(),
            final_fare: None,
        })
        .await
        .context(|| format!("publish cancellation of ride {id}"))?;

        if let Some(driver_id) = freed {
            self.publish(DriverStatusUpdate {
                driver_id,
                status: DriverStatus::Available,
                ride_id: None,
                timestamp: now,
            })
            .await
            .context(|| format!("publish status of driver {driver_id}"))?;
        }

        Ok(ride)
    }
}
