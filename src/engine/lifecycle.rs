//! The ride state machine in motion: persisting transitions, notifying the
//! passenger, and following the driver's position while a ride is active.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    broker::{DriverStatusUpdate, DynPublisher},
    calculator,
    connection::{push, ClientMessage, ConnectionRegistry, ServerMessage, Subscription},
    db::Store,
    entities::{DriverStatus, Location, Ride, RideEvent, RideStatus, Transition},
    error::{Error, ErrorContext, Result},
};

/// Name of the passenger push sent after each transition.
fn push_event(transition: &Transition) -> &'static str {
    match transition {
        Transition::Match { .. } => "DRIVER_MATCHED",
        Transition::DepartToPickup => "DRIVER_EN_ROUTE",
        Transition::ArriveAtPickup => "DRIVER_ARRIVED",
        Transition::StartTrip => "RIDE_STARTED",
        Transition::CompleteTrip { .. } => "RIDE_COMPLETED",
        Transition::Cancel { .. } => "RIDE_CANCELLED",
    }
}

fn status_payload(ride: &Ride) -> Value {
    json!({
        "ride_id": ride.id,
        "ride_number": ride.number,
        "status": ride.status,
        "driver_id": ride.driver_id,
        "final_fare": ride.final_fare,
        "cancellation_reason": ride.cancellation_reason,
        "timestamp": Utc::now(),
    })
}

#[derive(Clone)]
pub(crate) struct Lifecycle {
    store: Store,
    drivers: Arc<ConnectionRegistry>,
    passengers: Arc<ConnectionRegistry>,
    publisher: DynPublisher,
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new(
        store: Store,
        drivers: Arc<ConnectionRegistry>,
        passengers: Arc<ConnectionRegistry>,
        publisher: DynPublisher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            drivers,
            passengers,
            publisher,
            shutdown,
        }
    }

    /// Applies `transition` to the stored ride, persists it and appends the audit
    /// event, all in one transaction (the caller's, when there is one). Returns the
    /// updated ride and the status it left. A rejected transition changes nothing.
    #[tracing::instrument(skip(self, transition, trigger), fields(event = transition.name()))]
    pub(crate) async fn transition(
        &self,
        ride_id: Uuid,
        transition: Transition,
        trigger: Value,
    ) -> Result<(Ride, RideStatus)> {
        let name = transition.name();

        self.store
            .tx
            .run(|| async move {
                let mut ride = self.store.rides.get(ride_id).await?;
                let previous = ride.apply(&transition, Utc::now())?;

                if !self.store.rides.save_transition(&ride, previous).await? {
                    // someone else moved the ride first
                    return Err(Error::InvalidRideTransition {
                        status: previous.to_string(),
                        event: name.into(),
                    });
                }

                let event = RideEvent::new(ride.id, name, Some(previous), ride.status, trigger);
                self.store.rides.append_event(&event).await?;

                tracing::info!(%ride_id, from = %previous, to = %ride.status, "ride transitioned");
                Ok((ride, previous))
            })
            .await
            .context(|| format!("apply {name} to ride {ride_id}"))
    }

    /// Best-effort push to the ride's passenger.
    pub(crate) async fn notify_passenger(&self, ride: &Ride, event: &str, data: Value) {
        if let Err(err) = self.passengers.send_to(ride.passenger_id, &push(event, data)).await {
            tracing::debug!(ride_id = %ride.id, passenger_id = %ride.passenger_id, event, error = %err, "passenger not notified");
        }
    }

    /// Best-effort message to a driver.
    pub(crate) async fn notify_driver(&self, driver_id: Uuid, message: &Value) {
        if let Err(err) = self.drivers.send_to(driver_id, message).await {
            tracing::debug!(%driver_id, error = %err, "driver not notified");
        }
    }

    pub(crate) async fn announce(&self, ride: &Ride, transition: &Transition) {
        self.notify_passenger(ride, push_event(transition), status_payload(ride))
            .await;
    }

    /// Tells the passenger who is coming and hands the driver the full ride.
    pub(crate) async fn announce_match(&self, ride: &Ride) {
        let driver_id = match ride.driver_id {
            Some(driver_id) => driver_id,
            None => return,
        };

        let mut data = status_payload(ride);
        match self.store.drivers.get(driver_id).await {
            Ok(driver) => {
                data["driver"] = json!({
                    "id": driver.id,
                    "license_number": driver.license_number,
                    "vehicle_class": driver.vehicle_class,
                    "rating": driver.rating,
                });
            }
            Err(err) => tracing::warn!(%driver_id, error = %err, "driver details unavailable"),
        }
        if let Ok(location) = self.store.coordinates.last_known(driver_id).await {
            let distance_km =
                calculator::distance_km(&location.coordinates, &ride.pickup.coordinates);
            data["driver_location"] = json!(location);
            data["eta_minutes"] = json!(calculator::duration_minutes(distance_km));
        }

        self.notify_passenger(ride, push_event(&Transition::Match { driver_id }), data)
            .await;

        match serde_json::to_value(ServerMessage::RideDetails(ride.clone())) {
            Ok(details) => self.notify_driver(driver_id, &details).await,
            Err(err) => tracing::error!(ride_id = %ride.id, error = %err, "ride details not encodable"),
        }
    }

    /// Reacts to a driver status published by the driver side. Events that the ride
    /// has already moved past are ignored.
    #[tracing::instrument(skip(self, update), fields(driver_id = %update.driver_id, status = %update.status))]
    pub(crate) async fn on_driver_status(&self, update: &DriverStatusUpdate) -> Result<()> {
        let ride_id = match update.ride_id {
            Some(ride_id) => ride_id,
            None => return Ok(()),
        };

        let ride = self.store.rides.get(ride_id).await?;
        if !ride.is_driver(update.driver_id) {
            return Err(Error::DriverRideMismatch);
        }

        match (update.status, ride.status) {
            (DriverStatus::EnRoute, RideStatus::Matched) => {
                self.depart(ride_id, update.driver_id, json!(update)).await?;
            }
            (DriverStatus::Arrived, RideStatus::EnRoute) => {
                self.arrive(ride_id, update.driver_id, json!(update)).await?;
            }
            _ => tracing::debug!(%ride_id, ride_status = %ride.status, "nothing to do"),
        }

        Ok(())
    }

    /// MATCHED → EN_ROUTE for the ride, BUSY → EN_ROUTE for the driver.
    pub(crate) async fn depart(&self, ride_id: Uuid, driver_id: Uuid, trigger: Value) -> Result<Ride> {
        let transition = Transition::DepartToPickup;
        let ride = self
            .store
            .tx
            .run(|| async {
                let (ride, _) = self.transition(ride_id, transition.clone(), trigger).await?;

                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(driver_id, DriverStatus::Busy, DriverStatus::EnRoute)
                    .await?;
                if previous != DriverStatus::Busy {
                    return Err(Error::DriverNotAvailable);
                }

                Ok(ride)
            })
            .await
            .context(|| format!("depart for ride {ride_id}"))?;

        self.announce(&ride, &transition).await;
        Ok(ride)
    }

    /// EN_ROUTE → ARRIVED for the ride and the driver together. Ends the pickup leg
    /// of the location relay.
    pub(crate) async fn arrive(&self, ride_id: Uuid, driver_id: Uuid, trigger: Value) -> Result<Ride> {
        let ride = self
            .store
            .tx
            .run(|| async move {
                let (ride, _) = self
                    .transition(ride_id, Transition::ArriveAtPickup, trigger)
                    .await?;

                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(driver_id, DriverStatus::EnRoute, DriverStatus::Arrived)
                    .await?;
                if previous != DriverStatus::EnRoute && previous != DriverStatus::Arrived {
                    tracing::warn!(%driver_id, %previous, "driver status out of step with ride");
                }

                Ok(ride)
            })
            .await?;

        self.stop_tracking(ride_id, driver_id);
        self.announce(&ride, &Transition::ArriveAtPickup).await;
        Ok(ride)
    }

    fn tracking_key(ride_id: Uuid) -> String {
        format!("track:{ride_id}")
    }

    /// Drops the ride's location relay, if one is running.
    pub(crate) fn stop_tracking(&self, ride_id: Uuid, driver_id: Uuid) {
        if let Ok(connection) = self.drivers.get(driver_id) {
            connection.unsubscribe(&Self::tracking_key(ride_id));
        }
    }

    /// Follows the ride's driver until the current leg ends. Tracking again replaces
    /// the running relay. Returns `false` when the driver has no live connection.
    pub(crate) fn track(&self, ride: &Ride) -> bool {
        let driver_id = match ride.driver_id {
            Some(driver_id) => driver_id,
            None => return false,
        };

        let subscription = match self
            .drivers
            .get(driver_id)
            .and_then(|connection| connection.subscribe(Self::tracking_key(ride.id)))
        {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::info!(ride_id = %ride.id, %driver_id, error = %err, "driver location not tracked");
                return false;
            }
        };

        let lifecycle = self.clone();
        let ride_id = ride.id;
        tokio::spawn(async move { lifecycle.follow(ride_id, driver_id, subscription).await });
        true
    }

    async fn follow(self, ride_id: Uuid, driver_id: Uuid, mut subscription: Subscription) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                message = subscription.recv() => match message {
                    Ok(message) => message,
                    Err(_) => {
                        tracing::debug!(%ride_id, %driver_id, "tracking stopped");
                        return;
                    }
                },
            };

            let location = match serde_json::from_value::<ClientMessage>(message) {
                Ok(ClientMessage::LocationUpdate(location)) => location,
                _ => continue,
            };

            match self.relay(ride_id, driver_id, &location).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => tracing::warn!(%ride_id, error = %err, "location not relayed"),
            }
        }
    }

    /// Forwards one driver position to the passenger. Returns whether the leg goes on.
    async fn relay(&self, ride_id: Uuid, driver_id: Uuid, location: &Location) -> Result<bool> {
        let ride = self.store.rides.get(ride_id).await?;
        if !ride.status.is_active() || !ride.is_driver(driver_id) {
            return Ok(false);
        }

        let (target, leg) = match ride.status {
            RideStatus::InProgress => (&ride.destination, "destination"),
            _ => (&ride.pickup, "pickup"),
        };
        let distance_km = calculator::distance_km(&location.coordinates, &target.coordinates);

        self.notify_passenger(
            &ride,
            "DRIVER_LOCATION",
            json!({
                "ride_id": ride.id,
                "status": ride.status,
                "location": location,
                "target": leg,
                "distance_km": distance_km,
                "eta_minutes": calculator::duration_minutes(distance_km),
            }),
        )
        .await;

        if ride.status == RideStatus::EnRoute
            && calculator::is_arrived(&location.coordinates, &ride.pickup.coordinates)
        {
            self.arrive(ride_id, driver_id, json!({ "source": "location", "location": location }))
                .await?;
            self.publisher
                .publish(
                    DriverStatusUpdate {
                        driver_id,
                        status: DriverStatus::Arrived,
                        ride_id: Some(ride_id),
                        timestamp: Utc::now(),
                    }
                    .into(),
                )
                .await
                .context(|| format!("publish arrival of driver {driver_id}"))?;
            return Ok(false);
        }

        Ok(true)
    }
}
