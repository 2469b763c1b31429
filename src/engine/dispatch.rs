//! Finding a driver for a requested ride.
//!
//! Each pass queries the nearest AVAILABLE drivers and offers the ride to them one
//! at a time, waiting for each answer before moving on. The first acceptor is
//! reserved with a status compare-and-set; losing that race just means trying the
//! next candidate. Passes repeat until someone accepts, the ride stops being
//! REQUESTED, or the search deadline passes.

use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Engine;
use crate::{
    broker::{DriverInfo, DriverMatchResponse, DriverStatusUpdate, RideRequested, RideStatusUpdate},
    calculator,
    connection::{push, ClientMessage, ServerMessage},
    db::NearbyDriver,
    entities::{Coordinates, DriverStatus, Ride, RideOffer, RideStatus, Transition},
    error::{Error, ErrorContext, Result},
};

enum Reply {
    Accepted(Option<Coordinates>),
    Declined(Option<Coordinates>),
}

impl Engine {
    /// Runs one search to completion, logging the outcome. Used by the broker consumer.
    pub(crate) async fn run_dispatch(&self, request: RideRequested) {
        let ride_id = request.ride_id;
        let passenger_id = request.passenger_id;

        match self.dispatch(request).await {
            Ok(ride) => {
                tracing::info!(%ride_id, driver_id = ?ride.driver_id, "ride matched");
            }
            Err(Error::DriverSearchTimeout) => {
                tracing::warn!(%ride_id, "no driver accepted before the search timed out");
                let message = push("NO_DRIVERS_AVAILABLE", json!({ "ride_id": ride_id }));
                if let Err(err) = self.passengers.send_to(passenger_id, &message).await {
                    tracing::debug!(%ride_id, error = %err, "passenger not notified");
                }
            }
            Err(Error::Cancelled) => tracing::info!(%ride_id, "driver search stopped"),
            Err(err) => tracing::error!(%ride_id, error = %err, "driver search failed"),
        }
    }

    /// Searches until a driver is reserved for the ride. Fails with
    /// `DriverSearchTimeout` when the deadline passes first (the ride stays
    /// REQUESTED) and with `Cancelled` once the ride is no longer REQUESTED.
    #[tracing::instrument(skip(self, request), fields(ride_id = %request.ride_id, ride_number = %request.ride_number))]
    pub async fn dispatch(&self, request: RideRequested) -> Result<Ride> {
        let limit = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.timeouts.search);
        let deadline = Instant::now() + limit;

        let cancel = self.shutdown.child_token();
        self.searches.insert(request.ride_id, cancel.clone());

        let result = self.search(&request, &cancel, deadline).await;

        self.searches.remove(&request.ride_id);
        result
    }

    /// Wakes the search for `ride_id`, if one is running.
    pub(crate) fn stop_search(&self, ride_id: Uuid) -> bool {
        match self.searches.remove(&ride_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn search(
        &self,
        request: &RideRequested,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Ride> {
        let ttl = chrono::Duration::from_std(self.timeouts.offer)
            .map_err(|err| Error::Unexpected(err.to_string()))?;
        let offer = RideOffer::new(
            request.ride_id,
            request.ride_number.clone(),
            request.ride_type,
            request.pickup_location.clone(),
            request.destination_location.clone(),
            request.estimated_fare,
            self.dispatch.earnings_share,
            ttl,
        );
        let max_distance_km = if request.max_distance_km > 0.0 {
            request.max_distance_km
        } else {
            self.dispatch.max_distance_km
        };

        let mut pass = 0u32;
        loop {
            pass += 1;
            self.ensure_requested(request.ride_id).await?;

            let candidates = self
                .store
                .drivers
                .find_available_nearby(
                    &request.pickup_location.coordinates,
                    request.ride_type,
                    max_distance_km,
                    self.dispatch.candidate_limit,
                )
                .await
                .context(|| format!("find drivers for ride {}", request.ride_id))?;

            if candidates.is_empty() {
                tracing::info!(pass, "no available drivers nearby");
            } else {
                tracing::info!(pass, candidates = candidates.len(), "offering ride");
            }

            for candidate in candidates.iter() {
                if let Some(ride) = self
                    .offer_to(request, &offer, candidate, ttl, cancel, deadline)
                    .await?
                {
                    return Ok(ride);
                }
            }

            let retry_at = Instant::now() + self.timeouts.search_retry_interval;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(retry_at.min(deadline)) => {}
            }

            if Instant::now() >= deadline {
                return Err(Error::DriverSearchTimeout);
            }
        }
    }

    async fn ensure_requested(&self, ride_id: Uuid) -> Result<()> {
        let ride = self
            .store
            .rides
            .get(ride_id)
            .await
            .context(|| format!("load ride {ride_id}"))?;

        if ride.status != RideStatus::Requested {
            tracing::info!(%ride_id, status = %ride.status, "ride no longer waiting for a driver");
            return Err(Error::Cancelled);
        }

        Ok(())
    }

    /// Offers the ride to one driver and reserves them on acceptance. `Ok(None)`
    /// means move on to the next candidate.
    #[tracing::instrument(skip_all, fields(driver_id = %candidate.driver.id, distance_km = candidate.distance_km))]
    async fn offer_to(
        &self,
        request: &RideRequested,
        offer: &RideOffer,
        candidate: &NearbyDriver,
        ttl: chrono::Duration,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Option<Ride>> {
        if Instant::now() >= deadline {
            return Err(Error::DriverSearchTimeout);
        }

        let driver_id = candidate.driver.id;
        let offer = offer.for_candidate(candidate.distance_km, ttl);

        let connection = match self.drivers.get(driver_id) {
            Ok(connection) => connection,
            Err(_) => {
                tracing::debug!("candidate has no live connection");
                return Ok(None);
            }
        };

        // subscribe before sending so a fast answer cannot slip past
        let mut subscription = match connection.subscribe(offer.offer_id.to_string()) {
            Ok(subscription) => subscription,
            Err(_) => return Ok(None),
        };

        if let Err(err) = connection
            .send_json(&ServerMessage::RideOffer(offer.clone()))
            .await
        {
            tracing::info!(error = %err, "offer not delivered");
            return Ok(None);
        }

        let wait_until = (Instant::now() + self.timeouts.offer).min(deadline);
        let reply = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                message = tokio::time::timeout_at(wait_until, subscription.recv()) => message,
            };

            let message = match message {
                Err(_) => {
                    tracing::info!(offer_id = %offer.offer_id, "offer expired unanswered");
                    return Ok(None);
                }
                Ok(Err(_)) => {
                    tracing::info!("driver disconnected while the offer was open");
                    return Ok(None);
                }
                Ok(Ok(message)) => message,
            };

            match serde_json::from_value::<ClientMessage>(message) {
                Ok(ClientMessage::RideResponse {
                    offer_id,
                    ride_id,
                    accepted,
                    current_location,
                }) if offer_id == offer.offer_id && ride_id == offer.ride_id => {
                    if offer.is_expired() {
                        tracing::info!(%offer_id, "reply arrived after the offer expired");
                        return Ok(None);
                    }
                    break if accepted {
                        Reply::Accepted(current_location)
                    } else {
                        Reply::Declined(current_location)
                    };
                }
                _ => continue,
            }
        };
        drop(subscription);

        let (accepted, current_location) = match reply {
            Reply::Accepted(location) => (true, location),
            Reply::Declined(location) => (false, location),
        };

        self.publish(DriverMatchResponse {
            ride_id: request.ride_id,
            driver_id,
            accepted,
            estimated_arrival_minutes: calculator::duration_minutes(candidate.distance_km),
            driver_location: current_location.or(Some(candidate.location.coordinates)),
            driver_info: DriverInfo {
                license_number: candidate.driver.license_number.clone(),
                vehicle_class: candidate.driver.vehicle_class,
                rating: candidate.driver.rating,
            },
            correlation_id: request.correlation_id,
        })
        .await
        .context(|| format!("publish match response of driver {driver_id}"))?;

        if !accepted {
            tracing::info!("offer declined");
            return Ok(None);
        }

        let trigger = json!({
            "offer_id": offer.offer_id,
            "driver_id": driver_id,
            "accepted": true,
            "current_location": current_location,
        });

        match self.reserve(request, driver_id, trigger).await {
            Ok(Some(ride)) => Ok(Some(ride)),
            Ok(None) => {
                tracing::info!("driver was reserved elsewhere first");
                self.withdraw(&offer, driver_id, "driver is no longer available").await;
                Ok(None)
            }
            Err(err) => {
                self.withdraw(&offer, driver_id, "ride is no longer available").await;
                Err(err)
            }
        }
    }

    /// Atomically re-checks the ride, takes the driver AVAILABLE → BUSY and matches
    /// the ride. `Ok(None)` when the driver's status had already moved on.
    async fn reserve(
        &self,
        request: &RideRequested,
        driver_id: Uuid,
        trigger: Value,
    ) -> Result<Option<Ride>> {
        let ride_id = request.ride_id;

        let reserved = self
            .store
            .tx
            .run(|| async move {
                let ride = self.store.rides.get(ride_id).await?;
                if ride.status != RideStatus::Requested {
                    return Err(Error::Cancelled);
                }

                let previous = self
                    .store
                    .drivers
                    .compare_and_set_status(driver_id, DriverStatus::Available, DriverStatus::Busy)
                    .await?;
                if previous != DriverStatus::Available {
                    return Ok(None);
                }

                let (ride, _) = self
                    .lifecycle
                    .transition(ride_id, Transition::Match { driver_id }, trigger)
                    .await?;

                Ok(Some(ride))
            })
            .await
            .context(|| format!("reserve driver {driver_id} for ride {ride_id}"))?;

        let ride = match reserved {
            Some(ride) => ride,
            None => return Ok(None),
        };

        self.lifecycle.announce_match(&ride).await;
        self.lifecycle.track(&ride);

        let now = Utc::now();
        self.publish(RideStatusUpdate {
            ride_id,
            status: RideStatus::Matched,
            timestamp: now,
            driver_id: Some(driver_id),
            correlation_id: request.correlation_id,
            final_fare: None,
        })
        .await
        .context(|| format!("publish match of ride {ride_id}"))?;

        self.publish(DriverStatusUpdate {
            driver_id,
            status: DriverStatus::Busy,
            ride_id: Some(ride_id),
            timestamp: now,
        })
        .await
        .context(|| format!("publish status of driver {driver_id}"))?;

        Ok(Some(ride))
    }

    async fn withdraw(&self, offer: &RideOffer, driver_id: Uuid, reason: &str) {
        let message = json!({
            "type": "offer_withdrawn",
            "offer_id": offer.offer_id,
            "ride_id": offer.ride_id,
            "reason": reason,
        });
        self.lifecycle.notify_driver(driver_id, &message).await;
    }
}
