use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calculator;
use crate::entities::{Location, RideType};

/// A time-bounded proposal of one ride. Built once per dispatch and shown to
/// candidates one at a time; never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideOffer {
    pub offer_id: Uuid,
    pub ride_id: Uuid,
    pub ride_number: String,
    pub ride_type: RideType,
    pub pickup: Location,
    pub destination: Location,
    pub estimated_fare: f64,
    pub driver_earnings: f64,
    pub distance_km: f64,
    pub duration_minutes: i32,
    pub distance_to_pickup_km: f64,
    pub expires_at: DateTime<Utc>,
}

impl RideOffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ride_id: Uuid,
        ride_number: String,
        ride_type: RideType,
        pickup: Location,
        destination: Location,
        estimated_fare: f64,
        earnings_share: f64,
        ttl: Duration,
    ) -> Self {
        let distance_km = calculator::distance_km(&pickup.coordinates, &destination.coordinates);

        Self {
            offer_id: Uuid::new_v4(),
            ride_id,
            ride_number,
            ride_type,
            pickup,
            destination,
            estimated_fare,
            driver_earnings: calculator::driver_earnings(estimated_fare, earnings_share),
            distance_km,
            duration_minutes: calculator::duration_minutes(distance_km),
            distance_to_pickup_km: 0.0,
            expires_at: Utc::now() + ttl,
        }
    }

    /// The same offer as sent to one candidate. Each send gets its own `offer_id`,
    /// so a reply can only ever answer the send it was made for.
    pub fn for_candidate(&self, distance_to_pickup_km: f64, ttl: Duration) -> Self {
        Self {
            offer_id: Uuid::new_v4(),
            distance_to_pickup_km,
            expires_at: Utc::now() + ttl,
            ..self.clone()
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[test]
fn offer_is_computed_once_and_specialised_per_candidate() {
    let offer = RideOffer::new(
        Uuid::new_v4(),
        "RIDE_20240101_001".into(),
        RideType::Economy,
        Location::new(43.222, 76.851),
        Location::new(43.238, 76.889),
        1200.0,
        0.8,
        Duration::seconds(30),
    );

    assert_eq!(offer.driver_earnings, 960.0);
    assert!(offer.distance_km > 0.0);
    assert!(!offer.is_expired());

    let candidate = offer.for_candidate(1.25, Duration::seconds(30));
    assert_ne!(candidate.offer_id, offer.offer_id);
    assert_eq!(candidate.ride_id, offer.ride_id);
    assert_eq!(candidate.distance_to_pickup_km, 1.25);
    assert_eq!(candidate.driver_earnings, offer.driver_earnings);

    let again = offer.for_candidate(1.25, Duration::seconds(30));
    assert_ne!(again.offer_id, candidate.offer_id);

    let lapsed = offer.for_candidate(1.25, Duration::seconds(-1));
    assert!(lapsed.is_expired());
}
