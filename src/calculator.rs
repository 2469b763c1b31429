//! Distance, duration, fare and priority math shared by dispatch and the ride lifecycle,
//! so the fare quoted to a passenger and the earnings offered to a driver never diverge.

use chrono::{DateTime, Timelike, Utc};

use crate::entities::{Coordinates, RideType};

pub const EARTH_RADIUS_KM: f64 = 6371.0;
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const AVERAGE_SPEED_KMH: f64 = 30.0;
pub const ARRIVAL_RADIUS_M: f64 = 25.0;
pub const MAX_PRIORITY: i32 = 5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tariff {
    pub base: f64,
    pub per_km: f64,
    pub per_minute: f64,
}

pub fn tariff(ride_type: RideType) -> Tariff {
    match ride_type {
        RideType::Economy => Tariff {
            base: 400.0,
            per_km: 110.0,
            per_minute: 20.0,
        },
        RideType::Comfort => Tariff {
            base: 600.0,
            per_km: 150.0,
            per_minute: 30.0,
        },
        RideType::Business => Tariff {
            base: 1000.0,
            per_km: 250.0,
            per_minute: 50.0,
        },
    }
}

fn haversine(a: &Coordinates, b: &Coordinates, radius: f64) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * radius * h.sqrt().min(1.0).asin()
}

/// Great-circle distance in kilometers.
pub fn distance_km(a: &Coordinates, b: &Coordinates) -> f64 {
    haversine(a, b, EARTH_RADIUS_KM)
}

pub fn distance_m(a: &Coordinates, b: &Coordinates) -> f64 {
    haversine(a, b, EARTH_RADIUS_M)
}

/// Travel time in whole minutes at the average city speed, never below one minute
/// for a non-zero trip.
pub fn duration_minutes(distance_km: f64) -> i32 {
    if distance_km <= 0.0 {
        return 0;
    }

    ((distance_km / AVERAGE_SPEED_KMH) * 60.0).ceil().max(1.0) as i32
}

pub fn fare(ride_type: RideType, distance_km: f64, duration_minutes: i32) -> f64 {
    let t = tariff(ride_type);
    let fare = t.base + t.per_km * distance_km.max(0.0) + t.per_minute * f64::from(duration_minutes.max(0));

    (fare * 100.0).round() / 100.0
}

pub fn driver_earnings(fare: f64, share: f64) -> f64 {
    (fare * share.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

fn is_peak_hour(at: &DateTime<Utc>) -> bool {
    matches!(at.hour(), 7..=9 | 17..=19)
}

pub fn priority(ride_type: RideType, distance_km: f64, at: &DateTime<Utc>) -> i32 {
    let mut score = 1;

    if is_peak_hour(at) {
        score += 2;
    }
    if ride_type == RideType::Business {
        score += 2;
    }
    if distance_km < 3.0 {
        score += 1;
    }

    score.min(MAX_PRIORITY)
}

pub fn is_arrived(driver: &Coordinates, target: &Coordinates) -> bool {
    distance_m(driver, target) <= ARRIVAL_RADIUS_M
}

#[cfg(test)]
fn point(latitude: f64, longitude: f64) -> Coordinates {
    Coordinates {
        latitude,
        longitude,
    }
}

#[test]
fn distance_between_almaty_points() {
    let pickup = point(43.222, 76.851);
    let destination = point(43.238, 76.889);

    let d = distance_km(&pickup, &destination);
    assert!(d > 3.0 && d < 4.0, "unexpected distance {d}");
    assert_eq!(distance_km(&pickup, &pickup), 0.0);
}

#[test]
fn duration_rounds_up_to_whole_minutes() {
    assert_eq!(duration_minutes(0.0), 0);
    assert_eq!(duration_minutes(0.1), 1);
    assert_eq!(duration_minutes(15.0), 30);
    assert_eq!(duration_minutes(15.1), 31);
}

#[test]
fn fare_uses_ride_type_tariff() {
    assert_eq!(fare(RideType::Economy, 0.0, 0), 400.0);
    assert_eq!(fare(RideType::Economy, 10.0, 20), 400.0 + 1100.0 + 400.0);
    assert!(fare(RideType::Business, 5.0, 10) > fare(RideType::Comfort, 5.0, 10));
    assert!(fare(RideType::Comfort, 5.0, 10) > fare(RideType::Economy, 5.0, 10));
}

#[test]
fn earnings_are_a_share_of_the_fare() {
    assert_eq!(driver_earnings(1000.0, 0.8), 800.0);
    assert_eq!(driver_earnings(1000.0, 1.5), 1000.0);
}

#[test]
fn priority_bonuses_are_capped() {
    use chrono::TimeZone;

    let peak = Utc.with_ymd_and_hms(2024, 5, 6, 8, 30, 0).unwrap();
    let quiet = Utc.with_ymd_and_hms(2024, 5, 6, 13, 0, 0).unwrap();

    assert_eq!(priority(RideType::Economy, 10.0, &quiet), 1);
    assert_eq!(priority(RideType::Economy, 1.0, &quiet), 2);
    assert_eq!(priority(RideType::Economy, 10.0, &peak), 3);
    assert_eq!(priority(RideType::Business, 1.0, &peak), MAX_PRIORITY);
}

#[test]
fn arrival_radius() {
    let target = point(43.222, 76.851);

    assert!(is_arrived(&target, &target));
    // ~11 m north
    assert!(is_arrived(&point(43.2221, 76.851), &target));
    // ~1 km north
    assert!(!is_arrived(&point(43.231, 76.851), &target));
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn coordinates() -> impl Strategy<Value = Coordinates> {
        (-89.0f64..89.0, -179.0f64..179.0).prop_map(|(latitude, longitude)| Coordinates {
            latitude,
            longitude,
        })
    }

    fn ride_type() -> impl Strategy<Value = RideType> {
        prop_oneof![
            Just(RideType::Economy),
            Just(RideType::Comfort),
            Just(RideType::Business)
        ]
    }

    proptest! {
        #[test]
        fn distance_is_symmetric(a in coordinates(), b in coordinates()) {
            let ab = distance_km(&a, &b);
            let ba = distance_km(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-9);
        }

        #[test]
        fn distance_to_self_is_zero(a in coordinates()) {
            prop_assert_eq!(distance_km(&a, &a), 0.0);
        }

        #[test]
        fn fare_is_monotonic(
            t in ride_type(),
            d in 0.0f64..200.0,
            extra_d in 0.0f64..50.0,
            m in 0i32..300,
            extra_m in 0i32..60,
        ) {
            prop_assert!(fare(t, d + extra_d, m) >= fare(t, d, m));
            prop_assert!(fare(t, d, m + extra_m) >= fare(t, d, m));
        }
    }
}
