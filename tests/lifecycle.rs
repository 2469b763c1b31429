mod common;

use std::time::Duration;

use regex::Regex;
use serde_json::json;
use uuid::Uuid;

use chrono::Utc;
use common::{dispatch_request, engine, online_driver, passenger, request_ride, spawn_driver, Client};
use vectura::api::{DriverAPI, RideAPI};
use vectura::auth::User;
use vectura::broker::{DriverStatusUpdate, Publisher};
use vectura::engine::Engine;
use vectura::entities::{DriverStatus, Location, RideStatus, RideType};
use vectura::error::Error;

async fn wait_for_status(engine: &Engine, ride_id: Uuid, status: RideStatus) {
    for _ in 0..200 {
        if engine.store().rides.get(ride_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ride never reached {status}");
}

#[tokio::test]
async fn created_ride_is_requested_with_estimates() {
    let (engine, _broker) = engine();
    let rider = passenger();

    let ride = request_ride(&engine, &rider).await;

    assert_eq!(ride.status, RideStatus::Requested);
    assert_eq!(ride.passenger_id, rider.id);
    assert!(ride.estimated_distance_km > 0.0);
    assert!(ride.estimated_fare > 0.0);
    assert!(Regex::new(r"^RIDE_\d{8}_\d{3}$").unwrap().is_match(&ride.number));

    let next = request_ride(&engine, &rider).await;
    assert_ne!(next.number, ride.number);

    let events = engine.ride_events(rider, ride.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "ride_requested");
    assert_eq!(events[0].to_status, RideStatus::Requested);
}

#[tokio::test]
async fn invalid_coordinates_are_rejected() {
    let (engine, _broker) = engine();

    let err = engine
        .create_ride(
            passenger(),
            vectura::api::NewRide {
                pickup: Location::new(95.0, 76.851),
                destination: Location::new(43.238, 76.889),
                ride_type: RideType::Economy,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidInput));
}

#[tokio::test]
async fn ride_runs_from_request_to_completion() {
    let (engine, _broker) = engine();
    let (driver_user, driver) =
        online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;

    let mut phone = Client::connect(engine.passengers(), rider.id);
    let car = Client::connect(engine.drivers(), driver.id);
    let frames = car.frames_handle();
    let _seen = spawn_driver(car, true);

    engine.dispatch(dispatch_request(&ride, None)).await.unwrap();
    phone.expect("DRIVER_MATCHED").await;

    let ride = engine
        .confirm_en_route(driver_user.clone(), ride.id)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::EnRoute);
    phone.expect("DRIVER_EN_ROUTE").await;

    // reaching the pickup point marks the arrival
    frames.send(json!({
        "type": "location_update",
        "latitude": ride.pickup.coordinates.latitude,
        "longitude": ride.pickup.coordinates.longitude,
    }));
    let position = phone.expect("DRIVER_LOCATION").await;
    assert_eq!(position["data"]["target"], "pickup");
    phone.expect("DRIVER_ARRIVED").await;

    let arrived = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(arrived.status, DriverStatus::Arrived);

    let ride = engine.start_ride(driver_user.clone(), ride.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::InProgress);
    phone.expect("RIDE_STARTED").await;

    let ride = engine
        .complete_ride(driver_user.clone(), ride.id)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Completed);
    assert!(ride.final_fare.unwrap() > 0.0);
    phone.expect("RIDE_COMPLETED").await;

    let driver = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Available);
    assert_eq!(driver.total_rides, 1);
    assert!(driver.total_earnings > 0.0);

    let session = engine.go_offline(driver_user, driver.id).await.unwrap();
    assert_eq!(session.total_rides, 1);
    assert!(!session.is_open());

    let statuses: Vec<RideStatus> = engine
        .ride_events(rider, ride.id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.to_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            RideStatus::Requested,
            RideStatus::Matched,
            RideStatus::EnRoute,
            RideStatus::Arrived,
            RideStatus::InProgress,
            RideStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn completed_ride_cannot_be_cancelled() {
    let (engine, _broker) = engine();
    let (driver_user, driver) =
        online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;
    let car = Client::connect(engine.drivers(), driver.id);
    let frames = car.frames_handle();
    let _seen = spawn_driver(car, true);

    engine.dispatch(dispatch_request(&ride, None)).await.unwrap();
    engine.confirm_en_route(driver_user.clone(), ride.id).await.unwrap();

    // MATCHED is the last cancellable state
    let err = engine
        .cancel_ride(rider.clone(), ride.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RideCannotBeCancelled));

    frames.send(json!({
        "type": "location_update",
        "latitude": ride.pickup.coordinates.latitude,
        "longitude": ride.pickup.coordinates.longitude,
    }));
    wait_for_status(&engine, ride.id, RideStatus::Arrived).await;
    engine.start_ride(driver_user.clone(), ride.id).await.unwrap();
    engine.complete_ride(driver_user, ride.id).await.unwrap();

    let before = engine.store().rides.get(ride.id).await.unwrap();
    let events_before = engine.store().rides.events(ride.id).await.unwrap().len();

    let err = engine
        .cancel_ride(rider, ride.id, Some("too late".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RideCannotBeCancelled));

    let after = engine.store().rides.get(ride.id).await.unwrap();
    assert_eq!(after.status, RideStatus::Completed);
    assert_eq!(after.final_fare, before.final_fare);
    assert!(after.cancelled_at.is_none());
    assert!(after.cancellation_reason.is_none());
    assert_eq!(
        engine.store().rides.events(ride.id).await.unwrap().len(),
        events_before
    );
}

#[tokio::test]
async fn cancelling_a_matched_ride_frees_the_driver() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;
    let mut seen = spawn_driver(Client::connect(engine.drivers(), driver.id), true);

    engine.dispatch(dispatch_request(&ride, None)).await.unwrap();

    let ride = engine
        .cancel_ride(rider, ride.id, Some("changed plans".into()))
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(ride.cancellation_reason.as_deref(), Some("changed plans"));

    let driver = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Available);

    let notice = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let message = seen.recv().await.unwrap();
            if message["type"] == "ride_cancelled" {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(notice["reason"], "changed plans");
}

#[tokio::test]
async fn only_the_assigned_driver_may_advance_a_ride() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let (other_user, _) = online_driver(&engine, "CD654321", Location::new(43.3, 76.9)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;
    let _seen = spawn_driver(Client::connect(engine.drivers(), driver.id), true);

    engine.dispatch(dispatch_request(&ride, None)).await.unwrap();

    let err = engine
        .confirm_en_route(other_user.clone(), ride.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DriverRideMismatch));

    let err = engine.find_ride(other_user, ride.id).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden));

    let err = engine.find_ride(passenger(), ride.id).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden));

    let found = engine.find_ride(rider, ride.id).await.unwrap();
    assert_eq!(found.driver_id, Some(driver.id));
}

#[tokio::test]
async fn driver_shift_rules() {
    let (engine, _broker) = engine();
    let user = User::new(Uuid::new_v4());

    let err = engine
        .register_driver(user.clone(), "ab12".into(), RideType::Economy)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLicenseFormat));

    let driver = engine
        .register_driver(user.clone(), "AB123456".into(), RideType::Economy)
        .await
        .unwrap();
    assert_eq!(driver.status, DriverStatus::Offline);
    assert_eq!(
        engine.store().users.roles(user.id).await.unwrap(),
        vec!["driver".to_string()]
    );

    let err = engine
        .register_driver(User::new(Uuid::new_v4()), "AB123456".into(), RideType::Comfort)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LicenseAlreadyRegistered));

    let err = engine.go_offline(user.clone(), driver.id).await.unwrap_err();
    assert!(matches!(err, Error::DriverAlreadyOffline));

    engine.go_online(user.clone(), driver.id, None).await.unwrap();
    let err = engine
        .go_online(user.clone(), driver.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DriverAlreadyOnline));

    let err = engine
        .go_online(User::new(Uuid::new_v4()), driver.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden));

    engine
        .store()
        .drivers
        .compare_and_set_status(driver.id, DriverStatus::Available, DriverStatus::Busy)
        .await
        .unwrap();
    let err = engine.go_offline(user.clone(), driver.id).await.unwrap_err();
    assert!(matches!(err, Error::DriverNotAvailable));
}

#[tokio::test]
async fn location_updates_feed_the_nearby_search() {
    let (engine, _broker) = engine();
    let user = User::new(Uuid::new_v4());
    let driver = engine
        .register_driver(user.clone(), "AB123456".into(), RideType::Economy)
        .await
        .unwrap();
    engine.go_online(user.clone(), driver.id, None).await.unwrap();

    let pickup = Location::new(43.222, 76.851);
    let nearby = engine
        .store()
        .drivers
        .find_available_nearby(&pickup.coordinates, RideType::Economy, 5.0, 10)
        .await
        .unwrap();
    assert!(nearby.is_empty());

    let err = engine
        .update_location(passenger(), driver.id, Location::new(43.225, 76.855))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden));

    engine
        .update_location(user, driver.id, Location::new(43.225, 76.855))
        .await
        .unwrap();

    let nearby = engine
        .store()
        .drivers
        .find_available_nearby(&pickup.coordinates, RideType::Economy, 5.0, 10)
        .await
        .unwrap();
    assert_eq!(nearby.len(), 1);
    assert_eq!(nearby[0].driver.id, driver.id);
}

/// Nothing of type `kind` reaches the client for a while.
async fn assert_quiet(client: &mut Client, kind: &str) {
    let pushed = tokio::time::timeout(Duration::from_millis(200), client.expect(kind)).await;
    assert!(pushed.is_err(), "unexpected {kind}");
}

#[tokio::test]
async fn matched_driver_position_reaches_the_passenger() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;

    let mut phone = Client::connect(engine.passengers(), rider.id);
    let car = Client::connect(engine.drivers(), driver.id);
    let frames = car.frames_handle();
    let _seen = spawn_driver(car, true);

    engine.dispatch(dispatch_request(&ride, None)).await.unwrap();
    phone.expect("DRIVER_MATCHED").await;

    frames.send(json!({
        "type": "location_update",
        "latitude": 43.2225,
        "longitude": 76.8515,
    }));
    let position = tokio::time::timeout(Duration::from_secs(1), phone.expect("DRIVER_LOCATION"))
        .await
        .unwrap();
    assert_eq!(position["data"]["status"], "MATCHED");
    assert_eq!(position["data"]["target"], "pickup");
    assert!(position["data"]["distance_km"].as_f64().unwrap() > 0.0);

    let ride = engine.store().rides.get(ride.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Matched);
}

#[tokio::test]
async fn driver_status_events_move_the_ride_along() {
    let (engine, broker) = engine();
    let _consumers = engine.start(&broker);

    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let mut phone = Client::connect(engine.passengers(), rider.id);
    let car = Client::connect(engine.drivers(), driver.id);
    let frames = car.frames_handle();
    let _seen = spawn_driver(car, true);

    // dispatched by the RideRequested consumer
    let ride = request_ride(&engine, &rider).await;
    phone.expect("DRIVER_MATCHED").await;

    let reported = |status| DriverStatusUpdate {
        driver_id: driver.id,
        status,
        ride_id: Some(ride.id),
        timestamp: Utc::now(),
    };

    broker.publish(reported(DriverStatus::EnRoute).into()).await.unwrap();
    phone.expect("DRIVER_EN_ROUTE").await;
    assert_eq!(
        engine.store().rides.get(ride.id).await.unwrap().status,
        RideStatus::EnRoute
    );
    assert_eq!(
        engine.store().drivers.get(driver.id).await.unwrap().status,
        DriverStatus::EnRoute
    );

    broker.publish(reported(DriverStatus::Arrived).into()).await.unwrap();
    phone.expect("DRIVER_ARRIVED").await;
    assert_eq!(
        engine.store().rides.get(ride.id).await.unwrap().status,
        RideStatus::Arrived
    );
    assert_eq!(
        engine.store().drivers.get(driver.id).await.unwrap().status,
        DriverStatus::Arrived
    );

    // the pickup leg ended with the arrival
    frames.send(json!({
        "type": "location_update",
        "latitude": 43.2225,
        "longitude": 76.8515,
    }));
    assert_quiet(&mut phone, "DRIVER_LOCATION").await;

    let statuses: Vec<RideStatus> = engine
        .store()
        .rides
        .events(ride.id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.to_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            RideStatus::Requested,
            RideStatus::Matched,
            RideStatus::EnRoute,
            RideStatus::Arrived,
        ]
    );
}

#[tokio::test]
async fn trip_positions_are_relayed_toward_the_destination() {
    let (engine, _broker) = engine();
    let (driver_user, driver) =
        online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;

    let mut phone = Client::connect(engine.passengers(), rider.id);
    let car = Client::connect(engine.drivers(), driver.id);
    let frames = car.frames_handle();
    let _seen = spawn_driver(car, true);

    engine.dispatch(dispatch_request(&ride, None)).await.unwrap();
    engine.confirm_en_route(driver_user.clone(), ride.id).await.unwrap();
    frames.send(json!({
        "type": "location_update",
        "latitude": ride.pickup.coordinates.latitude,
        "longitude": ride.pickup.coordinates.longitude,
    }));
    phone.expect("DRIVER_ARRIVED").await;

    engine.start_ride(driver_user.clone(), ride.id).await.unwrap();
    phone.expect("RIDE_STARTED").await;

    frames.send(json!({
        "type": "location_update",
        "latitude": 43.230,
        "longitude": 76.870,
    }));
    let position = tokio::time::timeout(Duration::from_secs(1), phone.expect("DRIVER_LOCATION"))
        .await
        .unwrap();
    assert_eq!(position["data"]["status"], "IN_PROGRESS");
    assert_eq!(position["data"]["target"], "destination");

    engine.complete_ride(driver_user, ride.id).await.unwrap();
    phone.expect("RIDE_COMPLETED").await;

    // positions of a finished ride go nowhere
    frames.send(json!({
        "type": "location_update",
        "latitude": ride.destination.coordinates.latitude,
        "longitude": ride.destination.coordinates.longitude,
    }));
    assert_quiet(&mut phone, "DRIVER_LOCATION").await;
}
