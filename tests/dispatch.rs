mod common;

use serde_json::json;

use common::{dispatch_request, engine, online_driver, passenger, request_ride, spawn_driver, Client};
use vectura::broker::{Event, Topic};
use vectura::entities::{DriverStatus, Location, RideStatus};
use vectura::error::Error;

#[tokio::test(start_paused = true)]
async fn accepted_offer_matches_ride_and_reserves_driver() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;

    let mut phone = Client::connect(engine.passengers(), rider.id);
    let mut seen = spawn_driver(Client::connect(engine.drivers(), driver.id), true);

    let matched = engine.dispatch(dispatch_request(&ride, None)).await.unwrap();

    assert_eq!(matched.status, RideStatus::Matched);
    assert_eq!(matched.driver_id, Some(driver.id));
    assert!(matched.matched_at.is_some());

    let driver = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Busy);

    let push = phone.expect("DRIVER_MATCHED").await;
    assert_eq!(push["data"]["ride_id"], ride.id.to_string());
    assert_eq!(push["data"]["driver"]["license_number"], "AB123456");

    let offer = seen.recv().await.unwrap();
    assert_eq!(offer["type"], "ride_offer");
    assert_eq!(offer["ride_id"], ride.id.to_string());
    let details = seen.recv().await.unwrap();
    assert_eq!(details["type"], "ride_details");
}

#[tokio::test(start_paused = true)]
async fn declined_offer_moves_on_to_the_next_candidate() {
    let (engine, broker) = engine();
    let responses = broker.consumer(Topic::DriverMatchResponse);

    let (_, near) = online_driver(&engine, "AA000001", Location::new(43.2221, 76.8511)).await;
    let (_, far) = online_driver(&engine, "AA000002", Location::new(43.230, 76.860)).await;
    let ride = request_ride(&engine, &passenger()).await;

    let _near = spawn_driver(Client::connect(engine.drivers(), near.id), false);
    let _far = spawn_driver(Client::connect(engine.drivers(), far.id), true);

    let matched = engine.dispatch(dispatch_request(&ride, None)).await.unwrap();
    assert_eq!(matched.driver_id, Some(far.id));

    let answers: Vec<(uuid::Uuid, bool)> = (0..2)
        .map(|_| match responses.try_recv().unwrap() {
            Event::DriverMatchResponse(response) => (response.driver_id, response.accepted),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(answers, vec![(near.id, false), (far.id, true)]);

    let near = engine.store().drivers.get(near.id).await.unwrap();
    assert_eq!(near.status, DriverStatus::Available);
}

#[tokio::test(start_paused = true)]
async fn search_times_out_and_leaves_ride_requested() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let ride = request_ride(&engine, &passenger()).await;

    let mut seen = spawn_driver(Client::connect(engine.drivers(), driver.id), false);

    let err = engine
        .dispatch(dispatch_request(&ride, Some(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DriverSearchTimeout));

    let ride = engine.store().rides.get(ride.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Requested);
    assert!(ride.driver_id.is_none());

    // the driver was asked again on later passes
    let mut offers = 0;
    while let Ok(message) = seen.try_recv() {
        if message["type"] == "ride_offer" {
            offers += 1;
        }
    }
    assert!(offers >= 2);
}

#[tokio::test(start_paused = true)]
async fn no_drivers_nearby_times_out() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(44.0, 77.5)).await;
    let ride = request_ride(&engine, &passenger()).await;
    let _driver = spawn_driver(Client::connect(engine.drivers(), driver.id), true);

    let err = engine
        .dispatch(dispatch_request(&ride, Some(2)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DriverSearchTimeout));
}

#[tokio::test(start_paused = true)]
async fn concurrent_dispatches_reserve_a_driver_once() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let first = request_ride(&engine, &passenger()).await;
    let second = request_ride(&engine, &passenger()).await;

    let _driver = spawn_driver(Client::connect(engine.drivers(), driver.id), true);

    let (a, b) = tokio::join!(
        engine.dispatch(dispatch_request(&first, Some(3))),
        engine.dispatch(dispatch_request(&second, Some(3))),
    );

    let winners = [&a, &b].iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(Error::DriverSearchTimeout)));

    let driver = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Busy);

    let statuses = [
        engine.store().rides.get(first.id).await.unwrap().status,
        engine.store().rides.get(second.id).await.unwrap().status,
    ];
    assert!(statuses.contains(&RideStatus::Matched));
    assert!(statuses.contains(&RideStatus::Requested));
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_ride_stops_its_search() {
    use vectura::api::RideAPI;

    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let rider = passenger();
    let ride = request_ride(&engine, &rider).await;

    // a driver that never answers
    let mut silent = Client::connect(engine.drivers(), driver.id);

    let search = tokio::spawn({
        let engine = engine.clone();
        let request = dispatch_request(&ride, None);
        async move { engine.dispatch(request).await }
    });

    silent.expect("ride_offer").await;
    let cancelled = engine
        .cancel_ride(rider, ride.id, Some("changed plans".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);

    assert!(matches!(search.await.unwrap(), Err(Error::Cancelled)));

    let driver = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Available);
}

#[tokio::test(start_paused = true)]
async fn reply_to_an_earlier_offer_is_ignored() {
    let (engine, _broker) = engine();
    let (_, driver) = online_driver(&engine, "AB123456", Location::new(43.223, 76.852)).await;
    let ride = request_ride(&engine, &passenger()).await;
    let mut car = Client::connect(engine.drivers(), driver.id);

    let search = tokio::spawn({
        let engine = engine.clone();
        let request = dispatch_request(&ride, Some(8));
        async move { engine.dispatch(request).await }
    });

    // the first offer lapses, the next pass offers again
    let first = car.expect("ride_offer").await;
    let second = car.expect("ride_offer").await;
    assert_ne!(first["offer_id"], second["offer_id"]);

    car.send(json!({
        "type": "ride_response",
        "offer_id": first["offer_id"],
        "ride_id": first["ride_id"],
        "accepted": true,
    }));

    assert!(matches!(search.await.unwrap(), Err(Error::DriverSearchTimeout)));

    let ride = engine.store().rides.get(ride.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Requested);
    let driver = engine.store().drivers.get(driver.id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Available);
}
