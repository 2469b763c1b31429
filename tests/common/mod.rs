#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedSender};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use vectura::api::{DriverAPI, NewRide, RideAPI};
use vectura::auth::{JwtValidator, User};
use vectura::broker::{InMemoryBroker, RideRequested};
use vectura::config::{DispatchConfig, Timeouts};
use vectura::connection::{Connection, ConnectionConfig, ConnectionRegistry, Frame, OutboundMessage};
use vectura::db::memory::MemoryStore;
use vectura::engine::Engine;
use vectura::entities::{Driver, Location, Ride, RideType};

pub const PICKUP: (f64, f64) = (43.222, 76.851);
pub const DESTINATION: (f64, f64) = (43.238, 76.889);

pub fn timeouts() -> Timeouts {
    Timeouts {
        offer: Duration::from_secs(5),
        search: Duration::from_secs(10),
        search_retry_interval: Duration::from_secs(1),
        ..Timeouts::default()
    }
}

pub fn engine() -> (Arc<Engine>, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let engine = Engine::new(
        MemoryStore::new().store(),
        broker.clone(),
        Arc::new(JwtValidator::new(b"test-secret")),
        timeouts(),
        DispatchConfig::default(),
    )
    .unwrap();

    (Arc::new(engine), broker)
}

pub fn passenger() -> User {
    User::new(Uuid::new_v4())
}

/// A registered driver, online at `location`.
pub async fn online_driver(engine: &Engine, license: &str, location: Location) -> (User, Driver) {
    let user = User::new(Uuid::new_v4());
    let driver = engine
        .register_driver(user.clone(), license.into(), RideType::Economy)
        .await
        .unwrap();
    engine
        .go_online(user.clone(), driver.id, Some(location))
        .await
        .unwrap();

    (user, driver)
}

pub async fn request_ride(engine: &Engine, user: &User) -> Ride {
    engine
        .create_ride(
            user.clone(),
            NewRide {
                pickup: Location::new(PICKUP.0, PICKUP.1),
                destination: Location::new(DESTINATION.0, DESTINATION.1),
                ride_type: RideType::Economy,
            },
        )
        .await
        .unwrap()
}

pub fn dispatch_request(ride: &Ride, timeout_seconds: Option<u64>) -> RideRequested {
    RideRequested {
        ride_id: ride.id,
        ride_number: ride.number.clone(),
        passenger_id: ride.passenger_id,
        pickup_location: ride.pickup.clone(),
        destination_location: ride.destination.clone(),
        ride_type: ride.ride_type,
        estimated_fare: ride.estimated_fare,
        max_distance_km: 5.0,
        timeout_seconds,
        correlation_id: Uuid::new_v4(),
        priority: ride.priority,
    }
}

/// The far end of a live connection, fed through a channel instead of a socket.
pub struct Client {
    pub connection: Arc<Connection>,
    outbound: mpsc::Receiver<OutboundMessage>,
    frames: UnboundedSender<Result<Frame, String>>,
}

impl Client {
    pub fn connect(registry: &ConnectionRegistry, entity_id: Uuid) -> Self {
        let (connection, outbound) = Connection::new(entity_id, ConnectionConfig::default());
        let (frames, stream) = unbounded();

        registry.register(connection.clone());
        tokio::spawn({
            let connection = connection.clone();
            async move { connection.listen(stream).await }
        });

        Self {
            connection,
            outbound,
            frames,
        }
    }

    pub fn send(&self, message: Value) {
        self.frames_handle().send(message);
    }

    /// Lets a test keep talking after the client has been handed to a task.
    pub fn frames_handle(&self) -> Frames {
        Frames(self.frames.clone())
    }

    pub async fn next(&mut self) -> Option<Value> {
        loop {
            match self.outbound.recv().await? {
                OutboundMessage::Text(text) => return serde_json::from_str(&text).ok(),
                _ => continue,
            }
        }
    }

    /// Skips ahead to the next message of type `kind`.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let message = self.next().await.expect("connection closed");
            if message["type"] == kind {
                return message;
            }
        }
    }
}

pub struct Frames(UnboundedSender<Result<Frame, String>>);

impl Frames {
    pub fn send(&self, message: Value) {
        self.0
            .unbounded_send(Ok(Frame::Text(message.to_string())))
            .unwrap();
    }
}

/// Answers every offer with `accept`, forwarding each message it sees.
pub fn spawn_driver(mut client: Client, accept: bool) -> mpsc::UnboundedReceiver<Value> {
    let (seen, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(message) = client.next().await {
            if message["type"] == "ride_offer" {
                client.send(json!({
                    "type": "ride_response",
                    "offer_id": message["offer_id"],
                    "ride_id": message["ride_id"],
                    "accepted": accept,
                }));
            }
            if seen.send(message).is_err() {
                break;
            }
        }
    });

    rx
}
