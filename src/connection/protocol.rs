use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::entities::{Coordinates, Location, Ride, RideOffer};

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// An inbound frame, independent of the socket library.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Ping(Vec<u8>),
    Close(Option<(u16, String)>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    RideResponse {
        offer_id: Uuid,
        ride_id: Uuid,
        accepted: bool,
        #[serde(default)]
        current_location: Option<Coordinates>,
    },
    LocationUpdate(Location),
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk,
    RideOffer(RideOffer),
    RideDetails(Ride),
    Error { message: String },
}

/// Passenger-bound notification: `{"type": <event>, "data": {...}}`.
pub fn push(event: &str, data: Value) -> Value {
    json!({ "type": event, "data": data })
}

/// The key a reply is routed by: `correlation_id`, falling back to `offer_id`.
pub fn correlation_key(message: &Value) -> Option<&str> {
    message
        .get("correlation_id")
        .or_else(|| message.get("offer_id"))
        .and_then(Value::as_str)
}

#[test]
fn client_messages_parse_from_wire_frames() {
    let auth: ClientMessage =
        serde_json::from_str(r#"{"type":"auth","token":"Bearer abc"}"#).unwrap();
    assert_eq!(
        auth,
        ClientMessage::Auth {
            token: "Bearer abc".into()
        }
    );

    let offer_id = Uuid::new_v4();
    let ride_id = Uuid::new_v4();
    let response: ClientMessage = serde_json::from_value(json!({
        "type": "ride_response",
        "offer_id": offer_id,
        "ride_id": ride_id,
        "accepted": true,
        "current_location": { "latitude": 43.2, "longitude": 76.8 }
    }))
    .unwrap();
    match response {
        ClientMessage::RideResponse {
            offer_id: o,
            accepted,
            current_location,
            ..
        } => {
            assert_eq!(o, offer_id);
            assert!(accepted);
            assert_eq!(current_location.unwrap().latitude, 43.2);
        }
        other => panic!("unexpected message {other:?}"),
    }

    let update: ClientMessage = serde_json::from_str(
        r#"{"type":"location_update","latitude":43.2,"longitude":76.8,"speed_kmh":40.0}"#,
    )
    .unwrap();
    match update {
        ClientMessage::LocationUpdate(location) => {
            assert_eq!(location.coordinates.longitude, 76.8);
            assert_eq!(location.speed_kmh, Some(40.0));
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[test]
fn correlation_key_prefers_correlation_id() {
    let tagged = json!({"type": "ride_response", "offer_id": "o-1", "correlation_id": "c-1"});
    assert_eq!(correlation_key(&tagged), Some("c-1"));

    let offer = json!({"type": "ride_response", "offer_id": "o-1"});
    assert_eq!(correlation_key(&offer), Some("o-1"));

    let untagged = json!({"type": "location_update", "latitude": 1.0});
    assert_eq!(correlation_key(&untagged), None);
}

#[test]
fn server_messages_carry_their_type() {
    let ok = serde_json::to_value(ServerMessage::AuthOk).unwrap();
    assert_eq!(ok, json!({"type": "auth_ok"}));

    let pushed = push("DRIVER_MATCHED", json!({"driver_id": "d"}));
    assert_eq!(pushed["type"], "DRIVER_MATCHED");
    assert_eq!(pushed["data"]["driver_id"], "d");
}
