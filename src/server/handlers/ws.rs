//! Live connections. The first frame must be `{"type":"auth","token":...}`; after
//! `auth_ok` the socket is registered and driven by three tasks: a writer draining
//! the outbound queue, the connection's listen loop and its heartbeat.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::IntoResponse;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};

use crate::api::DriverAPI;
use crate::auth::{Platform, User};
use crate::connection::{
    ClientMessage, Connection, ConnectionRegistry, Frame, OutboundMessage, ServerMessage,
    CLOSE_POLICY_VIOLATION,
};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Subscription key the location ingestion listens on.
const LOCATIONS: &str = "locations";
const WRITER_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
enum Side {
    Driver,
    Passenger,
}

impl Side {
    fn permission(&self) -> &'static str {
        match self {
            Self::Driver => "connect_driver",
            Self::Passenger => "connect_passenger",
        }
    }

    fn registry<'a>(&self, engine: &'a Engine) -> &'a ConnectionRegistry {
        match self {
            Self::Driver => engine.drivers(),
            Self::Passenger => engine.passengers(),
        }
    }
}

pub async fn driver(
    ws: WebSocketUpgrade,
    Extension(engine): Extension<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(engine, socket, Side::Driver))
}

pub async fn passenger(
    ws: WebSocketUpgrade,
    Extension(engine): Extension<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(engine, socket, Side::Passenger))
}

fn into_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => Frame::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(payload) => Frame::Pong(payload),
        Message::Close(_) => Frame::Close,
    }
}

fn into_message(message: OutboundMessage) -> Message {
    match message {
        OutboundMessage::Text(text) => Message::Text(text),
        OutboundMessage::Ping(payload) => Message::Ping(payload),
        OutboundMessage::Close(frame) => Message::Close(frame.map(|(code, reason)| CloseFrame {
            code,
            reason: Cow::Owned(reason),
        })),
    }
}

async fn handshake(
    engine: &Engine,
    stream: &mut SplitStream<WebSocket>,
    side: Side,
) -> Result<User> {
    let first = tokio::time::timeout(engine.timeouts().auth_handshake, stream.next())
        .await
        .map_err(|_| Error::Unauthorized)?;

    let token = match first {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token }) => token,
            _ => return Err(Error::Unauthorized),
        },
        _ => return Err(Error::Unauthorized),
    };

    let user = engine.authenticate(&token).await?;
    engine.authorize(user.clone(), side.permission(), Platform::default())?;

    Ok(user)
}

#[tracing::instrument(skip(engine, socket))]
async fn session(engine: Arc<Engine>, socket: WebSocket, side: Side) {
    let (mut sink, mut stream) = socket.split();

    let user = match handshake(&engine, &mut stream, side).await {
        Ok(user) => user,
        Err(err) => {
            tracing::info!(error = %err, "websocket handshake rejected");
            let close = Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: Cow::Owned(err.to_string()),
            }));
            let _ = sink.send(close).await;
            return;
        }
    };

    let ok = match serde_json::to_string(&ServerMessage::AuthOk) {
        Ok(ok) => ok,
        Err(err) => {
            tracing::error!(error = %err, "auth_ok not encodable");
            return;
        }
    };
    if sink.send(Message::Text(ok)).await.is_err() {
        return;
    }

    let registry = side.registry(&engine);
    let (connection, mut outbound) = Connection::new(user.id, engine.timeouts().connection());
    if registry.register(connection.clone()).is_some() {
        tracing::info!(user_id = %user.id, "replaced an older connection");
    }

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, OutboundMessage::Close(_));
            if sink.send(into_message(message)).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let heartbeat = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.heartbeat().await })
    };

    if let Side::Driver = side {
        tokio::spawn(ingest_locations(engine.clone(), user.clone(), connection.clone()));
    }

    tracing::info!(user_id = %user.id, connection_id = %connection.id(), "connection open");

    let frames = stream.map(|message| message.map(into_frame));
    if let Err(err) = connection.listen(frames).await {
        tracing::debug!(error = %err, "connection ended with an error");
    }

    registry.remove(&connection);
    heartbeat.abort();
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::info!(user_id = %user.id, connection_id = %connection.id(), "connection closed");
}

/// Stores every `location_update` a driver sends.
async fn ingest_locations(engine: Arc<Engine>, user: User, connection: Arc<Connection>) {
    let mut subscription = match connection.subscribe(LOCATIONS) {
        Ok(subscription) => subscription,
        Err(_) => return,
    };

    while let Ok(message) = subscription.recv().await {
        if let Ok(ClientMessage::LocationUpdate(location)) = serde_json::from_value(message) {
            if let Err(err) = engine
                .update_location(user.clone(), connection.entity_id(), location)
                .await
            {
                tracing::warn!(driver_id = %connection.entity_id(), error = %err, "location not stored");
            }
        }
    }
}
