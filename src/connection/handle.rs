use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{correlation_key, Frame, OutboundMessage, ServerMessage, CLOSE_GOING_AWAY};
use super::ConnectionConfig;
use crate::error::{Error, Result};

struct Slot {
    serial: u64,
    tx: mpsc::Sender<Value>,
}

struct State {
    subscriptions: HashMap<String, Slot>,
    next_serial: u64,
    last_seen: Instant,
}

/// One live socket to a driver or passenger.
///
/// The socket's writer task drains the receiver returned by [`Connection::new`];
/// the reader task drives [`Connection::listen`]. Subscription map and liveness
/// timestamp share one lock.
pub struct Connection {
    id: Uuid,
    entity_id: Uuid,
    outbound: mpsc::Sender<OutboundMessage>,
    state: Mutex<State>,
    closed: CancellationToken,
    config: ConnectionConfig,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("entity_id", &self.entity_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(
        entity_id: Uuid,
        config: ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::channel(config.outbound_capacity);

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            entity_id,
            outbound,
            state: Mutex::new(State {
                subscriptions: HashMap::new(),
                next_serial: 0,
                last_seen: Instant::now(),
            }),
            closed: CancellationToken::new(),
            config,
        });

        (connection, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn last_seen(&self) -> Instant {
        self.state.lock().last_seen
    }

    fn touch(&self) {
        self.state.lock().last_seen = Instant::now();
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("connection closed".into()));
        }

        match tokio::time::timeout(self.config.send_timeout, self.outbound.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.close();
                Err(Error::Connection("socket writer has gone away".into()))
            }
            Err(_) => Err(Error::Connection("outbound queue is full".into())),
        }
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.send(OutboundMessage::Text(text)).await
    }

    /// Opens a response slot for `correlation_id`. The slot is released when the
    /// returned guard drops. Subscribing twice to one id replaces the earlier slot,
    /// whose waiter then observes cancellation.
    pub fn subscribe(self: &Arc<Self>, correlation_id: impl Into<String>) -> Result<Subscription> {
        let correlation_id = correlation_id.into();
        let (tx, rx) = mpsc::channel(self.config.subscription_capacity);

        let serial = {
            let mut state = self.state.lock();
            // checked under the lock so close() cannot miss a slot
            if self.is_closed() {
                return Err(Error::Cancelled);
            }
            state.next_serial += 1;
            let serial = state.next_serial;
            state
                .subscriptions
                .insert(correlation_id.clone(), Slot { serial, tx });
            serial
        };

        Ok(Subscription {
            connection: self.clone(),
            correlation_id,
            serial,
            rx,
        })
    }

    pub fn unsubscribe(&self, correlation_id: &str) {
        self.state.lock().subscriptions.remove(correlation_id);
    }

    fn release(&self, correlation_id: &str, serial: u64) {
        let mut state = self.state.lock();
        if matches!(state.subscriptions.get(correlation_id), Some(slot) if slot.serial == serial) {
            state.subscriptions.remove(correlation_id);
        }
    }

    /// Closes the connection. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.close_with(CLOSE_GOING_AWAY, "closing")
    }

    pub fn close_with(&self, code: u16, reason: &str) -> bool {
        let subscriptions = {
            let mut state = self.state.lock();
            if self.closed.is_cancelled() {
                return false;
            }
            self.closed.cancel();
            std::mem::take(&mut state.subscriptions)
        };

        // dropping the senders wakes every pending waiter with a cancellation
        drop(subscriptions);

        let _ = self
            .outbound
            .try_send(OutboundMessage::Close(Some((code, reason.to_string()))));

        tracing::debug!(connection_id = %self.id, entity_id = %self.entity_id, code, reason, "connection closed");
        true
    }

    /// Reads frames until the stream ends, errors, or the connection is closed,
    /// fanning every text frame out to the matching subscriptions. The connection
    /// is always closed on return.
    pub async fn listen<S, E>(&self, mut frames: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Frame, E>> + Unpin,
        E: Display,
    {
        let result = loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break Ok(()),
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(Frame::Text(text))) => {
                    self.touch();
                    self.dispatch(&text).await;
                }
                Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => self.touch(),
                Some(Ok(Frame::Close)) | None => break Ok(()),
                Some(Err(err)) => {
                    tracing::warn!(connection_id = %self.id, entity_id = %self.entity_id, error = %err, "socket read failed");
                    break Err(Error::Connection(err.to_string()));
                }
            }
        };

        self.close();
        result
    }

    async fn dispatch(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(connection_id = %self.id, error = %err, "dropping undecodable frame");
                let reply = ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                };
                let _ = self.send_json(&reply).await;
                return;
            }
        };

        let targets: Vec<(String, mpsc::Sender<Value>)> = {
            let state = self.state.lock();
            match correlation_key(&message) {
                Some(key) => state
                    .subscriptions
                    .get(key)
                    .map(|slot| (key.to_string(), slot.tx.clone()))
                    .into_iter()
                    .collect(),
                None => state
                    .subscriptions
                    .iter()
                    .map(|(key, slot)| (key.clone(), slot.tx.clone()))
                    .collect(),
            }
        };

        let deadline = self.config.fanout_deadline;
        let deliveries = targets.into_iter().map(|(key, tx)| {
            let message = message.clone();
            async move {
                if tokio::time::timeout(deadline, tx.send(message)).await.is_err() {
                    tracing::warn!(connection_id = %self.id, correlation_id = %key, "subscriber too slow, frame dropped");
                }
            }
        });

        futures::future::join_all(deliveries).await;
    }

    /// Pings every `heartbeat_interval` and closes the connection once nothing has
    /// been received for `idle_timeout`.
    pub async fn heartbeat(&self) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }

            let idle = Instant::now().duration_since(self.last_seen());
            if idle >= self.config.idle_timeout {
                tracing::info!(connection_id = %self.id, entity_id = %self.entity_id, idle_secs = idle.as_secs(), "closing idle connection");
                self.close();
                return;
            }

            if self.outbound.try_send(OutboundMessage::Ping(Vec::new())).is_err() {
                tracing::debug!(connection_id = %self.id, "heartbeat ping skipped");
            }
        }
    }
}

/// A correlation-keyed response slot. Dropping it unsubscribes.
pub struct Subscription {
    connection: Arc<Connection>,
    correlation_id: String,
    serial: u64,
    rx: mpsc::Receiver<Value>,
}

impl Subscription {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Next message for this slot; `Error::Cancelled` once the connection closes.
    pub async fn recv(&mut self) -> Result<Value> {
        self.rx.recv().await.ok_or(Error::Cancelled)
    }

    /// `Ok(None)` when nothing arrives within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Value>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(message) => message.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connection.release(&self.correlation_id, self.serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::unbounded;
    use serde_json::json;
    use std::convert::Infallible;

    fn open() -> (Arc<Connection>, mpsc::Receiver<OutboundMessage>) {
        Connection::new(Uuid::new_v4(), ConnectionConfig::default())
    }

    fn text(value: Value) -> std::result::Result<Frame, Infallible> {
        Ok(Frame::Text(value.to_string()))
    }

    #[tokio::test]
    async fn tagged_reply_reaches_only_its_subscriber() {
        let (conn, _rx) = open();
        let mut first = conn.subscribe("offer-1").unwrap();
        let mut second = conn.subscribe("offer-2").unwrap();

        let (frames, stream) = unbounded();
        let listener = tokio::spawn({
            let conn = conn.clone();
            async move { conn.listen(stream).await }
        });

        frames
            .unbounded_send(text(json!({"type": "ride_response", "offer_id": "offer-1", "accepted": true})))
            .unwrap();

        let reply = first.recv().await.unwrap();
        assert_eq!(reply["accepted"], true);
        assert!(second
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        drop(frames);
        listener.await.unwrap().unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn untagged_frames_fan_out_to_every_subscriber() {
        let (conn, _rx) = open();
        let mut a = conn.subscribe("a").unwrap();
        let mut b = conn.subscribe("b").unwrap();

        conn.dispatch(&json!({"type": "location_update", "latitude": 1.0, "longitude": 2.0}).to_string())
            .await;

        assert_eq!(a.recv().await.unwrap()["type"], "location_update");
        assert_eq!(b.recv().await.unwrap()["type"], "location_update");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_does_not_stall_the_others() {
        let config = ConnectionConfig {
            subscription_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (conn, _rx) = Connection::new(Uuid::new_v4(), config);
        let _stuck = conn.subscribe("stuck").unwrap();
        let mut live = conn.subscribe("live").unwrap();

        let frame = json!({"type": "location_update"}).to_string();
        conn.dispatch(&frame).await;
        assert!(live.recv().await.is_ok());

        // "stuck" is full now; the next frame must still reach "live"
        let started = Instant::now();
        conn.dispatch(&frame).await;
        assert!(started.elapsed() <= Duration::from_millis(150));
        assert!(live.recv().await.is_ok());
    }

    #[tokio::test]
    async fn closing_cancels_pending_waits() {
        let (conn, mut rx) = open();
        let mut sub = conn.subscribe("offer").unwrap();

        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;

        assert!(conn.close());
        assert!(!conn.close());
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Close(_))));
        assert!(matches!(conn.subscribe("late"), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn read_error_terminates_connection() {
        let (conn, _rx) = open();
        let mut sub = conn.subscribe("offer").unwrap();

        let (frames, stream) = unbounded::<std::result::Result<Frame, String>>();
        frames.unbounded_send(Err("reset by peer".into())).unwrap();

        let err = conn.listen(stream).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(conn.is_closed());
        assert!(matches!(sub.recv().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let (conn, _rx) = open();
        {
            let _sub = conn.subscribe("offer").unwrap();
            assert_eq!(conn.subscription_count(), 1);
        }
        assert_eq!(conn.subscription_count(), 0);

        // a replaced slot's guard must not remove its successor
        let old = conn.subscribe("offer").unwrap();
        let _new = conn.subscribe("offer").unwrap();
        drop(old);
        assert_eq!(conn.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_then_closes_idle_connection() {
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(75),
            ..ConnectionConfig::default()
        };
        let (conn, mut rx) = Connection::new(Uuid::new_v4(), config);

        let heartbeat = tokio::spawn({
            let conn = conn.clone();
            async move { conn.heartbeat().await }
        });

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(rx.try_recv(), Ok(OutboundMessage::Ping(_))));
        assert!(!conn.is_closed());

        tokio::time::sleep(Duration::from_secs(60)).await;
        heartbeat.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_keep_connection_alive() {
        let (conn, _rx) = open();

        let heartbeat = tokio::spawn({
            let conn = conn.clone();
            async move { conn.heartbeat().await }
        });

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(29)).await;
            conn.touch();
        }
        assert!(!conn.is_closed());

        conn.close();
        heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_frame_gets_an_error_reply() {
        let (conn, mut rx) = open();
        let frames = futures::stream::iter(vec![Ok::<_, Infallible>(Frame::Text("{nope".into()))]);

        conn.listen(frames).await.unwrap();

        match rx.try_recv() {
            Ok(OutboundMessage::Text(text)) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(reply["type"], "error");
            }
            other => panic!("unexpected outbound {other:?}"),
        }
    }
}
