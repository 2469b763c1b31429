use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::protocol::CLOSE_POLICY_VIOLATION;
use super::Connection;
use crate::error::{Error, Result};

/// Live connections of one audience (drivers or passengers), keyed by entity id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    name: &'static str,
    connections: DashMap<Uuid, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            connections: DashMap::new(),
        }
    }

    /// Installs `connection` for its entity id and closes whatever it replaced.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let entity_id = connection.entity_id();
        let previous = self.connections.insert(entity_id, connection);

        if let Some(old) = &previous {
            old.close_with(CLOSE_POLICY_VIOLATION, "replaced by a newer connection");
            tracing::info!(registry = self.name, %entity_id, old_connection = %old.id(), "connection replaced");
        } else {
            tracing::info!(registry = self.name, %entity_id, "connection registered");
        }

        previous
    }

    pub fn deregister(&self, entity_id: Uuid) -> Result<()> {
        let (_, connection) = self
            .connections
            .remove(&entity_id)
            .ok_or_else(|| Error::not_found("connection", entity_id))?;

        connection.close();
        tracing::info!(registry = self.name, %entity_id, "connection deregistered");
        Ok(())
    }

    /// Removes `connection` only if it is still the one registered for its entity,
    /// so a replaced socket shutting down leaves its successor alone.
    pub fn remove(&self, connection: &Connection) -> bool {
        self.connections
            .remove_if(&connection.entity_id(), |_, current| {
                current.id() == connection.id()
            })
            .is_some()
    }

    pub fn get(&self, entity_id: Uuid) -> Result<Arc<Connection>> {
        self.connections
            .get(&entity_id)
            .map(|entry| entry.value().clone())
            .filter(|connection| !connection.is_closed())
            .ok_or_else(|| Error::not_found("connection", entity_id))
    }

    pub fn is_connected(&self, entity_id: Uuid) -> bool {
        self.get(entity_id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub async fn send_to<T: Serialize + ?Sized>(&self, entity_id: Uuid, message: &T) -> Result<()> {
        let connection = self.get(entity_id)?;
        connection.send_json(message).await
    }

    /// Sends `message` and waits up to `timeout` for the reply tagged with
    /// `correlation_id`. `Ok(None)` on timeout.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        entity_id: Uuid,
        correlation_id: &str,
        message: &T,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let connection = self.get(entity_id)?;
        let mut subscription = connection.subscribe(correlation_id)?;

        connection.send_json(message).await?;
        subscription.recv_timeout(timeout).await
    }

    /// Closes and forgets every connection.
    pub fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.close();
                closed += 1;
            }
        }

        tracing::info!(registry = self.name, closed, "connections drained");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, Frame, OutboundMessage};
    use futures::channel::mpsc::unbounded;
    use serde_json::json;

    #[tokio::test]
    async fn register_replaces_and_closes_exactly_one() {
        let registry = ConnectionRegistry::new("drivers");
        let entity = Uuid::new_v4();

        let (first, _rx1) = Connection::new(entity, ConnectionConfig::default());
        let (second, _rx2) = Connection::new(entity, ConnectionConfig::default());
        let (other, _rx3) = Connection::new(Uuid::new_v4(), ConnectionConfig::default());

        assert!(registry.register(first.clone()).is_none());
        registry.register(other.clone());
        let replaced = registry.register(second.clone()).unwrap();

        assert_eq!(replaced.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(!other.is_closed());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(entity).unwrap().id(), second.id());

        // the replaced socket exiting must not evict its successor
        assert!(!registry.remove(&first));
        assert_eq!(registry.get(entity).unwrap().id(), second.id());
        assert!(registry.remove(&second));
    }

    #[tokio::test]
    async fn deregister_and_send_to_unknown_are_not_found() {
        let registry = ConnectionRegistry::new("passengers");
        let entity = Uuid::new_v4();

        assert!(registry.deregister(entity).unwrap_err().is_not_found());
        assert!(registry
            .send_to(entity, &json!({"type": "ping"}))
            .await
            .unwrap_err()
            .is_not_found());

        let (conn, _rx) = Connection::new(entity, ConnectionConfig::default());
        registry.register(conn.clone());
        registry.deregister(entity).unwrap();
        assert!(conn.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn send_to_pushes_json() {
        let registry = ConnectionRegistry::new("passengers");
        let entity = Uuid::new_v4();
        let (conn, mut rx) = Connection::new(entity, ConnectionConfig::default());
        registry.register(conn);

        registry
            .send_to(entity, &json!({"type": "RIDE_MATCHED"}))
            .await
            .unwrap();

        match rx.recv().await {
            Some(OutboundMessage::Text(text)) => assert!(text.contains("RIDE_MATCHED")),
            other => panic!("unexpected outbound {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_waits_for_correlated_reply() {
        let registry = Arc::new(ConnectionRegistry::new("drivers"));
        let entity = Uuid::new_v4();
        let (conn, mut outbound) = Connection::new(entity, ConnectionConfig::default());
        registry.register(conn.clone());

        let (frames, stream) = unbounded::<std::result::Result<Frame, String>>();
        tokio::spawn({
            let conn = conn.clone();
            async move { conn.listen(stream).await }
        });

        // fake driver: answer whatever offer arrives
        tokio::spawn(async move {
            while let Some(OutboundMessage::Text(text)) = outbound.recv().await {
                let offer: Value = serde_json::from_str(&text).unwrap();
                let reply = json!({
                    "type": "ride_response",
                    "offer_id": offer["offer_id"],
                    "accepted": false
                });
                frames
                    .unbounded_send(Ok(Frame::Text(reply.to_string())))
                    .unwrap();
            }
        });

        let reply = registry
            .request(
                entity,
                "offer-7",
                &json!({"type": "ride_offer", "offer_id": "offer-7"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply["offer_id"], "offer-7");
        assert_eq!(reply["accepted"], false);
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let registry = ConnectionRegistry::new("drivers");
        let mut held = Vec::new();
        for _ in 0..3 {
            let (conn, rx) = Connection::new(Uuid::new_v4(), ConnectionConfig::default());
            registry.register(conn.clone());
            held.push((conn, rx));
        }

        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
        assert!(held.iter().all(|(conn, _)| conn.is_closed()));
    }
}
