use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::collections::HashMap;

use super::{Event, Publisher, Topic};
use crate::error::{Error, Result};

const QUEUE_CAPACITY: usize = 1024;

/// One bounded queue per topic. Consumers of a topic compete for its events; events
/// published while a topic has no consumer are dropped.
pub struct InMemoryBroker {
    queues: HashMap<Topic, (Sender<Event>, Receiver<Event>)>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let queues = Topic::ALL
            .iter()
            .map(|topic| (*topic, async_channel::bounded(QUEUE_CAPACITY)))
            .collect();

        Self { queues }
    }

    pub fn consumer(&self, topic: Topic) -> Receiver<Event> {
        self.queues[&topic].1.clone()
    }

    /// Stops every consumer; pending events are dropped.
    pub fn close(&self) {
        for (sender, _) in self.queues.values() {
            sender.close();
        }
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, event: Event) -> Result<()> {
        let topic = event.topic();
        let (sender, _) = &self.queues[&topic];

        // the broker's own receiver is always counted
        if sender.receiver_count() <= 1 && !sender.is_closed() {
            tracing::debug!(topic = topic.name(), "no consumer, event dropped");
            return Ok(());
        }

        tracing::debug!(topic = topic.name(), "publishing event");
        sender
            .send(event)
            .await
            .map_err(|_| Error::Broker(format!("topic {} is closed", topic.name())))
    }
}

#[tokio::test]
async fn consumers_compete_per_topic() {
    use super::DriverStatusUpdate;
    use crate::entities::DriverStatus;
    use chrono::Utc;
    use uuid::Uuid;

    let broker = InMemoryBroker::new();
    let a = broker.consumer(Topic::DriverStatusUpdate);
    let b = broker.consumer(Topic::DriverStatusUpdate);
    let rides = broker.consumer(Topic::RideStatusUpdate);

    for _ in 0..2 {
        broker
            .publish(
                DriverStatusUpdate {
                    driver_id: Uuid::new_v4(),
                    status: DriverStatus::Available,
                    ride_id: None,
                    timestamp: Utc::now(),
                }
                .into(),
            )
            .await
            .unwrap();
    }

    assert!(a.recv().await.is_ok());
    assert!(b.recv().await.is_ok());
    assert!(a.try_recv().is_err());
    assert!(rides.try_recv().is_err());

    broker.close();
    assert!(broker
        .publish(
            DriverStatusUpdate {
                driver_id: Uuid::new_v4(),
                status: DriverStatus::Offline,
                ride_id: None,
                timestamp: Utc::now(),
            }
            .into()
        )
        .await
        .is_err());
    assert!(a.recv().await.is_err());
}
