//! Events exchanged between the ride, driver and dispatch sides, and the
//! in-process broker that carries them.

mod events;
mod memory;

pub use events::{
    DriverInfo, DriverMatchResponse, DriverStatusUpdate, Event, RideRequested, RideStatusUpdate,
    Topic,
};
pub use memory::InMemoryBroker;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

pub type DynPublisher = std::sync::Arc<dyn Publisher>;
