//! Live duplex channels to drivers and passengers.
//!
//! A [`Connection`] owns the outbound queue of one socket and the map of
//! correlation-keyed [`Subscription`]s fed by its listen loop. The
//! [`ConnectionRegistry`] keeps at most one live connection per entity id.

mod handle;
mod protocol;
mod registry;

pub use handle::{Connection, Subscription};
pub use protocol::{
    correlation_key, push, ClientMessage, Frame, OutboundMessage, ServerMessage,
    CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION,
};
pub use registry::ConnectionRegistry;

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Capacity of the per-connection outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of each subscription's inbound queue.
    pub subscription_capacity: usize,
    /// How long a push may wait for room in a full outbound queue.
    pub send_timeout: Duration,
    /// Per-subscriber delivery deadline in the listen loop.
    pub fanout_deadline: Duration,
    pub heartbeat_interval: Duration,
    /// A connection with no inbound frame for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            subscription_capacity: 16,
            send_timeout: Duration::from_secs(5),
            fanout_deadline: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(75),
        }
    }
}
