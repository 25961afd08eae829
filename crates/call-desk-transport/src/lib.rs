//! Gateway transport for the call desk agent client.
//!
//! Provides:
//! - Wire protocol (tagged JSON, lenient inbound decoding)
//! - `ConnectionManager` - reconnecting WebSocket with heartbeat
//! - `MessageRouter` - inbound frames into the insight store

pub mod backoff;
pub mod connection;
pub mod protocol;
pub mod router;

pub use connection::{ConnectionManager, InboundFrame, TransportError};
pub use protocol::{InboundEvent, OutboundMessage, ProtocolError};
pub use router::{MessageRouter, RouteOutcome};
