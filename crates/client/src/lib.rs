//! Relay networking for the hornet tunnel.
//!
//! This crate owns everything that talks to relays:
//! - [`RelayConnection`]: one WebSocket to one relay, with its
//!   subscription lifecycle and per-request pins
//! - [`RelayPool`]: the fixed initial relay set plus a bounded LRU of
//!   opportunistic hint relays, publish fan-out and ingest multiplexing

mod error;
mod pool;
mod relay;

pub use error::{ClientError, Result};
pub use pool::{PoolConfig, RelayPool};
pub use relay::{
    ConnectionState, DedupHook, EventSink, IncomingEvent, RelayConfig, RelayConnection,
    SubscriptionFilter, normalize_relay_url,
};
