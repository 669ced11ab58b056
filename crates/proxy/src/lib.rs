//! HTTP-to-relay tunnel proxy.
//!
//! The gateway accepts ordinary HTTP requests, encodes each one as
//! encrypted gift-wrapped events addressed to a destination public key,
//! publishes them across the relay pool, and completes the HTTP
//! response once the matching encrypted response parts have been
//! reassembled.

pub mod config;
pub mod egress;
pub mod gateway;
pub mod ingress;
pub mod pending;
pub mod watcher;
pub mod windows;
