//! # gogo-server
//!
//! Real-time delivery hub for the gogo chat system.
//!
//! - **Hub**: registry of online users plus the routing stage that
//!   validates, persists, caches and fans out every chat payload
//! - **Connections**: per-client inbound, outbound and liveness pumps
//! - **Transport**: direct in-process ingestion or a durable broker
//!   (Redis Streams, or Kafka with the `kafka` feature)
//! - **REST API** (axum): WebSocket entry point, explicit logout, presence
//!   lookup and cache-aside history reads

pub mod api;
pub mod broker;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod transport;
pub mod validator;

#[cfg(test)]
mod test_support;
