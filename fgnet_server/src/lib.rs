//! `fgnet_server`
//!
//! Server-side systems:
//! - Fixed timestep session loop (authority role)
//! - One player per connection, spawned on join
//! - Validates combat requests and relays movement
//!
//! Networking model:
//! - TCP: handshake plus every reliable gameplay message
//! - UDP: movement sync and latency probes

pub mod server;

pub use server::GameServer;
