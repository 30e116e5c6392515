//! `fgnet_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Input capture and intent generation
//! - Local prediction through a peer session
//! - Latency probing for the debug widget

pub mod client;
pub mod input;

pub use client::GameClient;
