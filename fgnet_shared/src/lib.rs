//! `fgnet_shared`
//!
//! Actor core shared by client and server.
//!
//! Design goals:
//! - One fixed-rate tick per session, single threaded, nothing blocks.
//! - The authority is the only writer of replicated counters; everyone
//!   else reads replicas and reconciles speculative effects.
//! - Traits at the seams (transport, movement resolver, presentation).
//! - No `unsafe`.

pub mod combat;
pub mod config;
pub mod console;
pub mod interp;
pub mod math;
pub mod movement;
pub mod net;
pub mod physics;
pub mod player;
pub mod pool;
pub mod presentation;
pub mod replica;
pub mod session;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::combat::FireDeclined;
    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::movement::{InputButtons, InputIntent};
    pub use crate::net::*;
    pub use crate::player::{Pickup, Player};
    pub use crate::pool::{PoolError, RocketHandle};
    pub use crate::presentation::{NullPresentation, Presentation, RecordingPresentation};
    pub use crate::session::{Session, SessionError};
    pub use crate::transport::{QueuedTransport, SimNetwork, Target, Transport};
}
