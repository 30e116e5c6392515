//! Presentation abstraction.
//!
//! This crate intentionally does not depend on a UI toolkit. HUD widgets
//! implement [`Presentation`] and receive push notifications when a
//! displayed value changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::net::ClientId;

/// Notifications consumed by the HUD / debug widget.
pub trait Presentation: Send {
    fn on_health_changed(&mut self, player: ClientId, health: i32);
    fn on_rocket_count_changed(&mut self, player: ClientId, rockets: i32);
    fn on_ping_updated(&mut self, ping_ms: u32);
    fn on_show_widget(&mut self);
    fn on_hide_widget(&mut self);
}

/// A no-op presentation useful for headless servers.
#[derive(Default)]
pub struct NullPresentation;

impl Presentation for NullPresentation {
    fn on_health_changed(&mut self, _player: ClientId, _health: i32) {}
    fn on_rocket_count_changed(&mut self, _player: ClientId, _rockets: i32) {}
    fn on_ping_updated(&mut self, _ping_ms: u32) {}
    fn on_show_widget(&mut self) {}
    fn on_hide_widget(&mut self) {}
}

/// One pushed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HudEvent {
    Health(ClientId, i32),
    Rockets(ClientId, i32),
    Ping(u32),
    Shown,
    Hidden,
}

/// Keeps every notification, for tests and replay tooling.
///
/// Clones share the same log, so a test can keep one clone while the
/// session owns another.
#[derive(Debug, Default, Clone)]
pub struct RecordingPresentation {
    events: Arc<Mutex<Vec<HudEvent>>>,
}

impl RecordingPresentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HudEvent> {
        self.log().to_vec()
    }

    pub fn last_rockets(&self, player: ClientId) -> Option<i32> {
        self.log().iter().rev().find_map(|e| match e {
            HudEvent::Rockets(p, r) if *p == player => Some(*r),
            _ => None,
        })
    }

    pub fn last_health(&self, player: ClientId) -> Option<i32> {
        self.log().iter().rev().find_map(|e| match e {
            HudEvent::Health(p, h) if *p == player => Some(*h),
            _ => None,
        })
    }

    fn log(&self) -> MutexGuard<'_, Vec<HudEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Presentation for RecordingPresentation {
    fn on_health_changed(&mut self, player: ClientId, health: i32) {
        self.log().push(HudEvent::Health(player, health));
    }

    fn on_rocket_count_changed(&mut self, player: ClientId, rockets: i32) {
        self.log().push(HudEvent::Rockets(player, rockets));
    }

    fn on_ping_updated(&mut self, ping_ms: u32) {
        self.log().push(HudEvent::Ping(ping_ms));
    }

    fn on_show_widget(&mut self) {
        self.log().push(HudEvent::Shown);
    }

    fn on_hide_widget(&mut self) {
        self.log().push(HudEvent::Hidden);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_log() {
        let hud = RecordingPresentation::new();
        let mut session_side = hud.clone();
        session_side.on_rocket_count_changed(ClientId(1), 4);
        session_side.on_rocket_count_changed(ClientId(2), 9);
        session_side.on_rocket_count_changed(ClientId(1), 3);
        assert_eq!(hud.last_rockets(ClientId(1)), Some(3));
        assert_eq!(hud.last_health(ClientId(1)), None);
        assert_eq!(hud.events().len(), 3);
    }
}
