//! Input handling.
//!
//! In a real game this would integrate with windowing, raw keyboard/gamepad
//! state and action bindings. This layer only turns a sampled axis/button
//! state into the [`InputIntent`] the session consumes each tick.

use fgnet_shared::movement::{InputButtons, InputIntent};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    /// Throttle, -1 (reverse) to 1.
    pub forward: f32,
    /// Steering, -1 (left) to 1.
    pub turn: f32,
    pub brake: bool,
    pub fire: bool,
}

impl InputState {
    pub fn buttons(self) -> InputButtons {
        let mut buttons = InputButtons::empty();
        buttons.set(InputButtons::BRAKE, self.brake);
        buttons.set(InputButtons::FIRE, self.fire);
        buttons
    }
}

/// Turns sampled input into the intent for one tick. Axes are clamped.
pub fn build_intent(input: InputState) -> InputIntent {
    InputIntent {
        forward: input.forward.clamp(-1.0, 1.0),
        turn: input.turn.clamp(-1.0, 1.0),
        buttons: input.buttons(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_and_axes_map_to_intent() {
        let intent = build_intent(InputState {
            forward: 3.0,
            turn: -0.5,
            brake: true,
            fire: false,
        });
        assert_eq!(intent.forward, 1.0);
        assert_eq!(intent.turn, -0.5);
        assert!(intent.is_braking());
        assert!(!intent.wants_fire());
    }
}
