//! Local vehicle prediction.
//!
//! Runs only for the locally controlled player. Integrates a scalar
//! velocity along the facing direction and accumulates yaw from the turn
//! axis; the resolver turns the desired delta into a final location.
//!
//! Turn rate eases in with speed: below `turn_speed_threshold * max_velocity`
//! it rises along an ease-out curve, above it the full rate applies.
//! Friction is exponential in `dt` so decay does not depend on tick rate.

use crate::{
    config::MovementTuning,
    math::{interp_ease_out, Rotator, Vec3},
    physics::MovementResolver,
};

bitflags::bitflags! {
    /// Digital inputs sampled each tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InputButtons: u8 {
        const BRAKE = 1 << 0;
        const FIRE = 1 << 1;
    }
}

/// What the local player wants this tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputIntent {
    /// Throttle in `[-1, 1]`.
    pub forward: f32,
    /// Steering in `[-1, 1]`.
    pub turn: f32,
    pub buttons: InputButtons,
}

impl InputIntent {
    pub fn is_braking(&self) -> bool {
        self.buttons.contains(InputButtons::BRAKE)
    }

    pub fn wants_fire(&self) -> bool {
        self.buttons.contains(InputButtons::FIRE)
    }
}

/// Predicted kinematic state of a locally controlled vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementState {
    /// Signed speed along the facing direction.
    pub velocity: f32,
    /// Accumulated heading in degrees.
    pub yaw: f32,
}

impl MovementState {
    pub fn rotation(&self) -> Rotator {
        Rotator::from_yaw(self.yaw)
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation().forward()
    }
}

/// Turn rate in degrees per second for the given speed.
pub fn turn_speed(tuning: &MovementTuning, velocity: f32) -> f32 {
    let full_rate_speed = tuning.max_velocity * tuning.turn_speed_threshold;
    let alpha = (velocity / full_rate_speed).abs().clamp(0.0, 1.0);
    interp_ease_out(0.0, tuning.turn_speed, alpha, tuning.turn_blend_exponent)
}

/// Advances the predicted state by one tick and moves the resolver.
///
/// Returns the resolved location and rotation.
pub fn step(
    state: &mut MovementState,
    intent: &InputIntent,
    tuning: &MovementTuning,
    resolver: &mut dyn MovementResolver,
    dt: f32,
) -> (Vec3, Rotator) {
    let friction = if intent.is_braking() {
        tuning.braking_friction
    } else {
        tuning.default_friction
    };
    let rate = turn_speed(tuning, state.velocity);
    // Reversing steers the other way, like a car.
    let direction = if state.velocity > 0.0 {
        intent.turn
    } else {
        -intent.turn
    };

    state.yaw += direction * rate * dt;
    let rotation = state.rotation();
    resolver.set_facing(rotation);

    let mut frame = resolver.begin_frame_movement(dt);

    state.velocity += intent.forward * tuning.acceleration * dt;
    state.velocity = state
        .velocity
        .clamp(-tuning.max_velocity, tuning.max_velocity);
    state.velocity *= friction.powf(dt);

    resolver.apply_gravity();
    frame.add_delta(rotation.forward().scale(state.velocity * dt));
    let location = resolver.move_by(frame);

    (location, rotation)
}
