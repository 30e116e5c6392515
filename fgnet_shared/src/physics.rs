//! Movement resolution abstraction.
//!
//! The prediction engine only decides where the vehicle *wants* to go on
//! the ground plane. Gravity, sweeping against world geometry and the final
//! transform belong to a resolver behind [`MovementResolver`].

use crate::math::{Rotator, Vec3};

/// Physics parameters.
#[derive(Debug, Clone, Copy)]
pub struct PhysicsConfig {
    /// Downward acceleration in units per second squared.
    pub gravity: f32,
    /// Height of the floor used by [`FlatGroundResolver`].
    pub ground_height: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: 980.0,
            ground_height: 0.0,
        }
    }
}

/// Accumulated displacement for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameMovement {
    pub delta: Vec3,
    /// Tick length, needed by the resolver to integrate gravity.
    pub dt: f32,
}

impl FrameMovement {
    pub fn new(dt: f32) -> Self {
        Self {
            delta: Vec3::ZERO,
            dt,
        }
    }

    pub fn add_delta(&mut self, delta: Vec3) {
        self.delta += delta;
    }
}

/// Resolves desired movement against the world.
pub trait MovementResolver: Send {
    fn set_facing(&mut self, rotation: Rotator);
    fn facing(&self) -> Rotator;
    fn begin_frame_movement(&mut self, dt: f32) -> FrameMovement;
    fn apply_gravity(&mut self);
    /// Applies the frame and returns the final location.
    fn move_by(&mut self, frame: FrameMovement) -> Vec3;
    fn location(&self) -> Vec3;
    fn set_location(&mut self, location: Vec3);
}

/// Open floor with no obstacles: gravity pulls down until the ground plane.
#[derive(Debug, Clone)]
pub struct FlatGroundResolver {
    cfg: PhysicsConfig,
    location: Vec3,
    facing: Rotator,
    vertical_speed: f32,
    gravity_pending: bool,
}

impl FlatGroundResolver {
    pub fn new(cfg: PhysicsConfig, location: Vec3) -> Self {
        Self {
            cfg,
            location,
            facing: Rotator::default(),
            vertical_speed: 0.0,
            gravity_pending: false,
        }
    }
}

impl Default for FlatGroundResolver {
    fn default() -> Self {
        Self::new(PhysicsConfig::default(), Vec3::ZERO)
    }
}

impl MovementResolver for FlatGroundResolver {
    fn set_facing(&mut self, rotation: Rotator) {
        self.facing = rotation;
    }

    fn facing(&self) -> Rotator {
        self.facing
    }

    fn begin_frame_movement(&mut self, dt: f32) -> FrameMovement {
        self.gravity_pending = false;
        FrameMovement::new(dt)
    }

    fn apply_gravity(&mut self) {
        self.gravity_pending = true;
    }

    fn move_by(&mut self, mut frame: FrameMovement) -> Vec3 {
        if self.gravity_pending {
            self.vertical_speed -= self.cfg.gravity * frame.dt;
            frame.add_delta(Vec3::new(0.0, 0.0, self.vertical_speed * frame.dt));
            self.gravity_pending = false;
        }
        let mut next = self.location + frame.delta;
        if next.z <= self.cfg.ground_height {
            next.z = self.cfg.ground_height;
            self.vertical_speed = 0.0;
        }
        self.location = next;
        next
    }

    fn location(&self) -> Vec3 {
        self.location
    }

    fn set_location(&mut self, location: Vec3) {
        self.location = location;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gravity_settles_on_the_ground() {
        let mut r = FlatGroundResolver::new(PhysicsConfig::default(), Vec3::new(0.0, 0.0, 50.0));
        for _ in 0..120 {
            let frame = r.begin_frame_movement(1.0 / 60.0);
            r.apply_gravity();
            r.move_by(frame);
        }
        assert_eq!(r.location().z, 0.0);
    }

    #[test]
    fn horizontal_delta_passes_through() {
        let mut r = FlatGroundResolver::default();
        let mut frame = r.begin_frame_movement(0.1);
        frame.add_delta(Vec3::new(3.0, 4.0, 0.0));
        assert_eq!(r.move_by(frame), Vec3::new(3.0, 4.0, 0.0));
    }
}
