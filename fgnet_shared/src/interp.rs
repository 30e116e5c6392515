//! Interpolation for players this process does not control.
//!
//! The owner streams location and rotation every tick over the unreliable
//! channel. A non-owning copy only keeps the latest received target and
//! eases its displayed transform toward it at its own tick rate.

use crate::math::{rinterp_to, vinterp_to, Rotator, Vec3};

/// Latest network target plus the transform currently displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSmoothing {
    target_location: Vec3,
    target_rotation: Rotator,
    location_updates: u64,
    rotation_updates: u64,
}

impl RemoteSmoothing {
    pub fn new(location: Vec3, rotation: Rotator) -> Self {
        Self {
            target_location: location,
            target_rotation: rotation,
            location_updates: 0,
            rotation_updates: 0,
        }
    }

    pub fn set_target_location(&mut self, location: Vec3) {
        self.target_location = location;
        self.location_updates += 1;
    }

    pub fn set_target_rotation(&mut self, rotation: Rotator) {
        self.target_rotation = rotation;
        self.rotation_updates += 1;
    }

    pub fn target_location(&self) -> Vec3 {
        self.target_location
    }

    pub fn target_rotation(&self) -> Rotator {
        self.target_rotation
    }

    /// Number of location targets received so far.
    pub fn location_updates(&self) -> u64 {
        self.location_updates
    }

    pub fn rotation_updates(&self) -> u64 {
        self.rotation_updates
    }

    /// Eases the displayed transform toward the target.
    pub fn step(&self, location: Vec3, rotation: Rotator, dt: f32, speed: f32) -> (Vec3, Rotator) {
        (
            vinterp_to(location, self.target_location, dt, speed),
            rinterp_to(rotation, self.target_rotation, dt, speed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_without_overshoot() {
        let mut s = RemoteSmoothing::new(Vec3::ZERO, Rotator::default());
        s.set_target_location(Vec3::new(100.0, 0.0, 0.0));
        s.set_target_rotation(Rotator::from_yaw(90.0));

        let (mut loc, mut rot) = (Vec3::ZERO, Rotator::default());
        let mut prev = 0.0;
        for _ in 0..120 {
            (loc, rot) = s.step(loc, rot, 1.0 / 60.0, 10.0);
            assert!(loc.x >= prev && loc.x <= 100.0);
            prev = loc.x;
        }
        assert!((loc.x - 100.0).abs() < 0.1);
        assert!((rot.yaw - 90.0).abs() < 0.1);
    }

    #[test]
    fn eases_rather_than_steps_linearly() {
        let mut s = RemoteSmoothing::new(Vec3::ZERO, Rotator::default());
        s.set_target_location(Vec3::new(100.0, 0.0, 0.0));
        let (a, _) = s.step(Vec3::ZERO, Rotator::default(), 0.05, 10.0);
        let (b, _) = s.step(a, Rotator::default(), 0.05, 10.0);
        // Each step covers less ground than the previous one.
        assert!(b.x - a.x < a.x);
    }

    #[test]
    fn counts_each_target_once() {
        let mut s = RemoteSmoothing::new(Vec3::ZERO, Rotator::default());
        s.set_target_location(Vec3::new(1.0, 0.0, 0.0));
        s.set_target_location(Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(s.location_updates(), 2);
        assert_eq!(s.rotation_updates(), 0);
        assert_eq!(s.target_location(), Vec3::new(2.0, 0.0, 0.0));
    }
}
