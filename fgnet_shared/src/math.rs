//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! Angles on the wire are degrees, matching the tuning values.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const UP: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 1.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    /// Returns a unit vector, or zero for a degenerate input.
    pub fn normalized(self) -> Self {
        let len = self.len();
        if len <= f32::EPSILON {
            Self::ZERO
        } else {
            self.scale(1.0 / len)
        }
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }

    pub fn distance(self, other: Self) -> f32 {
        (other - self).len()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Pitch/yaw/roll in degrees.
///
/// Vehicles only ever rotate around the up axis, so `yaw` carries all of
/// the gameplay-relevant state. Pitch and roll are kept so the wire format
/// can grow without a protocol bump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rotator {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

impl Rotator {
    pub const fn from_yaw(yaw: f32) -> Self {
        Self {
            pitch: 0.0,
            yaw,
            roll: 0.0,
        }
    }

    /// Unit forward vector of the yaw component.
    pub fn forward(self) -> Vec3 {
        let rad = self.yaw.to_radians();
        Vec3::new(rad.cos(), rad.sin(), 0.0)
    }

    /// Returns the same rotation with every axis wrapped into `(-180, 180]`.
    pub fn normalized(self) -> Self {
        Self {
            pitch: normalize_axis(self.pitch),
            yaw: normalize_axis(self.yaw),
            roll: normalize_axis(self.roll),
        }
    }
}

/// Wraps an angle in degrees into `(-180, 180]`.
pub fn normalize_axis(angle: f32) -> f32 {
    let mut a = angle % 360.0;
    if a > 180.0 {
        a -= 360.0;
    } else if a <= -180.0 {
        a += 360.0;
    }
    a
}

/// Signed shortest angular distance from `from` to `to`, in degrees.
pub fn delta_angle(from: f32, to: f32) -> f32 {
    normalize_axis(to - from)
}

/// Yaw in degrees of a direction vector projected on the ground plane.
pub fn yaw_of(direction: Vec3) -> f32 {
    direction.y.atan2(direction.x).to_degrees()
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Ease-out interpolation between `a` and `b`.
///
/// `t` is clamped to `[0,1]`; `exp` controls how quickly the curve
/// saturates toward `b`.
pub fn interp_ease_out(a: f32, b: f32, t: f32, exp: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    lerp(a, b, 1.0 - (1.0 - t).powf(exp))
}

/// Fraction of the remaining distance covered by an exponential ease over
/// `dt` seconds at `speed`.
///
/// A non-positive speed snaps straight to the target.
pub fn ease_alpha(dt: f32, speed: f32) -> f32 {
    if speed <= 0.0 {
        return 1.0;
    }
    (1.0 - (-speed * dt).exp()).clamp(0.0, 1.0)
}

/// Exponentially eases `current` toward `target`.
pub fn vinterp_to(current: Vec3, target: Vec3, dt: f32, speed: f32) -> Vec3 {
    current.lerp(target, ease_alpha(dt, speed))
}

/// Exponentially eases a rotation toward `target` along the shortest arc.
pub fn rinterp_to(current: Rotator, target: Rotator, dt: f32, speed: f32) -> Rotator {
    let alpha = ease_alpha(dt, speed);
    let step = |from: f32, to: f32| normalize_axis(from + delta_angle(from, to) * alpha);
    Rotator {
        pitch: step(current.pitch, target.pitch),
        yaw: step(current.yaw, target.yaw),
        roll: step(current.roll, target.roll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec3_lerp_midpoint() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 4.0, 6.0);
        let mid = a.lerp(b, 0.5);
        assert_eq!(mid, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn ease_out_hits_endpoints_and_front_loads() {
        assert_eq!(interp_ease_out(0.0, 100.0, 0.0, 5.0), 0.0);
        assert_eq!(interp_ease_out(0.0, 100.0, 1.0, 5.0), 100.0);
        // 1 - 0.5^5 = 0.96875
        assert!((interp_ease_out(0.0, 100.0, 0.5, 5.0) - 96.875).abs() < 1e-3);
    }

    #[test]
    fn rinterp_takes_shortest_arc() {
        let from = Rotator::from_yaw(170.0);
        let to = Rotator::from_yaw(-170.0);
        let r = rinterp_to(from, to, 0.01, 10.0);
        // Moves past 180 rather than back through 0.
        assert!(r.yaw > 170.0 || r.yaw < -170.0);
    }

    #[test]
    fn ease_alpha_is_frame_rate_independent() {
        let one = ease_alpha(0.1, 10.0);
        let half = ease_alpha(0.05, 10.0);
        let two_halves = 1.0 - (1.0 - half) * (1.0 - half);
        assert!((one - two_halves).abs() < 1e-5);
    }

    #[test]
    fn normalize_axis_wraps() {
        assert_eq!(normalize_axis(190.0), -170.0);
        assert_eq!(normalize_axis(-190.0), 170.0);
        assert_eq!(normalize_axis(180.0), 180.0);
        assert_eq!(delta_angle(350.0, 10.0), 20.0);
    }
}
