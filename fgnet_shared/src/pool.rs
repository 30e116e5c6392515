//! Fixed-capacity rocket pool.
//!
//! Every player pre-allocates its rockets once when it spawns. Slots are
//! toggled between `Free` and `Active` instead of being created per shot,
//! and a slot index doubles as the handle that travels over the wire, so
//! all copies of a player agree on which slot a shot occupies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::Vec3;

/// Index of a slot in a player's rocket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RocketHandle(pub u8);

impl RocketHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle of a pooled rocket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RocketState {
    Free,
    Active {
        location: Vec3,
        /// Unit direction of travel.
        direction: Vec3,
        /// Seconds left before the slot frees itself.
        remaining: f32,
        /// Whether the one allowed correction was already applied.
        corrected: bool,
    },
}

/// One pooled rocket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rocket {
    pub state: RocketState,
}

impl Rocket {
    pub fn is_active(&self) -> bool {
        matches!(self.state, RocketState::Active { .. })
    }

    pub fn location(&self) -> Option<Vec3> {
        match self.state {
            RocketState::Active { location, .. } => Some(location),
            RocketState::Free => None,
        }
    }

    pub fn direction(&self) -> Option<Vec3> {
        match self.state {
            RocketState::Active { direction, .. } => Some(direction),
            RocketState::Free => None,
        }
    }
}

/// Pool operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The handle does not address a slot of this pool.
    InvalidHandle(RocketHandle),
    /// The slot is already flying.
    AlreadyActive(RocketHandle),
    /// The slot is not flying.
    NotActive(RocketHandle),
    /// The slot already took its correction.
    AlreadyCorrected(RocketHandle),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidHandle(h) => write!(f, "rocket handle {} out of range", h.0),
            PoolError::AlreadyActive(h) => write!(f, "rocket {} already active", h.0),
            PoolError::NotActive(h) => write!(f, "rocket {} is not active", h.0),
            PoolError::AlreadyCorrected(h) => write!(f, "rocket {} already corrected", h.0),
        }
    }
}

impl std::error::Error for PoolError {}

/// Fixed set of rockets owned by one player.
#[derive(Debug, Clone)]
pub struct ProjectilePool {
    slots: Box<[Rocket]>,
    speed: f32,
    lifetime: f32,
}

impl ProjectilePool {
    /// Largest capacity a handle can address.
    pub const MAX_CAPACITY: usize = u8::MAX as usize + 1;

    /// Allocates `capacity` free slots; capacity is clamped to
    /// `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize, speed: f32, lifetime: f32) -> Self {
        let capacity = capacity.clamp(1, Self::MAX_CAPACITY);
        Self {
            slots: vec![
                Rocket {
                    state: RocketState::Free
                };
                capacity
            ]
            .into_boxed_slice(),
            speed,
            lifetime,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently flying.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|r| r.is_active()).count()
    }

    /// Returns the first free slot, if any. Does not change its state.
    pub fn acquire(&self) -> Option<RocketHandle> {
        self.slots
            .iter()
            .position(|r| !r.is_active())
            .map(|i| RocketHandle(i as u8))
    }

    pub fn get(&self, handle: RocketHandle) -> Result<&Rocket, PoolError> {
        self.slots
            .get(handle.index())
            .ok_or(PoolError::InvalidHandle(handle))
    }

    pub fn contains(&self, handle: RocketHandle) -> bool {
        handle.index() < self.slots.len()
    }

    /// Pure query; out-of-range handles are never active.
    pub fn is_active(&self, handle: RocketHandle) -> bool {
        self.get(handle).map(Rocket::is_active).unwrap_or(false)
    }

    /// Free -> Active with the given kinematics.
    pub fn activate(
        &mut self,
        handle: RocketHandle,
        direction: Vec3,
        start: Vec3,
    ) -> Result<(), PoolError> {
        let lifetime = self.lifetime;
        let slot = self.slot_mut(handle)?;
        if slot.is_active() {
            return Err(PoolError::AlreadyActive(handle));
        }
        slot.state = RocketState::Active {
            location: start,
            direction: direction.normalized(),
            remaining: lifetime,
            corrected: false,
        };
        Ok(())
    }

    /// Replaces the heading of a flying rocket. Accepted once per activation.
    pub fn apply_correction(
        &mut self,
        handle: RocketHandle,
        new_direction: Vec3,
    ) -> Result<(), PoolError> {
        let slot = self.slot_mut(handle)?;
        match &mut slot.state {
            RocketState::Free => Err(PoolError::NotActive(handle)),
            RocketState::Active { corrected: true, .. } => Err(PoolError::AlreadyCorrected(handle)),
            RocketState::Active {
                direction,
                corrected,
                ..
            } => {
                *direction = new_direction.normalized();
                *corrected = true;
                Ok(())
            }
        }
    }

    /// Active -> Free. Releasing a free slot is a no-op.
    pub fn release(&mut self, handle: RocketHandle) -> Result<(), PoolError> {
        let slot = self.slot_mut(handle)?;
        slot.state = RocketState::Free;
        Ok(())
    }

    /// Moves active rockets and frees those that outlived their lifetime.
    ///
    /// Returns the handles freed during this step.
    pub fn tick(&mut self, dt: f32) -> Vec<RocketHandle> {
        let speed = self.speed;
        let mut expired = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let RocketState::Active {
                location,
                direction,
                remaining,
                ..
            } = &mut slot.state
            {
                *location += direction.scale(speed * dt);
                *remaining -= dt;
                if *remaining <= 0.0 {
                    slot.state = RocketState::Free;
                    expired.push(RocketHandle(i as u8));
                }
            }
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = (RocketHandle, &Rocket)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, r)| (RocketHandle(i as u8), r))
    }

    fn slot_mut(&mut self, handle: RocketHandle) -> Result<&mut Rocket, PoolError> {
        self.slots
            .get_mut(handle.index())
            .ok_or(PoolError::InvalidHandle(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ProjectilePool {
        ProjectilePool::new(8, 100.0, 1.0)
    }

    #[test]
    fn acquire_returns_first_free_slot() {
        let mut p = pool();
        assert_eq!(p.acquire(), Some(RocketHandle(0)));
        p.activate(RocketHandle(0), Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO)
            .unwrap();
        assert_eq!(p.acquire(), Some(RocketHandle(1)));
        p.release(RocketHandle(0)).unwrap();
        assert_eq!(p.acquire(), Some(RocketHandle(0)));
    }

    #[test]
    fn acquire_fails_when_everything_flies() {
        let mut p = ProjectilePool::new(2, 100.0, 1.0);
        for i in 0..2 {
            p.activate(RocketHandle(i), Vec3::UP, Vec3::ZERO).unwrap();
        }
        assert_eq!(p.acquire(), None);
        assert_eq!(p.active_count(), 2);
    }

    #[test]
    fn release_of_free_slot_is_a_noop() {
        let mut p = pool();
        p.activate(RocketHandle(2), Vec3::UP, Vec3::ZERO).unwrap();
        p.release(RocketHandle(5)).unwrap();
        p.release(RocketHandle(5)).unwrap();
        assert!(p.is_active(RocketHandle(2)));
        assert_eq!(p.active_count(), 1);
        assert_eq!(p.capacity(), 8);
    }

    #[test]
    fn out_of_range_handles_are_rejected() {
        let mut p = pool();
        let bad = RocketHandle(8);
        assert!(!p.is_active(bad));
        assert_eq!(p.release(bad), Err(PoolError::InvalidHandle(bad)));
        assert_eq!(
            p.activate(bad, Vec3::UP, Vec3::ZERO),
            Err(PoolError::InvalidHandle(bad))
        );
    }

    #[test]
    fn double_activation_is_refused() {
        let mut p = pool();
        let h = RocketHandle(0);
        p.activate(h, Vec3::UP, Vec3::ZERO).unwrap();
        assert_eq!(
            p.activate(h, Vec3::UP, Vec3::ZERO),
            Err(PoolError::AlreadyActive(h))
        );
    }

    #[test]
    fn correction_is_accepted_once() {
        let mut p = pool();
        let h = RocketHandle(1);
        assert_eq!(
            p.apply_correction(h, Vec3::UP),
            Err(PoolError::NotActive(h))
        );
        p.activate(h, Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO).unwrap();
        p.apply_correction(h, Vec3::new(0.0, 2.0, 0.0)).unwrap();
        assert_eq!(p.get(h).unwrap().direction(), Some(Vec3::new(0.0, 1.0, 0.0)));
        assert_eq!(
            p.apply_correction(h, Vec3::new(1.0, 0.0, 0.0)),
            Err(PoolError::AlreadyCorrected(h))
        );
    }

    #[test]
    fn tick_moves_and_expires() {
        let mut p = ProjectilePool::new(2, 10.0, 0.5);
        let h = RocketHandle(0);
        p.activate(h, Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO).unwrap();
        assert!(p.tick(0.25).is_empty());
        assert_eq!(p.get(h).unwrap().location(), Some(Vec3::new(2.5, 0.0, 0.0)));
        assert_eq!(p.tick(0.25), vec![h]);
        assert!(!p.is_active(h));
        assert_eq!(p.get(h).unwrap().location(), None);
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(ProjectilePool::new(0, 1.0, 1.0).capacity(), 1);
        assert_eq!(
            ProjectilePool::new(10_000, 1.0, 1.0).capacity(),
            ProjectilePool::MAX_CAPACITY
        );
    }
}
