//! The networked vehicle.
//!
//! One `Player` exists per connection on every process. Exactly one copy is
//! locally controlled (on the owning process) and runs prediction; all other
//! copies chase network targets. The authority's copy additionally carries
//! the [`AuthorityLedger`].
//!
//! Methods here never touch the network. Anything that has to be sent is
//! returned as an [`Outgoing`] for the session to route.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    combat::{check_fire, AuthorityLedger, FireDeclined, FireGate},
    config::{CombatTuning, MovementTuning},
    interp::RemoteSmoothing,
    math::{Rotator, Vec3},
    movement::{self, InputButtons, InputIntent, MovementState},
    net::{ClientId, CorrelationId, GameMsg},
    physics::{FlatGroundResolver, MovementResolver, PhysicsConfig},
    pool::{PoolError, ProjectilePool, RocketHandle},
    replica::Replica,
    transport::Target,
};

/// A message the session has to route.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub msg: GameMsg,
    pub target: Target,
}

impl Outgoing {
    pub fn new(msg: GameMsg, target: Target) -> Self {
        Self { msg, target }
    }
}

/// World-owned rocket pickup. Can be consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pickup {
    pub id: u32,
    rockets: i32,
    consumed: bool,
}

impl Pickup {
    pub fn new(id: u32, rockets: i32) -> Self {
        Self {
            id,
            rockets: rockets.max(0),
            consumed: false,
        }
    }

    pub fn rockets(&self) -> i32 {
        self.rockets
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Returns the rocket count the first time, `None` afterwards.
    pub fn consume(&mut self) -> Option<i32> {
        if self.consumed {
            return None;
        }
        self.consumed = true;
        Some(self.rockets)
    }
}

/// A shot sent to the authority and not yet answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlightShot {
    handle: RocketHandle,
    /// The slot was started before the authority answered.
    speculative: bool,
}

/// One networked vehicle.
pub struct Player {
    id: ClientId,
    locally_controlled: bool,

    location: Vec3,
    rotation: Rotator,
    movement: MovementState,
    intent: InputIntent,
    tuning: Option<MovementTuning>,
    interpolation_speed: f32,
    missing_tuning_reported: bool,
    smoothing: RemoteSmoothing,
    resolver: Box<dyn MovementResolver>,

    health: Replica<i32>,
    rockets: Replica<i32>,
    ledger: Option<AuthorityLedger>,

    pool: ProjectilePool,
    cooldown: f32,
    shots: BTreeMap<CorrelationId, InFlightShot>,
    ping_ms: u32,
}

impl Player {
    pub fn new(
        id: ClientId,
        locally_controlled: bool,
        location: Vec3,
        rotation: Rotator,
        movement: &MovementTuning,
        combat: &CombatTuning,
    ) -> Self {
        let mut resolver = FlatGroundResolver::new(PhysicsConfig::default(), location);
        resolver.set_facing(rotation);
        Self {
            id,
            locally_controlled,
            location,
            rotation,
            movement: MovementState {
                velocity: 0.0,
                yaw: rotation.yaw,
            },
            intent: InputIntent::default(),
            tuning: Some(*movement),
            interpolation_speed: movement.interpolation_speed,
            missing_tuning_reported: false,
            smoothing: RemoteSmoothing::new(location, rotation),
            resolver: Box::new(resolver),
            health: Replica::new(combat.starting_health),
            rockets: Replica::new(combat.starting_rockets),
            ledger: None,
            pool: ProjectilePool::new(
                combat.pool_capacity,
                combat.rocket_speed,
                combat.rocket_lifetime,
            ),
            cooldown: 0.0,
            shots: BTreeMap::new(),
            ping_ms: 0,
        }
    }

    /// Replaces the movement resolver, keeping the current transform.
    pub fn with_resolver(mut self, mut resolver: Box<dyn MovementResolver>) -> Self {
        resolver.set_location(self.location);
        resolver.set_facing(self.rotation);
        self.resolver = resolver;
        self
    }

    pub(crate) fn attach_ledger(&mut self, ledger: AuthorityLedger) {
        self.ledger = Some(ledger);
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_locally_controlled(&self) -> bool {
        self.locally_controlled
    }

    pub fn location(&self) -> Vec3 {
        self.location
    }

    pub fn rotation(&self) -> Rotator {
        self.rotation
    }

    pub fn velocity(&self) -> f32 {
        self.movement.velocity
    }

    pub fn is_braking(&self) -> bool {
        self.intent.is_braking()
    }

    /// Round trip to the authority, in milliseconds. Zero off the owner.
    pub fn ping(&self) -> u32 {
        self.ping_ms
    }

    pub(crate) fn set_ping(&mut self, ping_ms: u32) {
        self.ping_ms = ping_ms;
    }

    pub fn intent(&self) -> InputIntent {
        self.intent
    }

    /// Displayed health.
    pub fn health(&self) -> i32 {
        self.health.get()
    }

    /// Displayed rocket count.
    pub fn rockets(&self) -> i32 {
        self.rockets.get()
    }

    pub fn health_view(&self) -> &Replica<i32> {
        &self.health
    }

    pub fn rocket_view(&self) -> &Replica<i32> {
        &self.rockets
    }

    /// Authoritative counters; `None` off the authority.
    pub fn ledger(&self) -> Option<&AuthorityLedger> {
        self.ledger.as_ref()
    }

    pub fn pool(&self) -> &ProjectilePool {
        &self.pool
    }

    pub fn cooldown(&self) -> f32 {
        self.cooldown
    }

    pub fn smoothing(&self) -> &RemoteSmoothing {
        &self.smoothing
    }

    pub fn movement_tuning(&self) -> Option<&MovementTuning> {
        self.tuning.as_ref()
    }

    pub fn set_movement_tuning(&mut self, tuning: Option<MovementTuning>) {
        if let Some(t) = &tuning {
            self.interpolation_speed = t.interpolation_speed;
            self.missing_tuning_reported = false;
        }
        self.tuning = tuning;
    }

    // ─── Input ───

    pub fn set_intent(&mut self, intent: InputIntent) {
        self.intent = intent;
    }

    pub fn handle_accelerate(&mut self, value: f32) {
        self.intent.forward = value.clamp(-1.0, 1.0);
    }

    pub fn handle_turn(&mut self, value: f32) {
        self.intent.turn = value.clamp(-1.0, 1.0);
    }

    pub fn handle_brake_pressed(&mut self) {
        self.intent.buttons.insert(InputButtons::BRAKE);
    }

    pub fn handle_brake_released(&mut self) {
        self.intent.buttons.remove(InputButtons::BRAKE);
    }

    // ─── Tick ───

    /// Advances timers and rockets, then either predicts (owner) or
    /// interpolates (everyone else). Returns movement sync messages.
    pub fn tick(&mut self, dt: f32) -> Vec<Outgoing> {
        self.cooldown = (self.cooldown - dt).max(0.0);
        for handle in self.pool.tick(dt) {
            debug!(player = %self.id, rocket = handle.0, "rocket expired");
        }

        if self.locally_controlled {
            self.tick_predicted(dt)
        } else {
            let (location, rotation) =
                self.smoothing
                    .step(self.location, self.rotation, dt, self.interpolation_speed);
            self.location = location;
            self.rotation = rotation;
            Vec::new()
        }
    }

    fn tick_predicted(&mut self, dt: f32) -> Vec<Outgoing> {
        let Some(tuning) = self.tuning else {
            if !self.missing_tuning_reported {
                warn!(player = %self.id, "movement tuning missing, skipping prediction");
                self.missing_tuning_reported = true;
            }
            return Vec::new();
        };

        let (location, rotation) = movement::step(
            &mut self.movement,
            &self.intent,
            &tuning,
            self.resolver.as_mut(),
            dt,
        );
        self.location = location;
        self.rotation = rotation;

        vec![
            Outgoing::new(
                GameMsg::SendLocation {
                    player: self.id,
                    location,
                },
                Target::Authority,
            ),
            Outgoing::new(
                GameMsg::SendRotation {
                    player: self.id,
                    rotation,
                },
                Target::Authority,
            ),
        ]
    }

    // ─── Owner-side actions ───

    /// Rockets flying plus shots awaiting the authority.
    pub fn rockets_in_use(&self) -> usize {
        let waiting = self
            .shots
            .values()
            .filter(|s| !self.pool.is_active(s.handle))
            .count();
        self.pool.active_count() + waiting
    }

    fn free_slot(&self) -> Option<RocketHandle> {
        self.pool
            .iter()
            .find(|(h, r)| !r.is_active() && !self.shots.values().any(|s| s.handle == *h))
            .map(|(h, _)| h)
    }

    /// Where a rocket fired now would start.
    pub fn muzzle_location(&self, combat: &CombatTuning) -> Vec3 {
        self.location + self.rotation.forward().scale(combat.muzzle_offset)
    }

    /// Local half of firing: admission check, cooldown, optional speculative
    /// start, and the request for the authority.
    pub fn try_fire(
        &mut self,
        correlation: CorrelationId,
        combat: &CombatTuning,
        speculate: bool,
    ) -> Result<Outgoing, FireDeclined> {
        if !self.locally_controlled {
            return Err(FireDeclined::NotLocallyControlled);
        }
        let slot = self.free_slot();
        check_fire(
            &FireGate {
                cooldown: self.cooldown,
                displayed_rockets: self.rockets.get(),
                in_use: self.rockets_in_use(),
                has_free_slot: slot.is_some(),
            },
            combat,
        )?;
        let handle = slot.ok_or(FireDeclined::PoolExhausted)?;

        self.cooldown = combat.fire_cooldown;
        let location = self.muzzle_location(combat);

        if speculate {
            if !combat.unlimited_rockets {
                self.rockets.apply_speculative(correlation, -1);
            }
            if let Err(e) = self
                .pool
                .activate(handle, self.rotation.forward(), location)
            {
                warn!(player = %self.id, error = %e, "speculative rocket start failed");
            }
        }
        self.shots.insert(
            correlation,
            InFlightShot {
                handle,
                speculative: speculate,
            },
        );

        Ok(Outgoing::new(
            GameMsg::FireRocket {
                player: self.id,
                correlation,
                handle,
                location,
                rotation: self.rotation,
            },
            Target::Authority,
        ))
    }

    /// Requests damage against this player.
    pub fn request_damage(
        &mut self,
        correlation: CorrelationId,
        amount: i32,
        speculate: bool,
    ) -> Option<Outgoing> {
        if !self.locally_controlled || amount <= 0 {
            return None;
        }
        if speculate {
            self.health.apply_speculative(correlation, -amount);
        }
        Some(Outgoing::new(
            GameMsg::TakeDamage {
                player: self.id,
                correlation,
                amount,
            },
            Target::Authority,
        ))
    }

    /// Consumes a pickup and asks the authority for the credit.
    pub fn consume_pickup(
        &mut self,
        pickup: &mut Pickup,
        correlation: CorrelationId,
        speculate: bool,
    ) -> Option<Outgoing> {
        if !self.locally_controlled {
            return None;
        }
        let rockets = pickup.consume()?;
        if speculate {
            self.rockets.apply_speculative(correlation, rockets);
        }
        debug!(player = %self.id, pickup = pickup.id, rockets, "pickup consumed");
        Some(Outgoing::new(
            GameMsg::RequestPickup {
                player: self.id,
                correlation,
                rockets,
            },
            Target::Authority,
        ))
    }

    // ─── Broadcast handlers ───

    /// Returns true when the displayed value changed.
    pub fn apply_health(&mut self, health: i32, correlation: Option<CorrelationId>) -> bool {
        self.health.apply_broadcast(health, correlation)
    }

    /// Returns true when the displayed value changed.
    pub fn apply_rockets(&mut self, rockets: i32, correlation: Option<CorrelationId>) -> bool {
        self.rockets.apply_broadcast(rockets, correlation)
    }

    pub fn apply_location_target(&mut self, location: Vec3) {
        if !self.locally_controlled {
            self.smoothing.set_target_location(location);
        }
    }

    pub fn apply_rotation_target(&mut self, rotation: Rotator) {
        if !self.locally_controlled {
            self.smoothing.set_target_rotation(rotation);
        }
    }

    /// Starts (or corrects) the rocket named by an authoritative broadcast.
    pub fn apply_rocket_fired(
        &mut self,
        correlation: CorrelationId,
        handle: RocketHandle,
        location: Vec3,
        direction: Vec3,
    ) -> Result<(), PoolError> {
        if !self.pool.contains(handle) {
            return Err(PoolError::InvalidHandle(handle));
        }
        let shot = self.shots.remove(&correlation);
        match shot {
            Some(InFlightShot {
                speculative: true,
                handle: own,
            }) if own == handle && self.pool.is_active(handle) => {
                self.pool.apply_correction(handle, direction)
            }
            other => {
                if let Some(InFlightShot {
                    speculative: true,
                    handle: own,
                }) = other
                {
                    if own != handle {
                        self.pool.release(own)?;
                    }
                }
                if self.pool.is_active(handle) {
                    warn!(player = %self.id, rocket = handle.0, "restarting rocket still in flight");
                    self.pool.release(handle)?;
                }
                self.pool.activate(handle, direction, location)
            }
        }
    }

    /// Refund: frees the slot of a refused shot and rolls back speculation.
    pub fn apply_remove_rocket(&mut self, correlation: CorrelationId, handle: RocketHandle) -> bool {
        let shot = self.shots.remove(&correlation);
        if let Some(s) = shot {
            if s.speculative {
                if let Err(e) = self.pool.release(s.handle) {
                    warn!(player = %self.id, error = %e, "refund release failed");
                }
            }
        } else if let Err(e) = self.pool.release(handle) {
            warn!(player = %self.id, error = %e, "refund for unknown shot");
        }
        self.rockets.rollback(correlation)
    }

    // ─── Authority-side mutation ───

    pub(crate) fn ledger_mut(&mut self) -> Option<&mut AuthorityLedger> {
        self.ledger.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Player {
        Player::new(
            ClientId(1),
            true,
            Vec3::ZERO,
            Rotator::default(),
            &MovementTuning::default(),
            &CombatTuning::default(),
        )
    }

    fn remote() -> Player {
        Player::new(
            ClientId(1),
            false,
            Vec3::ZERO,
            Rotator::default(),
            &MovementTuning::default(),
            &CombatTuning::default(),
        )
    }

    #[test]
    fn owner_tick_emits_location_and_rotation() {
        let mut p = owner();
        p.handle_accelerate(1.0);
        let out = p.tick(1.0 / 60.0);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].msg, GameMsg::SendLocation { .. }));
        assert!(matches!(out[1].msg, GameMsg::SendRotation { .. }));
        assert!(out.iter().all(|o| o.target == Target::Authority));
        assert!(p.location().x > 0.0);
    }

    #[test]
    fn missing_tuning_turns_tick_into_noop() {
        let mut p = owner();
        p.handle_accelerate(1.0);
        p.set_movement_tuning(None);
        assert!(p.tick(0.1).is_empty());
        assert!(p.tick(0.1).is_empty());
        assert_eq!(p.location(), Vec3::ZERO);

        p.set_movement_tuning(Some(MovementTuning::default()));
        assert_eq!(p.tick(0.1).len(), 2);
    }

    #[test]
    fn remote_copy_ignores_input_and_chases_target() {
        let mut p = remote();
        p.handle_accelerate(1.0);
        p.apply_location_target(Vec3::new(100.0, 0.0, 0.0));
        assert!(p.tick(0.1).is_empty());
        assert!(p.location().x > 0.0 && p.location().x < 100.0);
    }

    #[test]
    fn owner_ignores_its_own_echo() {
        let mut p = owner();
        p.apply_location_target(Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(p.smoothing().location_updates(), 0);
    }

    #[test]
    fn speculative_fire_starts_slot_and_decrements() {
        let combat = CombatTuning::default();
        let mut p = owner();
        let out = p.try_fire(CorrelationId(1), &combat, true).unwrap();
        assert!(matches!(out.msg, GameMsg::FireRocket { handle: RocketHandle(0), .. }));
        assert_eq!(p.rockets(), combat.starting_rockets - 1);
        assert_eq!(p.pool().active_count(), 1);
        assert_eq!(p.cooldown(), combat.fire_cooldown);
        assert_eq!(
            p.try_fire(CorrelationId(2), &combat, true),
            Err(FireDeclined::CoolingDown)
        );
    }

    #[test]
    fn non_speculative_fire_reserves_slot_only() {
        let combat = CombatTuning {
            fire_cooldown: 0.0,
            ..Default::default()
        };
        let mut p = owner();
        let first = p.try_fire(CorrelationId(1), &combat, false).unwrap();
        let second = p.try_fire(CorrelationId(2), &combat, false).unwrap();
        assert_eq!(p.rockets(), combat.starting_rockets);
        assert_eq!(p.pool().active_count(), 0);
        assert_eq!(p.rockets_in_use(), 2);
        // Reserved slots are not handed out twice.
        let handles: Vec<_> = [first, second]
            .iter()
            .map(|o| match o.msg {
                GameMsg::FireRocket { handle, .. } => handle,
                _ => unreachable!(),
            })
            .collect();
        assert_ne!(handles[0], handles[1]);
    }

    #[test]
    fn broadcast_corrects_speculative_slot_once() {
        let combat = CombatTuning::default();
        let mut p = owner();
        p.try_fire(CorrelationId(1), &combat, true).unwrap();
        let dir = Rotator::from_yaw(10.0).forward();
        p.apply_rocket_fired(CorrelationId(1), RocketHandle(0), Vec3::ZERO, dir)
            .unwrap();
        let flying = p.pool().get(RocketHandle(0)).unwrap().direction().unwrap();
        assert!((flying.y - dir.y).abs() < 1e-6);
        assert!(!p.apply_rockets(combat.starting_rockets - 1, Some(CorrelationId(1))));
        assert!(p.rocket_view().pending().is_empty());
    }

    #[test]
    fn refund_frees_slot_and_restores_count() {
        let combat = CombatTuning::default();
        let mut p = owner();
        p.try_fire(CorrelationId(1), &combat, true).unwrap();
        assert!(p.apply_remove_rocket(CorrelationId(1), RocketHandle(0)));
        assert_eq!(p.pool().active_count(), 0);
        assert_eq!(p.rockets(), combat.starting_rockets);
        assert_eq!(p.rockets_in_use(), 0);
    }

    #[test]
    fn broadcast_with_bad_handle_changes_nothing() {
        let mut p = remote();
        let bad = RocketHandle(200);
        assert_eq!(
            p.apply_rocket_fired(CorrelationId(1), bad, Vec3::ZERO, Vec3::UP),
            Err(PoolError::InvalidHandle(bad))
        );
        assert_eq!(p.pool().active_count(), 0);
    }

    #[test]
    fn pickup_is_consumed_once() {
        let mut p = owner();
        let mut pickup = Pickup::new(9, 5);
        assert!(p.consume_pickup(&mut pickup, CorrelationId(1), false).is_some());
        assert!(p.consume_pickup(&mut pickup, CorrelationId(2), false).is_none());
        assert!(pickup.is_consumed());
    }

    #[test]
    fn remote_copies_cannot_act() {
        let combat = CombatTuning::default();
        let mut p = remote();
        assert_eq!(
            p.try_fire(CorrelationId(1), &combat, false),
            Err(FireDeclined::NotLocallyControlled)
        );
        assert!(p.request_damage(CorrelationId(2), 10, false).is_none());
    }
}
