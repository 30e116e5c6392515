//! Session glue: players, routing and the fixed tick.
//!
//! A `Session` runs on every process. The one whose transport reports
//! `is_authority()` mints the [`AuthorityToken`], owns every
//! [`AuthorityLedger`] and answers requests; all others only send requests
//! for their own player and apply broadcasts.
//!
//! Tick order:
//! 1. poll the transport and handle delivered messages in order;
//! 2. drain self-addressed messages;
//! 3. tick players (owner prediction, remote interpolation, timers);
//! 4. drain self-addressed messages produced by step 3;
//! 5. push the ping to the presentation if it changed.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
};

use tracing::{debug, info, trace, warn};

use crate::{
    combat::{blend_heading, AuthorityLedger, FireDeclined},
    config::{
        CombatTuning, ConfigError, GameConfig, MovementTuning, NetSimSettings, PickupCreditPolicy,
    },
    math::{Rotator, Vec3},
    movement::InputIntent,
    net::{ClientId, CorrelationId, GameMsg},
    player::{Outgoing, Pickup, Player},
    pool::{PoolError, RocketHandle},
    presentation::Presentation,
    replica::AuthorityToken,
    transport::{Inbound, Target, Transport},
};

/// Errors from session-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Only the authority may spawn or despawn players.
    NotAuthority,
    AlreadySpawned(ClientId),
    UnknownPlayer(ClientId),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotAuthority => write!(f, "operation requires the authority"),
            SessionError::AlreadySpawned(id) => write!(f, "player {id} already spawned"),
            SessionError::UnknownPlayer(id) => write!(f, "no player for {id}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One process's view of the game session.
pub struct Session {
    transport: Box<dyn Transport>,
    presentation: Box<dyn Presentation>,
    token: Option<AuthorityToken>,
    movement: Option<MovementTuning>,
    combat: CombatTuning,
    players: BTreeMap<ClientId, Player>,
    loopback: VecDeque<GameMsg>,
    next_correlation: u64,
    last_ping: Option<u32>,
    widget_visible: bool,
}

impl Session {
    pub fn new(
        cfg: &GameConfig,
        transport: Box<dyn Transport>,
        presentation: Box<dyn Presentation>,
    ) -> Self {
        let token = transport.is_authority().then(AuthorityToken::mint);
        info!(
            local_id = %transport.local_id(),
            authority = token.is_some(),
            "Session created"
        );
        Self {
            transport,
            presentation,
            token,
            movement: Some(cfg.movement),
            combat: cfg.combat,
            players: BTreeMap::new(),
            loopback: VecDeque::new(),
            next_correlation: 1,
            last_ping: None,
            widget_visible: false,
        }
    }

    pub fn is_authority(&self) -> bool {
        self.token.is_some()
    }

    pub fn local_id(&self) -> ClientId {
        self.transport.local_id()
    }

    /// Last round trip pushed to the presentation.
    pub fn ping(&self) -> u32 {
        self.last_ping.unwrap_or(0)
    }

    pub fn combat_tuning(&self) -> &CombatTuning {
        &self.combat
    }

    pub fn player(&self, id: ClientId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// The player controlled by this process, once spawned.
    pub fn local_player(&self) -> Option<&Player> {
        self.players.get(&self.local_id())
    }

    fn local_player_mut(&mut self) -> Option<&mut Player> {
        let id = self.local_id();
        self.players.get_mut(&id)
    }

    /// Authoritative rocket count. `None` off the authority.
    pub fn authoritative_rockets(&self, id: ClientId) -> Option<i32> {
        Some(self.players.get(&id)?.ledger()?.rockets())
    }

    /// Authoritative health. `None` off the authority.
    pub fn authoritative_health(&self, id: ClientId) -> Option<i32> {
        Some(self.players.get(&id)?.ledger()?.health())
    }

    // ─── Lifecycle ───

    /// Creates the player owned by `id` and announces it.
    pub fn spawn_player(&mut self, id: ClientId, location: Vec3) -> Result<(), SessionError> {
        let Some(token) = &self.token else {
            return Err(SessionError::NotAuthority);
        };
        if self.players.contains_key(&id) {
            return Err(SessionError::AlreadySpawned(id));
        }
        let ledger = AuthorityLedger::new(
            token,
            self.combat.starting_health,
            self.combat.starting_rockets,
        );
        self.insert_spawned(id, location, ledger);
        Ok(())
    }

    fn insert_spawned(&mut self, id: ClientId, location: Vec3, ledger: AuthorityLedger) {
        let local = id == self.local_id();
        let mut player = self.new_player(id, local, location, Rotator::default());
        player.attach_ledger(ledger);
        let spawned = spawn_msg(&player);
        self.players.insert(id, player);
        info!(player = %id, local, "Player spawned");

        self.dispatch(Outgoing::new(spawned, Target::AllPeers));

        if !local {
            let existing: Vec<GameMsg> = self
                .players
                .values()
                .filter(|p| p.id() != id)
                .map(spawn_msg)
                .collect();
            for msg in existing {
                self.dispatch(Outgoing::new(msg, Target::Owner(id)));
            }
        }
    }

    fn new_player(&self, id: ClientId, local: bool, location: Vec3, rotation: Rotator) -> Player {
        let movement = self.movement.unwrap_or_default();
        let mut player = Player::new(id, local, location, rotation, &movement, &self.combat);
        if self.movement.is_none() {
            player.set_movement_tuning(None);
        }
        player
    }

    pub fn despawn_player(&mut self, id: ClientId) -> Result<(), SessionError> {
        if !self.is_authority() {
            return Err(SessionError::NotAuthority);
        }
        if self.players.remove(&id).is_none() {
            return Err(SessionError::UnknownPlayer(id));
        }
        info!(player = %id, "Player despawned");
        self.dispatch(Outgoing::new(
            GameMsg::PlayerDespawned { player: id },
            Target::AllPeers,
        ));
        Ok(())
    }

    // ─── Input ───

    pub fn set_input(&mut self, intent: InputIntent) {
        if let Some(p) = self.local_player_mut() {
            p.set_intent(intent);
        }
    }

    pub fn handle_accelerate(&mut self, value: f32) {
        if let Some(p) = self.local_player_mut() {
            p.handle_accelerate(value);
        }
    }

    pub fn handle_turn(&mut self, value: f32) {
        if let Some(p) = self.local_player_mut() {
            p.handle_turn(value);
        }
    }

    pub fn handle_brake_pressed(&mut self) {
        if let Some(p) = self.local_player_mut() {
            p.handle_brake_pressed();
        }
    }

    pub fn handle_brake_released(&mut self) {
        if let Some(p) = self.local_player_mut() {
            p.handle_brake_released();
        }
    }

    /// Fire button press. Declines are logged and otherwise ignored.
    pub fn handle_fire(&mut self) {
        let _ = self.fire();
    }

    // ─── Local actions ───

    fn next_correlation(&mut self) -> CorrelationId {
        let id = CorrelationId(self.next_correlation);
        self.next_correlation += 1;
        id
    }

    /// Sends a fire intent for the local player.
    pub fn fire(&mut self) -> Result<CorrelationId, FireDeclined> {
        let correlation = self.next_correlation();
        let speculate = self.is_authority();
        let combat = self.combat;
        let local = self.local_id();
        let Some(player) = self.players.get_mut(&local) else {
            return Err(FireDeclined::NotLocallyControlled);
        };
        let before = player.rockets();
        let out = match player.try_fire(correlation, &combat, speculate) {
            Ok(out) => out,
            Err(reason) => {
                debug!(player = %local, %reason, "Fire declined");
                return Err(reason);
            }
        };
        let after = player.rockets();
        if before != after {
            self.presentation.on_rocket_count_changed(local, after);
        }
        self.dispatch(out);
        Ok(correlation)
    }

    /// Requests damage against the local player.
    pub fn request_damage(&mut self, amount: i32) -> Option<CorrelationId> {
        let correlation = self.next_correlation();
        let speculate = self.is_authority();
        let local = self.local_id();
        let player = self.players.get_mut(&local)?;
        let out = player.request_damage(correlation, amount, speculate)?;
        let health = player.health();
        if speculate {
            self.presentation.on_health_changed(local, health);
        }
        self.dispatch(out);
        Some(correlation)
    }

    /// Consumes `pickup` for the local player.
    pub fn consume_pickup(&mut self, pickup: &mut Pickup) -> Option<CorrelationId> {
        let correlation = self.next_correlation();
        let speculate = self.is_authority();
        let local = self.local_id();
        let player = self.players.get_mut(&local)?;
        let out = player.consume_pickup(pickup, correlation, speculate)?;
        let rockets = player.rockets();
        if speculate {
            self.presentation.on_rocket_count_changed(local, rockets);
        }
        self.dispatch(out);
        Some(correlation)
    }

    // ─── Settings ───

    /// Replaces movement tuning on every player. `None` suspends prediction.
    pub fn set_movement_tuning(&mut self, tuning: Option<MovementTuning>) {
        self.movement = tuning;
        for p in self.players.values_mut() {
            p.set_movement_tuning(tuning);
        }
    }

    /// Validates and forwards latency/loss injection to the transport.
    pub fn update_network_simulation_settings(
        &mut self,
        settings: NetSimSettings,
    ) -> Result<(), ConfigError> {
        settings.validate()?;
        if self.transport.apply_simulation_settings(settings) {
            info!(
                min_ms = settings.min_latency_ms,
                max_ms = settings.max_latency_ms,
                loss = settings.packet_loss_percent,
                "Network simulation updated"
            );
        } else {
            debug!("Transport does not support network simulation");
        }
        Ok(())
    }

    pub fn set_debug_widget_visible(&mut self, visible: bool) {
        if visible == self.widget_visible {
            return;
        }
        self.widget_visible = visible;
        if visible {
            self.presentation.on_show_widget();
        } else {
            self.presentation.on_hide_widget();
        }
    }

    pub fn is_debug_widget_visible(&self) -> bool {
        self.widget_visible
    }

    // ─── Tick ───

    pub fn tick(&mut self, dt: f32) {
        for Inbound { from, msg } in self.transport.poll() {
            self.handle(from, msg);
        }
        self.drain_loopback();

        let local = self.local_id();
        let mut outgoing = Vec::new();
        for player in self.players.values_mut() {
            outgoing.extend(player.tick(dt));
        }
        for out in outgoing {
            self.dispatch(out);
        }
        let wants_fire = self.local_player().is_some_and(|p| p.intent().wants_fire());
        if wants_fire {
            let _ = self.fire();
        }
        self.drain_loopback();

        let ping = self.transport.round_trip_latency();
        if self.last_ping != Some(ping) {
            self.last_ping = Some(ping);
            if let Some(p) = self.players.get_mut(&local) {
                p.set_ping(ping);
            }
            self.presentation.on_ping_updated(ping);
        }
    }

    fn drain_loopback(&mut self) {
        let local = self.local_id();
        while let Some(msg) = self.loopback.pop_front() {
            self.handle(local, msg);
        }
    }

    // ─── Routing ───

    /// Sends to remote processes and queues the copy addressed to this one.
    fn dispatch(&mut self, out: Outgoing) {
        let local = self.local_id();
        let authority = self.is_authority();
        let (to_self, to_remote) = match out.target {
            Target::Authority => (authority, !authority),
            Target::AllPeers => (authority, true),
            Target::Owner(owner) => (owner == local, owner != local),
        };
        trace!(kind = out.msg.kind(), to = ?out.target, to_self, to_remote, "Dispatch");
        if to_self {
            self.loopback.push_back(out.msg.clone());
        }
        if to_remote {
            let reliability = out.msg.reliability();
            self.transport.send(out.msg, reliability, out.target);
        }
    }

    fn handle(&mut self, from: ClientId, msg: GameMsg) {
        if msg.is_request() {
            if !self.is_authority() {
                warn!(%from, kind = msg.kind(), "Request reached a non-authority, dropped");
                return;
            }
            if from != msg.player() {
                warn!(%from, player = %msg.player(), kind = msg.kind(), "Sender does not own player, dropped");
                return;
            }
            self.handle_request(msg);
        } else {
            if self.is_authority() && from != self.local_id() {
                warn!(%from, kind = msg.kind(), "Broadcast from a peer, dropped");
                return;
            }
            self.apply_broadcast(msg);
        }
    }

    // ─── Authority ───

    fn handle_request(&mut self, msg: GameMsg) {
        let combat = self.combat;
        let player_id = msg.player();
        let Some(player) = self.players.get_mut(&player_id) else {
            debug!(player = %player_id, kind = msg.kind(), "Request for unknown player");
            return;
        };
        let actual_rotation = player.rotation();
        let slot_ok = match &msg {
            GameMsg::FireRocket { handle, .. } => player.pool().contains(*handle),
            _ => true,
        };
        let Some(ledger) = player.ledger_mut() else {
            warn!(player = %player_id, "Authority player without ledger");
            return;
        };

        let reply = match msg {
            GameMsg::SendLocation { player, location } => Outgoing::new(
                GameMsg::LocationUpdate { player, location },
                Target::AllPeers,
            ),
            GameMsg::SendRotation { player, rotation } => Outgoing::new(
                GameMsg::RotationUpdate { player, rotation },
                Target::AllPeers,
            ),
            GameMsg::TakeDamage {
                player,
                correlation,
                amount,
            } => {
                if !ledger.accept(correlation) {
                    debug!(%player, ?correlation, "Duplicate damage request ignored");
                    return;
                }
                let health = ledger.apply_damage(amount);
                debug!(%player, amount, health, "Damage applied");
                Outgoing::new(
                    GameMsg::HealthChanged {
                        player,
                        correlation: Some(correlation),
                        health,
                    },
                    Target::AllPeers,
                )
            }
            GameMsg::RequestPickup {
                player,
                correlation,
                rockets,
            } => {
                if !ledger.accept(correlation) {
                    debug!(%player, ?correlation, "Duplicate pickup request ignored");
                    return;
                }
                let total = ledger.credit_rockets(rockets);
                debug!(%player, credited = rockets, total, "Rockets credited");
                match combat.pickup_policy {
                    PickupCreditPolicy::Broadcast => Outgoing::new(
                        GameMsg::RocketsCredited {
                            player,
                            correlation: Some(correlation),
                            rockets: total,
                        },
                        Target::AllPeers,
                    ),
                    PickupCreditPolicy::OwnerOnly => Outgoing::new(
                        GameMsg::RocketsCreditedOwner {
                            player,
                            correlation: Some(correlation),
                            rockets: total,
                        },
                        Target::Owner(player),
                    ),
                }
            }
            GameMsg::FireRocket {
                player,
                correlation,
                handle,
                location,
                rotation,
            } => {
                if !ledger.accept(correlation) {
                    debug!(%player, ?correlation, "Duplicate fire request ignored");
                    return;
                }
                let refund = Outgoing::new(
                    GameMsg::RemoveRocket {
                        player,
                        correlation,
                        handle,
                    },
                    Target::Owner(player),
                );
                if !slot_ok {
                    warn!(%player, rocket = handle.0, "Fire request names no slot, refunding");
                    refund
                } else {
                    fire_reply(
                        ledger,
                        &combat,
                        refund,
                        actual_rotation,
                        player,
                        correlation,
                        handle,
                        location,
                        rotation,
                    )
                }
            }
            other => {
                warn!(kind = other.kind(), "Not a request");
                return;
            }
        };
        self.dispatch(reply);
    }

    // ─── Broadcasts (every process) ───

    fn apply_broadcast(&mut self, msg: GameMsg) {
        match msg {
            GameMsg::PlayerSpawned {
                player,
                location,
                rotation,
                health,
                rockets,
            } => {
                if self.players.contains_key(&player) {
                    trace!(%player, "Spawn already known");
                    return;
                }
                let local = player == self.local_id();
                let mut p = self.new_player(player, local, location, rotation);
                p.apply_health(health, None);
                p.apply_rockets(rockets, None);
                self.players.insert(player, p);
                info!(%player, local, "Player joined");
                self.presentation.on_health_changed(player, health);
                self.presentation.on_rocket_count_changed(player, rockets);
            }
            GameMsg::PlayerDespawned { player } => {
                if self.players.remove(&player).is_some() {
                    info!(%player, "Player left");
                }
            }
            GameMsg::LocationUpdate { player, location } => {
                if let Some(p) = self.players.get_mut(&player) {
                    p.apply_location_target(location);
                }
            }
            GameMsg::RotationUpdate { player, rotation } => {
                if let Some(p) = self.players.get_mut(&player) {
                    p.apply_rotation_target(rotation);
                }
            }
            GameMsg::HealthChanged {
                player,
                correlation,
                health,
            } => {
                let Some(p) = self.players.get_mut(&player) else {
                    return;
                };
                if p.apply_health(health, correlation) {
                    let shown = p.health();
                    self.presentation.on_health_changed(player, shown);
                }
            }
            GameMsg::RocketsCredited {
                player,
                correlation,
                rockets,
            }
            | GameMsg::RocketsCreditedOwner {
                player,
                correlation,
                rockets,
            } => {
                let Some(p) = self.players.get_mut(&player) else {
                    return;
                };
                if p.apply_rockets(rockets, correlation) {
                    let shown = p.rockets();
                    self.presentation.on_rocket_count_changed(player, shown);
                }
            }
            GameMsg::RocketFired {
                player,
                correlation,
                handle,
                location,
                direction,
                rockets,
            } => {
                let Some(p) = self.players.get_mut(&player) else {
                    warn!(%player, "Rocket fired by unknown player");
                    return;
                };
                match p.apply_rocket_fired(correlation, handle, location, direction) {
                    Ok(()) => {}
                    Err(e @ PoolError::InvalidHandle(_)) => {
                        warn!(%player, error = %e, "Rocket broadcast ignored");
                        return;
                    }
                    Err(e) => warn!(%player, error = %e, "Rocket broadcast applied partially"),
                }
                if p.apply_rockets(rockets, Some(correlation)) {
                    let shown = p.rockets();
                    self.presentation.on_rocket_count_changed(player, shown);
                }
            }
            GameMsg::RemoveRocket {
                player,
                correlation,
                handle,
            } => {
                let Some(p) = self.players.get_mut(&player) else {
                    return;
                };
                let before = p.rockets();
                p.apply_remove_rocket(correlation, handle);
                let after = p.rockets();
                debug!(%player, rocket = handle.0, "Rocket refunded");
                if before != after {
                    self.presentation.on_rocket_count_changed(player, after);
                }
            }
            other => warn!(kind = other.kind(), "Not a broadcast"),
        }
    }
}

fn spawn_msg(p: &Player) -> GameMsg {
    let (health, rockets) = match p.ledger() {
        Some(l) => (l.health(), l.rockets()),
        None => (p.health(), p.rockets()),
    };
    GameMsg::PlayerSpawned {
        player: p.id(),
        location: p.location(),
        rotation: p.rotation(),
        health,
        rockets,
    }
}

/// Spends a rocket and builds the broadcast, or hands back `refund`.
#[allow(clippy::too_many_arguments)]
fn fire_reply(
    ledger: &mut AuthorityLedger,
    combat: &CombatTuning,
    refund: Outgoing,
    actual: Rotator,
    player: ClientId,
    correlation: CorrelationId,
    handle: RocketHandle,
    location: Vec3,
    reported: Rotator,
) -> Outgoing {
    let Some(rockets) = ledger.try_spend_rocket(combat.unlimited_rockets) else {
        debug!(%player, rocket = handle.0, "Fire refused, inventory empty");
        return refund;
    };
    let yaw = blend_heading(reported.yaw, actual.yaw, combat.heading_blend);
    debug!(%player, rocket = handle.0, yaw, rockets, "Rocket fired");
    Outgoing::new(
        GameMsg::RocketFired {
            player,
            correlation,
            handle,
            location,
            direction: Rotator::from_yaw(yaw).forward(),
            rockets,
        },
        Target::AllPeers,
    )
}
