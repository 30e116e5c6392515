//! Configuration system.
//!
//! Loads game configuration from JSON strings/files (file IO left to app).
//! Movement and combat tuning travel with the config so client and server
//! agree on the same values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default)]
    pub movement: MovementTuning,
    #[serde(default)]
    pub combat: CombatTuning,
    #[serde(default)]
    pub net_sim: NetSimSettings,
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 60,
            player_name: default_player_name(),
            movement: MovementTuning::default(),
            combat: CombatTuning::default(),
            net_sim: NetSimSettings::default(),
        }
    }
}

impl GameConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        self.movement.validate()?;
        self.combat.validate()?;
        self.net_sim.validate()
    }
}

/// Per-tick vehicle handling values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementTuning {
    /// Units per second squared at full forward input.
    pub acceleration: f32,
    /// Turn rate in degrees per second at low speed.
    pub turn_speed: f32,
    pub max_velocity: f32,
    /// Velocity multiplier per second while coasting.
    pub default_friction: f32,
    /// Velocity multiplier per second while braking.
    pub braking_friction: f32,
    /// Fraction of `max_velocity` at which turning reaches full rate.
    pub turn_speed_threshold: f32,
    /// Exponent of the ease-out curve blending turn rate against speed.
    pub turn_blend_exponent: f32,
    /// Ease speed used by non-owning copies chasing the network target.
    pub interpolation_speed: f32,
}

impl Default for MovementTuning {
    fn default() -> Self {
        Self {
            acceleration: 500.0,
            turn_speed: 100.0,
            max_velocity: 2000.0,
            default_friction: 0.75,
            braking_friction: 0.001,
            turn_speed_threshold: 0.75,
            turn_blend_exponent: 5.0,
            interpolation_speed: 10.0,
        }
    }
}

impl MovementTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.default_friction) || !unit.contains(&self.braking_friction) {
            return Err(ConfigError::FrictionOutOfRange);
        }
        if self.max_velocity <= 0.0 || self.turn_speed_threshold <= 0.0 {
            return Err(ConfigError::NonPositiveSpeed);
        }
        Ok(())
    }
}

/// Which path the authority uses to tell peers about picked-up rockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PickupCreditPolicy {
    /// Every peer receives the new total.
    #[default]
    Broadcast,
    /// Only the owning connection receives the new total (HUD-only update).
    OwnerOnly,
}

/// Rocket and health tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatTuning {
    /// Number of pre-spawned rockets per player.
    pub pool_capacity: usize,
    pub max_concurrent_shots: usize,
    /// Seconds between accepted fire intents.
    pub fire_cooldown: f32,
    pub starting_rockets: i32,
    pub starting_health: i32,
    pub unlimited_rockets: bool,
    pub rocket_speed: f32,
    /// Seconds a rocket stays active before returning to the pool.
    pub rocket_lifetime: f32,
    /// Distance in front of the vehicle where rockets spawn.
    pub muzzle_offset: f32,
    /// Share of the reported-vs-actual yaw gap closed by the authority.
    pub heading_blend: f32,
    pub pickup_policy: PickupCreditPolicy,
}

impl Default for CombatTuning {
    fn default() -> Self {
        Self {
            pool_capacity: 8,
            max_concurrent_shots: 3,
            fire_cooldown: 1.0,
            starting_rockets: 5,
            starting_health: 100,
            unlimited_rockets: false,
            rocket_speed: 3000.0,
            rocket_lifetime: 3.0,
            muzzle_offset: 150.0,
            heading_blend: 0.5,
            pickup_policy: PickupCreditPolicy::Broadcast,
        }
    }
}

impl CombatTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if !(0.0..=1.0).contains(&self.heading_blend) {
            return Err(ConfigError::HeadingBlendOutOfRange);
        }
        if self.starting_rockets < 0 {
            return Err(ConfigError::NegativeRockets);
        }
        Ok(())
    }
}

/// Latency/loss injection for development builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetSimSettings {
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub packet_loss_percent: u32,
}

impl NetSimSettings {
    pub const MAX_LATENCY_MS: u32 = 5000;

    pub fn new(min_latency_ms: u32, max_latency_ms: u32, packet_loss_percent: u32) -> Self {
        Self {
            min_latency_ms,
            max_latency_ms,
            packet_loss_percent,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_latency_ms > Self::MAX_LATENCY_MS || self.max_latency_ms > Self::MAX_LATENCY_MS {
            return Err(ConfigError::LatencyOutOfRange);
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(ConfigError::LatencyInverted);
        }
        if self.packet_loss_percent > 100 {
            return Err(ConfigError::PacketLossOutOfRange);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroTickRate,
    FrictionOutOfRange,
    NonPositiveSpeed,
    EmptyPool,
    HeadingBlendOutOfRange,
    NegativeRockets,
    LatencyOutOfRange,
    LatencyInverted,
    PacketLossOutOfRange,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroTickRate => write!(f, "tick rate must be positive"),
            ConfigError::FrictionOutOfRange => write!(f, "friction must be within [0, 1]"),
            ConfigError::NonPositiveSpeed => {
                write!(f, "max velocity and turn threshold must be positive")
            }
            ConfigError::EmptyPool => write!(f, "rocket pool needs at least one slot"),
            ConfigError::HeadingBlendOutOfRange => write!(f, "heading blend must be within [0, 1]"),
            ConfigError::NegativeRockets => write!(f, "starting rockets cannot be negative"),
            ConfigError::LatencyOutOfRange => {
                write!(f, "latency must be within [0, {}] ms", NetSimSettings::MAX_LATENCY_MS)
            }
            ConfigError::LatencyInverted => write!(f, "min latency exceeds max latency"),
            ConfigError::PacketLossOutOfRange => write!(f, "packet loss must be within [0, 100]"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(GameConfig::default().validate(), Ok(()));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = GameConfig::from_json_str(
            r#"{"server_addr":"0.0.0.0:1","tick_hz":30,"combat":{"unlimited_rockets":true}}"#,
        )
        .unwrap();
        assert!(cfg.combat.unlimited_rockets);
        assert_eq!(cfg.combat.pool_capacity, 8);
        assert_eq!(cfg.movement.turn_blend_exponent, 5.0);
        assert_eq!(cfg.player_name, "Player");
    }

    #[test]
    fn net_sim_bounds() {
        assert_eq!(NetSimSettings::new(100, 100, 0).validate(), Ok(()));
        assert_eq!(NetSimSettings::new(0, 5000, 100).validate(), Ok(()));
        assert_eq!(
            NetSimSettings::new(200, 100, 0).validate(),
            Err(ConfigError::LatencyInverted)
        );
        assert_eq!(
            NetSimSettings::new(0, 5001, 0).validate(),
            Err(ConfigError::LatencyOutOfRange)
        );
        assert_eq!(
            NetSimSettings::new(0, 0, 101).validate(),
            Err(ConfigError::PacketLossOutOfRange)
        );
    }

    #[test]
    fn pickup_policy_parses_by_name() {
        let t: CombatTuning = serde_json::from_str(r#"{"pickup_policy":"OwnerOnly"}"#).unwrap();
        assert_eq!(t.pickup_policy, PickupCreditPolicy::OwnerOnly);
    }
}
