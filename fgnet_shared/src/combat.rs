//! Rocket inventory, fire gating and the authority-side ledger.
//!
//! Every copy of a player decides locally whether a fire intent may even be
//! sent. Only the authority holds the [`AuthorityLedger`] whose counters are
//! the source of truth; peers learn about changes from broadcasts.

use std::fmt;

use crate::{
    config::CombatTuning,
    math::{delta_angle, normalize_axis},
    net::CorrelationId,
    replica::{AuthorityToken, Owned},
};

/// Why a fire intent never left the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDeclined {
    CoolingDown,
    OutOfRockets,
    TooManyActive,
    PoolExhausted,
    /// The player is not controlled by this process.
    NotLocallyControlled,
}

impl fmt::Display for FireDeclined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FireDeclined::CoolingDown => write!(f, "fire cooldown active"),
            FireDeclined::OutOfRockets => write!(f, "no rockets left"),
            FireDeclined::TooManyActive => write!(f, "too many rockets in flight"),
            FireDeclined::PoolExhausted => write!(f, "no free rocket slot"),
            FireDeclined::NotLocallyControlled => write!(f, "player is not locally controlled"),
        }
    }
}

impl std::error::Error for FireDeclined {}

/// Inputs to the local fire check.
#[derive(Debug, Clone, Copy)]
pub struct FireGate {
    pub cooldown: f32,
    pub displayed_rockets: i32,
    /// Rockets flying plus shots still awaiting the authority.
    pub in_use: usize,
    pub has_free_slot: bool,
}

/// Local admission check for a fire intent.
pub fn check_fire(gate: &FireGate, tuning: &CombatTuning) -> Result<(), FireDeclined> {
    if gate.cooldown > 0.0 {
        return Err(FireDeclined::CoolingDown);
    }
    if gate.displayed_rockets <= 0 && !tuning.unlimited_rockets {
        return Err(FireDeclined::OutOfRockets);
    }
    if gate.in_use >= tuning.max_concurrent_shots {
        return Err(FireDeclined::TooManyActive);
    }
    if !gate.has_free_slot {
        return Err(FireDeclined::PoolExhausted);
    }
    Ok(())
}

/// Moves `reported` toward `actual` by `blend` of the shortest angular gap.
pub fn blend_heading(reported_yaw: f32, actual_yaw: f32, blend: f32) -> f32 {
    normalize_axis(reported_yaw + delta_angle(reported_yaw, actual_yaw) * blend)
}

/// Authoritative counters of one player. Exists only on the authority.
///
/// ```compile_fail
/// fn second_writer<T: Clone>() {}
/// second_writer::<fgnet_shared::combat::AuthorityLedger>();
/// ```
#[derive(Debug)]
pub struct AuthorityLedger {
    health: Owned<i32>,
    rockets: Owned<i32>,
    last_correlation: Option<CorrelationId>,
}

impl AuthorityLedger {
    pub fn new(token: &AuthorityToken, health: i32, rockets: i32) -> Self {
        Self {
            health: Owned::new(health, token),
            rockets: Owned::new(rockets.max(0), token),
            last_correlation: None,
        }
    }

    pub fn health(&self) -> i32 {
        self.health.get()
    }

    pub fn rockets(&self) -> i32 {
        self.rockets.get()
    }

    /// Records `correlation` as applied. Returns false for a duplicate or
    /// stale id, which callers must ignore.
    pub fn accept(&mut self, correlation: CorrelationId) -> bool {
        if self.last_correlation.is_some_and(|last| correlation <= last) {
            return false;
        }
        self.last_correlation = Some(correlation);
        true
    }

    /// Spends one rocket if inventory allows. Returns the remaining count.
    pub fn try_spend_rocket(&mut self, unlimited: bool) -> Option<i32> {
        if unlimited {
            return Some(self.rockets.get());
        }
        if self.rockets.get() <= 0 {
            return None;
        }
        Some(self.rockets.update(|r| r - 1))
    }

    /// Adds picked-up rockets. Returns the new count.
    pub fn credit_rockets(&mut self, amount: i32) -> i32 {
        self.rockets.update(|r| r.saturating_add(amount.max(0)))
    }

    /// Applies damage, floored at zero. Returns the new health.
    pub fn apply_damage(&mut self, amount: i32) -> i32 {
        self.health.update(|h| h.saturating_sub(amount.max(0)).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_gate() -> FireGate {
        FireGate {
            cooldown: 0.0,
            displayed_rockets: 3,
            in_use: 0,
            has_free_slot: true,
        }
    }

    #[test]
    fn gate_checks_in_order() {
        let tuning = CombatTuning::default();
        assert_eq!(check_fire(&open_gate(), &tuning), Ok(()));

        let cooling = FireGate {
            cooldown: 0.2,
            displayed_rockets: 0,
            ..open_gate()
        };
        assert_eq!(check_fire(&cooling, &tuning), Err(FireDeclined::CoolingDown));

        let empty = FireGate {
            displayed_rockets: 0,
            ..open_gate()
        };
        assert_eq!(check_fire(&empty, &tuning), Err(FireDeclined::OutOfRockets));

        let busy = FireGate {
            in_use: tuning.max_concurrent_shots,
            ..open_gate()
        };
        assert_eq!(check_fire(&busy, &tuning), Err(FireDeclined::TooManyActive));

        let no_slot = FireGate {
            has_free_slot: false,
            ..open_gate()
        };
        assert_eq!(check_fire(&no_slot, &tuning), Err(FireDeclined::PoolExhausted));
    }

    #[test]
    fn unlimited_ammo_ignores_empty_inventory() {
        let tuning = CombatTuning {
            unlimited_rockets: true,
            ..Default::default()
        };
        let empty = FireGate {
            displayed_rockets: 0,
            ..open_gate()
        };
        assert_eq!(check_fire(&empty, &tuning), Ok(()));
    }

    #[test]
    fn heading_blend_halves_the_gap() {
        assert_eq!(blend_heading(0.0, 20.0, 0.5), 10.0);
        assert_eq!(blend_heading(10.0, 10.0, 0.5), 10.0);
        // Across the seam the short way round.
        assert_eq!(blend_heading(170.0, -170.0, 0.5), 180.0);
        assert_eq!(blend_heading(0.0, 20.0, 0.0), 0.0);
        assert_eq!(blend_heading(0.0, 20.0, 1.0), 20.0);
    }

    #[test]
    fn ledger_never_goes_negative() {
        let token = AuthorityToken::mint();
        let mut ledger = AuthorityLedger::new(&token, 100, 1);
        assert_eq!(ledger.try_spend_rocket(false), Some(0));
        assert_eq!(ledger.try_spend_rocket(false), None);
        assert_eq!(ledger.rockets(), 0);
        assert_eq!(ledger.try_spend_rocket(true), Some(0));

        assert_eq!(ledger.apply_damage(150), 0);
        assert_eq!(ledger.apply_damage(-5), 0);
        assert_eq!(ledger.credit_rockets(-3), 0);
        assert_eq!(ledger.credit_rockets(5), 5);
    }

    #[test]
    fn ledger_ignores_replayed_correlations() {
        let token = AuthorityToken::mint();
        let mut ledger = AuthorityLedger::new(&token, 100, 0);
        assert!(ledger.accept(CorrelationId(1)));
        assert!(!ledger.accept(CorrelationId(1)));
        assert!(ledger.accept(CorrelationId(3)));
        assert!(!ledger.accept(CorrelationId(2)));
    }
}
