//! Single-writer replicated values.
//!
//! A replicated field exists as exactly one [`Owned`] value on the authority
//! and any number of [`Replica`] views everywhere else (the authority keeps
//! a view too, for its own display). Only `Owned` has mutators, and an
//! `Owned` can only be built from an [`AuthorityToken`], which only an
//! authority session hands out.
//!
//! Replicas additionally track speculative local effects. A pending effect
//! is keyed by the [`CorrelationId`] of the request that caused it and is
//! either settled by the authoritative broadcast carrying the same id or
//! rolled back by a refusal.

use std::ops::Add;

use crate::net::CorrelationId;

/// Proof that the holder runs the authority side of the session.
#[derive(Debug)]
pub struct AuthorityToken {
    _private: (),
}

impl AuthorityToken {
    pub(crate) fn mint() -> Self {
        Self { _private: () }
    }
}

/// The authoritative copy of a replicated field.
///
/// Not `Clone`: a copy would be a second writer.
///
/// ```compile_fail
/// fn second_writer<T: Clone>() {}
/// second_writer::<fgnet_shared::replica::Owned<i32>>();
/// ```
#[derive(Debug, PartialEq)]
pub struct Owned<T> {
    value: T,
}

impl<T: Copy> Owned<T> {
    pub fn new(value: T, _token: &AuthorityToken) -> Self {
        Self { value }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// Applies `f` and returns the new value.
    pub fn update(&mut self, f: impl FnOnce(T) -> T) -> T {
        self.value = f(self.value);
        self.value
    }
}

/// A local effect applied ahead of the authority's answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pending<T> {
    pub correlation: CorrelationId,
    pub delta: T,
}

/// Eventually-consistent read-only view of an [`Owned`] value.
#[derive(Debug, Clone, PartialEq)]
pub struct Replica<T> {
    confirmed: T,
    pending: Vec<Pending<T>>,
}

impl<T> Replica<T>
where
    T: Copy + PartialEq + Add<Output = T>,
{
    pub fn new(initial: T) -> Self {
        Self {
            confirmed: initial,
            pending: Vec::new(),
        }
    }

    /// Displayed value: last broadcast plus unsettled local effects.
    pub fn get(&self) -> T {
        self.pending
            .iter()
            .fold(self.confirmed, |acc, p| acc + p.delta)
    }

    /// Last value received from the authority.
    pub fn confirmed(&self) -> T {
        self.confirmed
    }

    pub fn pending(&self) -> &[Pending<T>] {
        &self.pending
    }

    pub fn has_pending(&self, correlation: CorrelationId) -> bool {
        self.pending.iter().any(|p| p.correlation == correlation)
    }

    /// Records a speculative effect. A second effect under the same id
    /// replaces the first so retries never stack.
    pub fn apply_speculative(&mut self, correlation: CorrelationId, delta: T) {
        self.pending.retain(|p| p.correlation != correlation);
        self.pending.push(Pending { correlation, delta });
    }

    /// Adopts an authoritative value and settles the matching effect.
    ///
    /// Returns true when the displayed value changed.
    pub fn apply_broadcast(&mut self, value: T, correlation: Option<CorrelationId>) -> bool {
        let before = self.get();
        self.confirmed = value;
        if let Some(c) = correlation {
            self.pending.retain(|p| p.correlation != c);
        }
        before != self.get()
    }

    /// Drops a refused effect. Returns true when one was pending.
    pub fn rollback(&mut self, correlation: CorrelationId) -> bool {
        let len = self.pending.len();
        self.pending.retain(|p| p.correlation != correlation);
        len != self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_mutates_only_through_its_api() {
        let token = AuthorityToken::mint();
        let mut rockets = Owned::new(3, &token);
        assert_eq!(rockets.update(|r| r - 1), 2);
        rockets.set(10);
        assert_eq!(rockets.get(), 10);
    }

    #[test]
    fn speculation_is_settled_by_matching_broadcast() {
        let mut r = Replica::new(3);
        r.apply_speculative(CorrelationId(1), -1);
        assert_eq!(r.get(), 2);
        assert_eq!(r.confirmed(), 3);

        let changed = r.apply_broadcast(2, Some(CorrelationId(1)));
        assert!(!changed);
        assert_eq!(r.get(), 2);
        assert!(r.pending().is_empty());
    }

    #[test]
    fn unrelated_broadcast_keeps_pending_effects() {
        let mut r = Replica::new(3);
        r.apply_speculative(CorrelationId(1), -1);
        // A pickup lands before the shot is confirmed.
        r.apply_broadcast(8, Some(CorrelationId(9)));
        assert_eq!(r.get(), 7);
        r.apply_broadcast(7, Some(CorrelationId(1)));
        assert_eq!(r.get(), 7);
    }

    #[test]
    fn rollback_restores_confirmed_value() {
        let mut r = Replica::new(1);
        r.apply_speculative(CorrelationId(4), -1);
        assert_eq!(r.get(), 0);
        assert!(r.rollback(CorrelationId(4)));
        assert_eq!(r.get(), 1);
        assert!(!r.rollback(CorrelationId(4)));
    }

    #[test]
    fn retried_speculation_does_not_stack() {
        let mut r = Replica::new(5);
        r.apply_speculative(CorrelationId(2), -1);
        r.apply_speculative(CorrelationId(2), -1);
        assert_eq!(r.get(), 4);
    }
}
