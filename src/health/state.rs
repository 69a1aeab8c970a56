//! Destination health state.
//!
//! # States
//! Each destination tracks two independent signals:
//! - active health, written only by the probe worker
//! - passive health, written only from proxied request outcomes
//!
//! Both start as `Unknown`.
//!
//! # Eligibility
//! ```text
//! eligible = (!active_enabled  || active  != Unhealthy)
//!         && (!passive_enabled || passive != Unhealthy)
//! ```
//! `Unknown` always counts as eligible.
//!
//! # Design Decisions
//! - Both signals are packed into one `AtomicU8` so a reader never sees a
//!   torn pair
//! - Updates go through `fetch_update`, no locks on the request path

use std::sync::atomic::{AtomicU8, Ordering};

/// Health value of one signal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DestinationHealth {
    #[default]
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for DestinationHealth {
    fn from(val: u8) -> Self {
        match val {
            1 => DestinationHealth::Healthy,
            2 => DestinationHealth::Unhealthy,
            _ => DestinationHealth::Unknown,
        }
    }
}

/// Snapshot of both health signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompositeHealth {
    pub active: DestinationHealth,
    pub passive: DestinationHealth,
}

impl CompositeHealth {
    pub fn new(active: DestinationHealth, passive: DestinationHealth) -> Self {
        Self { active, passive }
    }

    /// Apply the eligibility rule for the enabled dimensions.
    pub fn is_eligible(&self, active_enabled: bool, passive_enabled: bool) -> bool {
        (!active_enabled || self.active != DestinationHealth::Unhealthy)
            && (!passive_enabled || self.passive != DestinationHealth::Unhealthy)
    }

    fn pack(self) -> u8 {
        (self.active as u8) | ((self.passive as u8) << 2)
    }

    fn unpack(bits: u8) -> Self {
        Self {
            active: DestinationHealth::from(bits & 0b11),
            passive: DestinationHealth::from((bits >> 2) & 0b11),
        }
    }
}

/// Lock-free cell holding a [`CompositeHealth`].
#[derive(Debug, Default)]
pub struct AtomicCompositeHealth(AtomicU8);

impl AtomicCompositeHealth {
    pub fn load(&self) -> CompositeHealth {
        CompositeHealth::unpack(self.0.load(Ordering::Acquire))
    }

    /// Set the active signal. Returns true when the value changed.
    pub fn set_active(&self, health: DestinationHealth) -> bool {
        self.update(|current| CompositeHealth { active: health, ..current })
    }

    /// Set the passive signal. Returns true when the value changed.
    pub fn set_passive(&self, health: DestinationHealth) -> bool {
        self.update(|current| CompositeHealth { passive: health, ..current })
    }

    fn update(&self, f: impl Fn(CompositeHealth) -> CompositeHealth) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = CompositeHealth::unpack(bits);
                let next = f(current);
                (next != current).then(|| next.pack())
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DestinationHealth::*;

    #[test]
    fn test_unknown_is_eligible() {
        let health = CompositeHealth::default();
        assert!(health.is_eligible(true, true));
    }

    #[test]
    fn test_active_unhealthy_depends_on_enabled() {
        let health = CompositeHealth::new(Unhealthy, Unknown);
        assert!(!health.is_eligible(true, false));
        assert!(!health.is_eligible(true, true));
        assert!(health.is_eligible(false, true));
        assert!(health.is_eligible(false, false));
    }

    #[test]
    fn test_passive_unhealthy_depends_on_enabled() {
        let health = CompositeHealth::new(Healthy, Unhealthy);
        assert!(!health.is_eligible(false, true));
        assert!(health.is_eligible(true, false));
    }

    #[test]
    fn test_atomic_updates_are_independent() {
        let cell = AtomicCompositeHealth::default();
        assert!(cell.set_active(Healthy));
        assert!(!cell.set_active(Healthy));
        assert!(cell.set_passive(Unhealthy));

        assert_eq!(cell.load(), CompositeHealth::new(Healthy, Unhealthy));

        assert!(cell.set_active(Unhealthy));
        assert_eq!(cell.load(), CompositeHealth::new(Unhealthy, Unhealthy));
    }
}
