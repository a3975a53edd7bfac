//! The single admin slot.
//!
//! Claims are serialized by a mutex. A claim from anyone but the current holder replaces
//! the holder, so among near-simultaneous claims the one serialized last wins.

use std::sync::{Mutex, MutexGuard};

use super::identity::ConnectionId;

/// Outcome of an admin claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The claimant now holds the slot; `replaced` is the previous holder, if any.
    Granted { replaced: Option<ConnectionId> },
    /// The claimant already held the slot. Nothing changed.
    AlreadyHeld,
}

#[derive(Debug, Default)]
pub struct AdminSlot {
    holder: Mutex<Option<ConnectionId>>,
}

impl AdminSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ConnectionId>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn holder(&self) -> Option<ConnectionId> {
        *self.lock()
    }

    pub fn is_held_by(&self, id: ConnectionId) -> bool {
        self.holder() == Some(id)
    }

    pub fn claim(&self, id: ConnectionId) -> Claim {
        let mut holder = self.lock();
        if *holder == Some(id) {
            return Claim::AlreadyHeld;
        }
        let replaced = holder.replace(id);
        Claim::Granted { replaced }
    }

    /// Empty the slot if `id` holds it. Returns whether the slot was cleared.
    pub fn release(&self, id: ConnectionId) -> bool {
        let mut holder = self.lock();
        if *holder == Some(id) {
            *holder = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claim_empty_slot() {
        let slot = AdminSlot::new();
        assert_eq!(slot.holder(), None);
        assert_eq!(
            slot.claim(ConnectionId::new(1)),
            Claim::Granted { replaced: None }
        );
        assert!(slot.is_held_by(ConnectionId::new(1)));
    }

    #[test]
    fn test_reclaim_by_holder_is_noop() {
        let slot = AdminSlot::new();
        slot.claim(ConnectionId::new(1));
        assert_eq!(slot.claim(ConnectionId::new(1)), Claim::AlreadyHeld);
        assert_eq!(slot.holder(), Some(ConnectionId::new(1)));
    }

    #[test]
    fn test_newer_claim_replaces_holder() {
        let slot = AdminSlot::new();
        slot.claim(ConnectionId::new(1));
        assert_eq!(
            slot.claim(ConnectionId::new(2)),
            Claim::Granted {
                replaced: Some(ConnectionId::new(1))
            }
        );
        assert!(!slot.is_held_by(ConnectionId::new(1)));
        assert!(slot.is_held_by(ConnectionId::new(2)));
    }

    #[test]
    fn test_release_only_by_holder() {
        let slot = AdminSlot::new();
        slot.claim(ConnectionId::new(3));
        assert!(!slot.release(ConnectionId::new(4)));
        assert_eq!(slot.holder(), Some(ConnectionId::new(3)));
        assert!(slot.release(ConnectionId::new(3)));
        assert_eq!(slot.holder(), None);
    }

    #[test]
    fn test_concurrent_claims_leave_one_claimant() {
        let slot = Arc::new(AdminSlot::new());
        let handles: Vec<_> = (1..=16)
            .map(|raw| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || slot.claim(ConnectionId::new(raw)))
            })
            .collect();

        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| matches!(c, Claim::Granted { .. }))
            .count();

        assert_eq!(grants, 16);
        let holder = slot.holder().unwrap();
        assert!((1..=16).contains(&holder.get()));
    }
}
