//! Ownership guards for the radio.
//!
//! A radio adapter allows one scan at a time and one session per peripheral,
//! across the whole process. Both rules are enforced by RAII guards over
//! process-wide tables keyed by [`Transport::adapter_key`]: acquiring fails
//! fast with a typed error, and dropping the guard releases the claim on
//! every exit path.
//!
//! [`Transport::adapter_key`]: crate::Transport::adapter_key

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::PeripheralId;

/// Adapters with a live scan.
static SCANNING: LazyLock<Mutex<HashSet<Arc<str>>>> = LazyLock::new(Mutex::default);

/// Peripherals owned by live sessions, per adapter.
static OWNED: LazyLock<Mutex<HashSet<(Arc<str>, PeripheralId)>>> =
    LazyLock::new(Mutex::default);

/// The scan slot of one adapter.
#[derive(Debug, Clone)]
pub(crate) struct ScanGate {
    adapter: Arc<str>,
}

impl ScanGate {
    pub(crate) fn new(adapter: &str) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    /// Claim the slot, failing with [`Error::ScanAlreadyActive`] if taken.
    pub(crate) fn acquire(&self) -> Result<ScanSlot> {
        if !lock(&SCANNING).insert(Arc::clone(&self.adapter)) {
            return Err(Error::ScanAlreadyActive);
        }
        Ok(ScanSlot {
            adapter: Arc::clone(&self.adapter),
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&SCANNING).contains(&self.adapter)
    }
}

/// Held by a scan stream for as long as it may scan.
#[derive(Debug)]
pub(crate) struct ScanSlot {
    adapter: Arc<str>,
}

impl Drop for ScanSlot {
    fn drop(&mut self) {
        lock(&SCANNING).remove(&self.adapter);
    }
}

/// Registry of the peripherals of one adapter owned by live sessions.
#[derive(Debug, Clone)]
pub(crate) struct SessionRegistry {
    adapter: Arc<str>,
}

impl SessionRegistry {
    pub(crate) fn new(adapter: &str) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    /// Claim `peripheral`, failing with [`Error::SessionConflict`] if a live
    /// session already owns it.
    pub(crate) fn claim(&self, peripheral: PeripheralId) -> Result<SessionClaim> {
        let key = (Arc::clone(&self.adapter), peripheral);
        if !lock(&OWNED).insert(key.clone()) {
            return Err(Error::SessionConflict { peripheral: key.1 });
        }
        debug!(peripheral = %key.1, "Claimed peripheral");
        Ok(SessionClaim { key })
    }

    pub(crate) fn contains(&self, peripheral: &PeripheralId) -> bool {
        lock(&OWNED).contains(&(Arc::clone(&self.adapter), peripheral.clone()))
    }
}

/// Exclusive ownership of one peripheral.
#[derive(Debug)]
pub(crate) struct SessionClaim {
    key: (Arc<str>, PeripheralId),
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        lock(&OWNED).remove(&self.key);
        debug!(peripheral = %self.key.1, "Released peripheral");
    }
}

// The tables stay consistent even if a holder panicked, so poisoning is ignored.
fn lock<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tables are process-wide, so every test uses its own adapter key.

    #[test]
    fn test_scan_slot_is_exclusive() {
        let gate = ScanGate::new("guard-test:scan");
        let slot = gate.acquire().unwrap();
        assert!(gate.is_active());
        assert!(matches!(gate.acquire(), Err(Error::ScanAlreadyActive)));

        drop(slot);
        assert!(!gate.is_active());
        assert!(gate.acquire().is_ok());
    }

    #[test]
    fn test_gates_over_one_adapter_share_the_slot() {
        let first = ScanGate::new("guard-test:shared");
        let second = ScanGate::new("guard-test:shared");
        let other = ScanGate::new("guard-test:other");

        let _slot = first.acquire().unwrap();
        assert!(second.is_active());
        assert!(matches!(second.acquire(), Err(Error::ScanAlreadyActive)));
        assert!(other.acquire().is_ok());
    }

    #[test]
    fn test_session_claim_is_exclusive_per_peripheral() {
        let registry = SessionRegistry::new("guard-test:sessions");
        let a = PeripheralId::new("A");
        let claim = registry.claim(a.clone()).unwrap();

        assert!(matches!(
            registry.claim(a.clone()),
            Err(Error::SessionConflict { peripheral }) if peripheral == a
        ));
        // Another registry over the same adapter sees the claim.
        let twin = SessionRegistry::new("guard-test:sessions");
        assert!(twin.contains(&a));
        assert!(twin.claim(a.clone()).is_err());
        // A different peripheral, or the same one on another adapter, is unaffected.
        let _other = registry.claim(PeripheralId::new("B")).unwrap();
        let _elsewhere = SessionRegistry::new("guard-test:elsewhere")
            .claim(a.clone())
            .unwrap();

        drop(claim);
        assert!(!registry.contains(&a));
        assert!(registry.claim(a).is_ok());
    }
}
