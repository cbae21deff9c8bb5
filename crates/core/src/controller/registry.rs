use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{EngineError, Result};

/// Single-instance slot shared by everything that may construct a controller.
///
/// Only one [`RegistrySlot`] can be alive per registry; the slot is released
/// when the controller holding it is disposed or dropped.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    occupied: Arc<AtomicBool>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) -> Result<RegistrySlot> {
        self.occupied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::AlreadyRegistered)?;
        Ok(RegistrySlot {
            occupied: self.occupied.clone(),
        })
    }
}

#[derive(Debug)]
pub(crate) struct RegistrySlot {
    occupied: Arc<AtomicBool>,
}

impl Drop for RegistrySlot {
    fn drop(&mut self) {
        self.occupied.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_exclusive_until_dropped() {
        let registry = EngineRegistry::new();
        let slot = registry.acquire().unwrap();

        assert!(registry.is_occupied());
        assert!(matches!(registry.acquire(), Err(EngineError::AlreadyRegistered)));

        drop(slot);
        assert!(!registry.is_occupied());
        assert!(registry.acquire().is_ok());
    }

    #[test]
    fn clones_share_the_slot() {
        let registry = EngineRegistry::new();
        let _slot = registry.clone().acquire().unwrap();
        assert!(registry.acquire().is_err());
    }
}
