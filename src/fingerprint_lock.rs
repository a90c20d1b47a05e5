//! Per-fingerprint mutual exclusion.
//!
//! Two requests carrying identical new content must not both miss the
//! duplicate check and both upload. Holding a [`FingerprintGuard`] from the
//! ledger lookup through the ledger commit serializes ingestions of the same
//! content while unrelated fingerprints proceed concurrently.
//!
//! Slots are held weakly: once the last guard for a fingerprint is dropped
//! its entry becomes dead and is pruned on the next acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::fingerprint::Fingerprint;

#[derive(Default)]
pub struct FingerprintLocks {
    slots: Mutex<HashMap<Fingerprint, Weak<AsyncMutex<()>>>>,
}

/// Held while a fingerprint is being checked and ingested.
pub struct FingerprintGuard {
    _guard: OwnedMutexGuard<()>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other task holds `fingerprint`.
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> FingerprintGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| slot.strong_count() > 0);
            match slots.get(fingerprint).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(AsyncMutex::new(()));
                    slots.insert(fingerprint.clone(), Arc::downgrade(&slot));
                    slot
                }
            }
        };

        FingerprintGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of fingerprints with a live guard or waiter.
    pub fn in_flight(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_fingerprint_is_serialized() {
        let locks = Arc::new(FingerprintLocks::new());
        let fp = Fingerprint::of(b"shared");

        let first = locks.acquire(&fp).await;
        let waiter = {
            let locks = locks.clone();
            let fp = fp.clone();
            tokio::spawn(async move {
                let _second = locks.acquire(&fp).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second acquire should wait");

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("second acquire should proceed after release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_fingerprints_do_not_block() {
        let locks = FingerprintLocks::new();
        let _a = locks.acquire(&Fingerprint::of(b"a")).await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire(&Fingerprint::of(b"b")))
            .await;
        assert!(b.is_ok());
        assert_eq!(locks.in_flight(), 2);
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = FingerprintLocks::new();
        {
            let _g = locks.acquire(&Fingerprint::of(b"temp")).await;
            assert_eq!(locks.in_flight(), 1);
        }
        assert_eq!(locks.in_flight(), 0);

        let _other = locks.acquire(&Fingerprint::of(b"other")).await;
        let slots = locks.slots.lock().unwrap();
        assert_eq!(slots.len(), 1);
    }
}
