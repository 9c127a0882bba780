//! Per-key production locks.
//!
//! An entry exists for a [`CacheKey`] exactly while its production is in
//! flight. Unrelated keys never contend beyond a brief table lookup.

use encore_cache::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

type Table = Arc<Mutex<HashMap<CacheKey, watch::Receiver<()>>>>;

/// The in-flight production table.
#[derive(Debug, Clone, Default)]
pub struct Mutexes {
    table: Table,
}

/// Result of trying to claim a key.
#[derive(Debug)]
pub enum Slot {
    /// The caller now owns production of the key until the claim is dropped.
    Claimed(Claim),
    /// Someone else is producing the key.
    InFlight(InFlight),
}

impl Mutexes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, watch::Receiver<()>>> {
        // The table holds no invariants a panicking holder could break.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn claim(&self, key: &CacheKey) -> Slot {
        let mut table = self.lock();
        if let Some(done) = table.get(key) {
            return Slot::InFlight(InFlight { done: done.clone() });
        }
        let (sender, receiver) = watch::channel(());
        table.insert(key.clone(), receiver);
        Slot::Claimed(Claim { key: key.clone(), table: Arc::clone(&self.table), _done: sender })
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Ownership of a key's production. Dropping it, on success or failure,
/// removes the entry and then wakes every waiter.
#[derive(Debug)]
pub struct Claim {
    key: CacheKey,
    table: Table,
    _done: watch::Sender<()>,
}

impl Claim {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
        // `_done` drops after this, closing the channel for waiters.
    }
}

/// A handle on someone else's production.
#[derive(Debug)]
pub struct InFlight {
    done: watch::Receiver<()>,
}

impl InFlight {
    /// Resolves once the production has finished, successfully or not.
    pub async fn finished(mut self) {
        // Nothing is ever sent, so this only returns once the sender is gone.
        while self.done.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_claim_then_in_flight() {
        let mutexes = Mutexes::new();
        let key = CacheKey::new("m1", "FLAC");
        let Slot::Claimed(claim) = mutexes.claim(&key) else {
            panic!("first claim must succeed");
        };
        assert!(matches!(mutexes.claim(&key), Slot::InFlight(_)));
        assert!(matches!(mutexes.claim(&CacheKey::new("m1", "WAV")), Slot::Claimed(_)));
        assert!(mutexes.is_in_flight(&key));
        drop(claim);
        assert!(!mutexes.is_in_flight(&key));
        assert!(mutexes.is_empty());
        assert!(matches!(mutexes.claim(&key), Slot::Claimed(_)));
    }

    #[tokio::test]
    async fn test_waiters_wake_on_release() {
        let mutexes = Mutexes::new();
        let key = CacheKey::new("m1", "FLAC");
        let Slot::Claimed(claim) = mutexes.claim(&key) else {
            panic!("first claim must succeed");
        };
        let waiters: Vec<_> = (0..3)
            .map(|_| match mutexes.claim(&key) {
                Slot::InFlight(in_flight) => {
                    let table = mutexes.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        in_flight.finished().await;
                        table.is_in_flight(&key)
                    })
                },
                Slot::Claimed(_) => panic!("key is already claimed"),
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));
        drop(claim);
        for waiter in waiters {
            // The entry is gone by the time anyone is woken.
            assert!(!waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_finished_after_release_returns_immediately() {
        let mutexes = Mutexes::new();
        let key = CacheKey::new("m1", "FLAC");
        let Slot::Claimed(claim) = mutexes.claim(&key) else {
            panic!("first claim must succeed");
        };
        let Slot::InFlight(in_flight) = mutexes.claim(&key) else {
            panic!("key is already claimed");
        };
        drop(claim);
        tokio::time::timeout(Duration::from_secs(1), in_flight.finished()).await.unwrap();
    }
}
