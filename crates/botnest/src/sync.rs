//! Keyed synchronization for ledger writes and session activation.
//!
//! Two places need per-key mutual exclusion: ledger read-modify-write
//! cycles (one writer per record at a time, so concurrent sessions never
//! lose updates) and session activation (the reconcile sweep and a
//! command-triggered start must never double-start the same id).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Idle age past which an unheld slot is dropped.
const MAX_IDLE_AGE: Duration = Duration::from_secs(3600);

/// One stale sweep per this many acquisitions.
const SWEEP_EVERY: u64 = 512;

/// What a lock protects. Ids are scoped per domain, so user "42" and chat
/// "42" lock independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockDomain {
    User,
    Chat,
    Stats,
    Session,
}

/// A typed lock key: the domain plus the id within it.
#[derive(Debug, Clone, Copy)]
pub enum LockKey<'a> {
    User(&'a str),
    Chat(&'a str),
    Stats(&'a str),
    Session(&'a str),
}

impl LockKey<'_> {
    fn parts(&self) -> (LockDomain, &str) {
        match *self {
            LockKey::User(id) => (LockDomain::User, id),
            LockKey::Chat(id) => (LockDomain::Chat, id),
            LockKey::Stats(id) => (LockDomain::Stats, id),
            LockKey::Session(id) => (LockDomain::Session, id),
        }
    }
}

struct Slot {
    mutex: Arc<Mutex<()>>,
    touched: Instant,
}

/// Per-key async mutexes with amortized stale-slot cleanup.
///
/// `acquire` calls for the same key queue on one mutex; different keys
/// proceed independently. Sender ids churn constantly, so every
/// `SWEEP_EVERY` acquisitions the map drops slots nobody has held or
/// touched for `MAX_IDLE_AGE`.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<DashMap<(LockDomain, String), Slot>>,
    acquisitions: Arc<AtomicU64>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, creating its slot on first use. The guard
    /// keeps the slot alive until it is dropped.
    pub async fn acquire(&self, key: LockKey<'_>) -> OwnedMutexGuard<()> {
        let (domain, id) = key.parts();
        let now = Instant::now();
        let mutex = self
            .slots
            .entry((domain, id.to_string()))
            .and_modify(|slot| slot.touched = now)
            .or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                touched: now,
            })
            .mutex
            .clone();

        if self.acquisitions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let removed = self.sweep_idle(MAX_IDLE_AGE);
            if removed > 0 {
                debug!(removed, remaining = self.slots.len(), "Dropped idle lock slots");
            }
        }

        mutex.lock_owned().await
    }

    /// Drop slots idle for longer than `max_age` that nobody holds.
    /// Returns the number removed.
    fn sweep_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            // strong_count > 1 means a guard or a pending acquire is alive
            Arc::strong_count(&slot.mutex) > 1 || now.duration_since(slot.touched) <= max_age
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn same_key_serializes_until_the_guard_drops() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire(LockKey::User("111")).await;

        let blocked = tokio::time::timeout(ms(20), locks.acquire(LockKey::User("111"))).await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired = tokio::time::timeout(ms(20), locks.acquire(LockKey::User("111"))).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn domains_scope_the_same_id_independently() {
        let locks = KeyedLocks::new();
        let _user = locks.acquire(LockKey::User("42")).await;

        let chat = tokio::time::timeout(ms(20), locks.acquire(LockKey::Chat("42"))).await;
        assert!(chat.is_ok());
        let session = tokio::time::timeout(ms(20), locks.acquire(LockKey::Session("42"))).await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn sweep_drops_only_idle_unheld_slots() {
        let locks = KeyedLocks::new();
        let old = Instant::now() - Duration::from_secs(120);

        locks.slots.insert(
            (LockDomain::User, "idle".into()),
            Slot {
                mutex: Arc::new(Mutex::new(())),
                touched: old,
            },
        );

        let held = locks.acquire(LockKey::User("held")).await;
        if let Some(mut slot) = locks.slots.get_mut(&(LockDomain::User, "held".to_string())) {
            slot.touched = old;
        }

        drop(locks.acquire(LockKey::User("fresh")).await);

        assert_eq!(locks.sweep_idle(Duration::from_secs(60)), 1);
        assert!(!locks.slots.contains_key(&(LockDomain::User, "idle".to_string())));
        assert!(locks.slots.contains_key(&(LockDomain::User, "held".to_string())));
        assert!(locks.slots.contains_key(&(LockDomain::User, "fresh".to_string())));
        drop(held);
    }

    #[test]
    fn sweep_on_empty_is_safe() {
        assert_eq!(KeyedLocks::new().sweep_idle(Duration::from_secs(1)), 0);
    }
}
