//! Clicker registry. The registry exclusively owns clicker records; every
//! other component works through short-lived `ClickerGuard` views handed
//! out by `acquire`. Work on a single clicker is serialized by the
//! per-record lock while distinct clickers proceed in parallel.

use crate::events::Event;
use flint::crypto::{self, KeyExchanger};
use flint::logging;
use flint::ClickerId;
use hashbrown::HashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Terminal per-clicker failures. A set fault ends the session; the
/// keepalive sweep eventually tears the connection down.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Fault {
    GeneratePsk,
    EncodePayload,
}

/// State of one enrolled clicker.
pub struct Clicker {
    pub id: ClickerId,
    pub name: String,
    pub local_key: Option<Vec<u8>>,
    pub remote_key: Option<Vec<u8>>,
    pub shared_key: Option<Vec<u8>>,
    pub psk: Option<Vec<u8>>,
    pub identity: Option<Vec<u8>>,
    pub exchanger: KeyExchanger,
    pub provisioning: bool,
    /// Monotonic ms of successful provisioning, 0 while pending.
    pub finished_at: u64,
    pub fault: Option<Fault>,
}

impl Clicker {
    fn new(id: ClickerId) -> Clicker {
        Clicker {
            id,
            name: String::new(),
            local_key: None,
            remote_key: None,
            shared_key: None,
            psk: None,
            identity: None,
            exchanger: KeyExchanger::new(
                &crypto::P_MODULUS,
                crypto::GENERATOR,
                crypto::default_randomizer(),
            ),
            provisioning: false,
            finished_at: 0,
            fault: None,
        }
    }

    #[inline]
    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }
}

/// A record slot. `owners` counts the registry's own reference plus every
/// outstanding guard; mutations happen under the registry mutex or on the
/// guard drop path. The record memory itself lives as long as any `Arc`.
struct Slot {
    owners: AtomicU32,
    in_map: AtomicBool,
    record: Arc<parking_lot::Mutex<Clicker>>,
}

pub struct Registry {
    slots: Mutex<HashMap<ClickerId, Arc<Slot>>>,
    log: logging::Logger,
}

impl Registry {
    pub fn new(log: &logging::Logger) -> Registry {
        Registry {
            slots: Mutex::new(HashMap::new()),
            log: log.new(logging::o!()),
        }
    }

    /// Inserts a fresh record. The registry itself holds the first
    /// ownership reference.
    pub fn create(&self, id: ClickerId) {
        let slot = Arc::new(Slot {
            owners: AtomicU32::new(1),
            in_map: AtomicBool::new(true),
            record: Arc::new(parking_lot::Mutex::new(Clicker::new(id))),
        });

        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slots.insert(id, slot).is_some() {
            logging::error!(self.log, "replaced an existing record"; "clicker_id" => id);
        }

        logging::debug!(self.log, "record created"; "clicker_id" => id);
    }

    /// Drops the registry's reference. The record survives until the last
    /// outstanding guard releases it.
    pub fn remove(&self, id: ClickerId) {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match slots.remove(&id) {
            Some(slot) => {
                slot.in_map.store(false, Ordering::SeqCst);
                let remaining = slot.owners.fetch_sub(1, Ordering::SeqCst) - 1;
                logging::debug!(self.log, "record retired";
                                "clicker_id" => id,
                                "outstanding_owners" => remaining);
            }
            None => {
                logging::error!(self.log, "tried to remove a record that is not in the registry";
                                "clicker_id" => id);
            }
        }
    }

    /// Takes shared ownership of a record and its per-record lock.
    /// Returns none once the clicker has been torn down. The global mutex
    /// is held only long enough to bump the count; the record lock is
    /// taken outside it.
    pub fn acquire(&self, id: ClickerId) -> Option<ClickerGuard> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.get(&id).cloned()
        }?;

        slot.owners.fetch_add(1, Ordering::SeqCst);
        let record = parking_lot::Mutex::lock_arc(&slot.record);

        Some(ClickerGuard {
            slot,
            record: Some(record),
        })
    }

    pub fn count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.len()
    }

    /// Ids currently in the registry, ascending.
    pub fn ids(&self) -> Vec<ClickerId> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<ClickerId> = slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn consume_event(&self, event: &Event) {
        match *event {
            Event::ClickerCreate(id) => self.create(id),
            Event::ClickerDestroy(id) => self.remove(id),
            _ => {}
        }
    }

    #[cfg(test)]
    fn owners(&self, id: ClickerId) -> Option<u32> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.get(&id).map(|slot| slot.owners.load(Ordering::SeqCst))
    }
}

/// Exclusive view of one clicker record, held for the duration of a
/// critical section. Dropping the guard unlocks the record and gives the
/// ownership reference back.
pub struct ClickerGuard {
    slot: Arc<Slot>,
    record: Option<ArcMutexGuard<RawMutex, Clicker>>,
}

impl Deref for ClickerGuard {
    type Target = Clicker;

    #[inline]
    fn deref(&self) -> &Clicker {
        self.record.as_ref().expect("guard accessed after release")
    }
}

impl DerefMut for ClickerGuard {
    #[inline]
    fn deref_mut(&mut self) -> &mut Clicker {
        self.record.as_mut().expect("guard accessed after release")
    }
}

impl Drop for ClickerGuard {
    fn drop(&mut self) {
        // Unlock first, then surrender the ownership reference. A record
        // is destroyed only with a zero count after leaving the map,
        // which here is the final Arc going away.
        self.record.take();
        let remaining = self.slot.owners.fetch_sub(1, Ordering::SeqCst) - 1;

        // While the slot is in the map the registry holds a reference of
        // its own, so the count can only hit zero after removal.
        debug_assert!(remaining > 0 || !self.slot.in_map.load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;
    use std::thread;

    fn registry() -> Registry {
        Registry::new(&logging::discard())
    }

    #[test]
    fn test_create_and_count() {
        let reg = registry();

        reg.create(1);
        reg.create(2);

        assert_eq!(reg.count(), 2);
        assert_eq!(reg.ids(), vec![1, 2]);
    }

    #[test]
    fn test_acquire_unknown_id() {
        let reg = registry();

        assert!(reg.acquire(5).is_none());
    }

    #[test]
    fn test_acquire_bumps_and_release_restores_owners() {
        let reg = registry();
        reg.create(1);

        assert_eq!(reg.owners(1), Some(1));

        let guard = reg.acquire(1).unwrap();
        assert_eq!(reg.owners(1), Some(2));

        drop(guard);
        assert_eq!(reg.owners(1), Some(1));
    }

    #[test]
    fn test_mutations_through_guard_persist() {
        let reg = registry();
        reg.create(1);

        {
            let mut guard = reg.acquire(1).unwrap();
            guard.name = "cd_abc_1".to_string();
            guard.provisioning = true;
        }

        let guard = reg.acquire(1).unwrap();
        assert_eq!(guard.name, "cd_abc_1");
        assert!(guard.provisioning);
    }

    #[test]
    fn test_remove_makes_record_unreachable() {
        let reg = registry();
        reg.create(1);

        reg.remove(1);

        assert_eq!(reg.count(), 0);
        assert!(reg.acquire(1).is_none());
    }

    #[test]
    fn test_remove_races_with_outstanding_guard() {
        let reg = registry();
        reg.create(1);

        let mut guard = reg.acquire(1).unwrap();
        reg.remove(1);

        // The in-flight view stays valid until released.
        guard.name = "survivor".to_string();
        assert_eq!(guard.name, "survivor");
        assert!(reg.acquire(1).is_none());

        drop(guard);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn test_create_destroy_events() {
        let reg = registry();

        reg.consume_event(&Event::ClickerCreate(4));
        assert_eq!(reg.count(), 1);

        reg.consume_event(&Event::ClickerDestroy(4));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_serializes_writers() {
        let reg = Arc::new(registry());
        reg.create(1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for _ in 0..250 {
                        let mut guard = reg.acquire(1).unwrap();
                        // Non-atomic read-modify-write; only the record
                        // lock keeps this race-free.
                        let current = guard.finished_at;
                        guard.finished_at = current + 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(reg.acquire(1).unwrap().finished_at, 2000);
    }

    #[test]
    fn test_distinct_ids_do_not_block_each_other() {
        let reg = Arc::new(registry());
        reg.create(1);
        reg.create(2);

        let held = reg.acquire(1).unwrap();

        let other = Arc::clone(&reg);
        let handle = thread::spawn(move || {
            let guard = other.acquire(2).unwrap();
            guard.id
        });

        assert_eq!(handle.join().unwrap(), 2);
        drop(held);
    }
}
