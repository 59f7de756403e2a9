//! Record of recently provisioned clickers, kept for the state surface on
//! the IPC bus. Entries expire after ten minutes and are pruned on read.

use crate::events::Event;
use crate::registry::Registry;
use flint::logging;
use flint::time;
use flint::ClickerId;
use std::sync::Mutex;

pub const MAX_LIVE_TIME_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HistoryEntry {
    pub id: ClickerId,
    pub name: String,
    pub finished_ms: u64,
    pub errored: bool,
}

pub struct History {
    entries: Mutex<Vec<HistoryEntry>>,
    ttl_ms: u64,
    log: logging::Logger,
}

impl History {
    pub fn new(log: &logging::Logger) -> History {
        History::with_ttl(MAX_LIVE_TIME_MS, log)
    }

    pub fn with_ttl(ttl_ms: u64, log: &logging::Logger) -> History {
        History {
            entries: Mutex::new(Vec::new()),
            ttl_ms,
            log: log.new(logging::o!()),
        }
    }

    pub fn add(&self, id: ClickerId, name: String, errored: bool, now_ms: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        entries.push(HistoryEntry {
            id,
            name,
            finished_ms: now_ms,
            errored,
        });
    }

    pub fn remove(&self, id: ClickerId) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|entry| entry.id != id);
    }

    /// Live entries, oldest first. Expired entries are pruned here.
    pub fn get_all(&self, now_ms: u64) -> Vec<HistoryEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ttl = self.ttl_ms;
        entries.retain(|entry| now_ms.saturating_sub(entry.finished_ms) <= ttl);
        entries.clone()
    }

    pub fn contains(&self, id: ClickerId, now_ms: u64) -> bool {
        self.get_all(now_ms).iter().any(|entry| entry.id == id)
    }

    pub fn consume_event(&self, event: &Event, registry: &Registry) {
        match *event {
            Event::HistoryAdd(id) => match registry.acquire(id) {
                Some(clicker) => {
                    self.add(id, clicker.name.clone(), clicker.has_fault(), time::monotonic_ms());
                }
                None => {
                    logging::debug!(self.log, "history add for a clicker that is gone";
                                    "clicker_id" => id);
                }
            },
            Event::HistoryRemove(id) => self.remove(id),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;

    fn history() -> History {
        History::new(&logging::discard())
    }

    #[test]
    fn test_add_and_get() {
        let history = history();

        history.add(42, "cd_a_b".to_string(), false, 0);

        let all = history.get_all(1);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 42);
        assert_eq!(all[0].name, "cd_a_b");
        assert!(!all[0].errored);
    }

    #[test]
    fn test_remove() {
        let history = history();
        history.add(1, "a".to_string(), false, 0);
        history.add(2, "b".to_string(), false, 0);

        history.remove(1);

        let all = history.get_all(1);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 2);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let history = history();
        history.add(42, "cd".to_string(), false, 0);

        // At 599 s the entry is still there, at 601 s it is gone.
        assert!(history.contains(42, 599_000));
        assert!(!history.contains(42, 601_000));
        assert!(history.get_all(700_000).is_empty());
    }

    #[test]
    fn test_prune_happens_on_read() {
        let history = history();
        history.add(1, "old".to_string(), false, 0);
        history.add(2, "new".to_string(), false, 500_000);

        let all = history.get_all(650_000);

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 2);
    }

    #[test]
    fn test_consume_events_snapshot_registry_state() {
        use crate::registry::Fault;

        let registry = Registry::new(&logging::discard());
        registry.create(7);
        {
            let mut clicker = registry.acquire(7).unwrap();
            clicker.name = "cd_x_y".to_string();
            clicker.fault = Some(Fault::GeneratePsk);
        }

        let history = history();
        history.consume_event(&Event::HistoryAdd(7), &registry);

        let now = flint::time::monotonic_ms() + 1;
        let all = history.get_all(now);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "cd_x_y");
        assert!(all[0].errored);

        history.consume_event(&Event::HistoryRemove(7), &registry);
        assert!(history.get_all(now).is_empty());
    }
}
