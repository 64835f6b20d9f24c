use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;

use crate::{
    metrics::{counter_inc, ERROR_MISS_ON_REMOVE, MAP_DROP_PROCESS_LRU},
    record::ProcessRecord,
};

/// Fixed-capacity map from exec id to record.
///
/// Capacity is a safety valve against unbounded growth, not the
/// reclamation mechanism: overflow evicts the least recently used entry
/// without consulting the color machine.
pub(crate) struct Store {
    entries: Mutex<LruCache<String, Arc<ProcessRecord>>>,
}

impl Store {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Inserts or replaces a record. Returns true when the insert pushed
    /// the least recently used entry out.
    pub(crate) fn add(&self, record: Arc<ProcessRecord>) -> bool {
        let exec_id = record.exec_id().to_owned();
        let evicted = {
            let mut entries = self.entries.lock();
            match entries.push(exec_id.clone(), record) {
                // push returns the old value when the key was already
                // present; only a different returned key is an eviction.
                Some((dropped, _)) => dropped != exec_id,
                None => false,
            }
        };
        if evicted {
            counter_inc(MAP_DROP_PROCESS_LRU);
        }
        evicted
    }

    /// Looks up a record and marks it most recently used.
    pub(crate) fn get(&self, exec_id: &str) -> Option<Arc<ProcessRecord>> {
        self.entries.lock().get(exec_id).cloned()
    }

    /// Deletes a record. A remove of an absent key is counted, not
    /// surfaced: the color machine and the sweep may both try.
    pub(crate) fn remove(&self, exec_id: &str) -> bool {
        let present = self.entries.lock().pop(exec_id).is_some();
        if !present {
            counter_inc(ERROR_MISS_ON_REMOVE);
        }
        present
    }

    /// Snapshot of the current records for the sweep. Entries may be
    /// removed concurrently; callers re-check state under the record's
    /// own lock.
    pub(crate) fn values(&self) -> Vec<Arc<ProcessRecord>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, record)| Arc::clone(record))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn purge(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use nix::unistd::Pid;

    use super::*;
    use crate::record::Process;

    fn record(exec_id: &str) -> Arc<ProcessRecord> {
        Arc::new(ProcessRecord::new(Process {
            exec_id: exec_id.to_owned(),
            pid: Pid::from_raw(1000),
            ppid: Pid::from_raw(1),
            image: "/usr/bin/true".to_owned(),
        }))
    }

    #[test]
    fn add_then_get() {
        let store = Store::new(NonZeroUsize::new(8).unwrap());
        assert!(!store.add(record("a")));
        let found = store.get("a").unwrap();
        assert_eq!(found.exec_id(), "a");
        assert!(store.get("b").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let store = Store::new(NonZeroUsize::new(2).unwrap());
        assert!(!store.add(record("a")));
        assert!(!store.add(record("b")));
        // Touch "a" so "b" is the eviction candidate.
        store.get("a");
        assert!(store.add(record("c")));
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn replacing_a_key_is_not_an_eviction() {
        let store = Store::new(NonZeroUsize::new(1).unwrap());
        assert!(!store.add(record("a")));
        assert!(!store.add(record("a")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = Store::new(NonZeroUsize::new(8).unwrap());
        store.add(record("a"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn values_snapshots_every_entry() {
        let store = Store::new(NonZeroUsize::new(8).unwrap());
        store.add(record("a"));
        store.add(record("b"));
        let mut ids: Vec<_> = store
            .values()
            .iter()
            .map(|r| r.exec_id().to_owned())
            .collect();
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn purge_empties_the_store() {
        let store = Store::new(NonZeroUsize::new(8).unwrap());
        store.add(record("a"));
        store.add(record("b"));
        store.purge();
        assert_eq!(store.len(), 0);
        assert!(store.get("a").is_none());
    }

    #[test]
    fn eviction_and_miss_counters_fire() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            let store = Store::new(NonZeroUsize::new(1).unwrap());
            store.add(record("a"));
            store.add(record("b"));
            store.remove("missing");
        });
        let snapshot = snapshotter.snapshot().into_vec();
        let counter = |name: &str| {
            snapshot.iter().find_map(|(key, _, _, value)| {
                (key.key().name() == name).then(|| match value {
                    DebugValue::Counter(v) => *v,
                    _ => 0,
                })
            })
        };
        assert_eq!(counter(MAP_DROP_PROCESS_LRU), Some(1));
        assert_eq!(counter(ERROR_MISS_ON_REMOVE), Some(1));
    }
}
