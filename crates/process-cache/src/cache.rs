//! Keyed process cache with deferred reclamation.
//!
//! Event handlers take and drop references on cached records as events
//! flow through. A record whose count drops to zero is handed to a
//! dedicated collector task which walks it through a two-tick color
//! machine before removing it, so that late out-of-order events can still
//! resurrect it. A periodic sweep reclaims records whose process tree has
//! exited even when a leaked reference keeps the count above zero.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

use crate::{
    config::{CacheConfig, ConfigError, GC_INTERVAL, STALE_MAX_AGE},
    metrics::{counter_inc, ERROR_EVICTED, ERROR_MISS_ON_GET, REMOVED_STALE},
    record::{Color, ProcessRecord},
    store::Store,
};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no cache entry for exec id {0}")]
    MissingEntry(String),
}

/// Handle to the process cache. Clones share the store and the collector.
#[derive(Clone)]
pub struct Cache {
    store: Arc<Store>,
    delete_tx: mpsc::UnboundedSender<Arc<ProcessRecord>>,
    stop_tx: mpsc::Sender<()>,
}

impl Cache {
    /// Creates the cache and spawns its collector task. Must be called
    /// from within a tokio runtime.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        let capacity =
            NonZeroUsize::new(config.cache_size).ok_or_else(|| ConfigError::InvalidValue {
                field: "process_cache_size".to_string(),
                value: config.cache_size.to_string(),
                err: "cache capacity must be positive".to_string(),
            })?;
        let store = Arc::new(Store::new(capacity));
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let collector = Collector {
            store: Arc::clone(&store),
            delete_rx,
            stop_rx,
            stale_interval: (config.stale_interval > 0)
                .then(|| Duration::from_secs(config.stale_interval * 60)),
        };
        tokio::spawn(collector.run());
        Ok(Self {
            store,
            delete_tx,
            stop_tx,
        })
    }

    /// Inserts a record. Must be called only from the clone/exec event
    /// paths, which own the record's initial reference. Returns true when
    /// the insert evicted the least recently used entry.
    pub fn add(&self, record: Arc<ProcessRecord>) -> bool {
        let evicted = self.store.add(record);
        if evicted {
            counter_inc(ERROR_EVICTED);
        }
        evicted
    }

    pub fn get(&self, exec_id: &str) -> Result<Arc<ProcessRecord>, CacheError> {
        match self.store.get(exec_id) {
            Some(record) => Ok(record),
            None => {
                log::debug!("process {exec_id} not found in cache");
                counter_inc(ERROR_MISS_ON_GET);
                Err(CacheError::MissingEntry(exec_id.to_owned()))
            }
        }
    }

    /// Takes one reference on `record` for `reason`.
    pub fn ref_inc(&self, record: &ProcessRecord, reason: &str) {
        record.ref_inc(reason);
    }

    /// Drops one reference on `record` for `reason`. When this was the
    /// last reference the record is handed to the collector.
    pub fn ref_dec(&self, record: &Arc<ProcessRecord>, reason: &str) {
        if record.ref_dec(reason) {
            // A closed channel means the cache was purged; the record is
            // left to its remaining owners.
            let _ = self.delete_tx.send(Arc::clone(record));
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Shuts the collector down and clears the store. Idempotent and
    /// non-blocking; operations racing the shutdown are absorbed.
    pub fn purge(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// The only agent that advances colors and the only normal-path caller
/// of remove.
struct Collector {
    store: Arc<Store>,
    delete_rx: mpsc::UnboundedReceiver<Arc<ProcessRecord>>,
    stop_rx: mpsc::Receiver<()>,
    stale_interval: Option<Duration>,
}

impl Collector {
    async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + GC_INTERVAL, GC_INTERVAL);
        let mut last_sweep = Instant::now();
        let mut delete_queue: Vec<Arc<ProcessRecord>> = Vec::new();
        let mut new_queue: Vec<Arc<ProcessRecord>> = Vec::new();
        loop {
            tokio::select! {
                // Also fires when every cache handle has been dropped.
                _ = self.stop_rx.recv() => {
                    self.store.purge();
                    return;
                }
                _ = ticker.tick() => {
                    new_queue.clear();
                    for record in delete_queue.drain(..) {
                        // A non-zero count means the record bounced back
                        // to life after its drop-to-zero was queued: a
                        // close/connect pair received out of order behind
                        // an execve can legitimately take a reference
                        // again. Drop it from the queue; the next
                        // drop-to-zero arrives over the channel and is
                        // handled normally. If the count hits zero right
                        // before this tick and the channel receive lands
                        // after it, the record skips a color band;
                        // removal is idempotent, so the extra delete
                        // attempt that follows is harmless.
                        if record.refcnt() != 0 {
                            continue;
                        }
                        if record.color() == Color::DeleteReady {
                            record.set_color(Color::Deleted);
                            self.store.remove(record.exec_id());
                        } else {
                            record.set_color(Color::DeleteReady);
                            new_queue.push(record);
                        }
                    }
                    std::mem::swap(&mut delete_queue, &mut new_queue);
                    if let Some(interval) = self.stale_interval {
                        if last_sweep.elapsed() >= interval {
                            self.clean_stale_entries();
                            last_sweep = Instant::now();
                        }
                    }
                }
                Some(record) = self.delete_rx.recv() => {
                    // Duplicate drop-to-zero signals happen. Reset the
                    // color to pending and move along without queueing
                    // the record twice: it gets at least one more full
                    // tick of life. Color is only ever touched from this
                    // task, behind the select.
                    if record.color() != Color::InUse {
                        record.set_color(Color::DeletePending);
                        continue;
                    }
                    record.set_color(Color::DeletePending);
                    delete_queue.push(record);
                }
            }
        }
    }

    /// Removes records whose process tree exited at least
    /// [`STALE_MAX_AGE`] ago, bypassing the color machine. This is the
    /// insurance against reference leaks: the exit predicate is derived
    /// from the per-reason ledger, not from the live count.
    fn clean_stale_entries(&self) {
        let stale: Vec<_> = self
            .store
            .values()
            .into_iter()
            .filter(|record| record.is_stale(STALE_MAX_AGE))
            .collect();
        for record in stale {
            log::debug!("removing stale process {}", record.exec_id());
            counter_inc(REMOVED_STALE);
            self.store.remove(record.exec_id());
        }
    }
}
