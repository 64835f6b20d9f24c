use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use nix::unistd::Pid;

/// Reason tag for the reference the process holds on its own record.
pub const REF_PROCESS_INC: &str = "process++";
/// Reason tag for dropping the process's own reference (exit event).
pub const REF_PROCESS_DEC: &str = "process--";
/// Reason tag for a reference held on behalf of a child process.
pub const REF_PARENT_INC: &str = "parent++";
/// Reason tag for dropping a child's reference on its parent.
pub const REF_PARENT_DEC: &str = "parent--";

/// Position of a record in the deferred reclamation state machine.
///
/// Only the collector task ever changes a record's color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    InUse = 0,
    DeletePending = 1,
    DeleteReady = 2,
    Deleted = 3,
}

impl Color {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Color::InUse,
            1 => Color::DeletePending,
            2 => Color::DeleteReady,
            _ => Color::Deleted,
        }
    }
}

/// Domain payload of a cached record. The cache only reads `exec_id`;
/// everything else is carried for the event consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    /// Unique identifier of one process incarnation. Distinct across
    /// re-exec of the same PID.
    pub exec_id: String,
    pub pid: Pid,
    pub ppid: Pid,
    pub image: String,
}

/// Per-reason operation ledger and the exit timestamp it determines.
/// Both live behind the same lock: the exit predicate is evaluated from
/// the counters in the same critical section that updates them.
#[derive(Debug, Default)]
struct RefOps {
    ops: HashMap<String, u64>,
    exit_time: Option<Instant>,
}

impl RefOps {
    fn op(&self, reason: &str) -> u64 {
        self.ops.get(reason).copied().unwrap_or(0)
    }

    /// The process and every tracked descendant have exited: each
    /// lifetime reference taken for the process itself or for a child
    /// has been matched by its drop.
    fn tree_exited(&self) -> bool {
        self.op(REF_PROCESS_INC) == self.op(REF_PROCESS_DEC)
            && self.op(REF_PARENT_INC) == self.op(REF_PARENT_DEC)
    }
}

fn is_exit_reason(reason: &str) -> bool {
    reason == REF_PROCESS_DEC || reason == REF_PARENT_DEC
}

/// A cached process with the bookkeeping the collector needs to decide
/// when it may be reclaimed.
#[derive(Debug)]
pub struct ProcessRecord {
    process: Process,
    /// Live references held by in-flight events. Guards the record from
    /// reclamation; not a memory-safety device (the `Arc` is).
    refcnt: AtomicU32,
    ref_ops: Mutex<RefOps>,
    /// Written only from the collector task, relaxed loads elsewhere are
    /// for diagnostics.
    color: AtomicU8,
}

impl ProcessRecord {
    /// Creates a record with the process's own lifetime reference
    /// already taken: `refcnt` starts at 1 and the ledger records one
    /// `process++`, so the exit predicate accounts for it.
    pub fn new(process: Process) -> Self {
        let mut ops = HashMap::new();
        ops.insert(REF_PROCESS_INC.to_owned(), 1);
        Self {
            process,
            refcnt: AtomicU32::new(1),
            ref_ops: Mutex::new(RefOps {
                ops,
                exit_time: None,
            }),
            color: AtomicU8::new(Color::InUse as u8),
        }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn exec_id(&self) -> &str {
        &self.process.exec_id
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Number of times `refcnt` was adjusted for `reason`.
    pub fn ref_op_count(&self, reason: &str) -> u64 {
        self.ref_ops.lock().op(reason)
    }

    pub fn color(&self) -> Color {
        Color::from_raw(self.color.load(Ordering::Relaxed))
    }

    pub(crate) fn set_color(&self, color: Color) {
        self.color.store(color as u8, Ordering::Relaxed);
    }

    pub(crate) fn ref_inc(&self, reason: &str) {
        *self.ref_ops.lock().ops.entry(reason.to_owned()).or_default() += 1;
        self.refcnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when this decrement dropped the count to zero.
    pub(crate) fn ref_dec(&self, reason: &str) -> bool {
        {
            let mut ref_ops = self.ref_ops.lock();
            *ref_ops.ops.entry(reason.to_owned()).or_default() += 1;
            // On a process or child exit, check whether the whole tree is
            // gone and stamp the moment it happened. The sweep ages the
            // record from this timestamp.
            if is_exit_reason(reason) && ref_ops.tree_exited() {
                ref_ops.exit_time = Some(Instant::now());
            }
        }
        self.refcnt.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn exit_time(&self) -> Option<Instant> {
        self.ref_ops.lock().exit_time
    }

    /// True when the process tree has exited and did so at least
    /// `max_age` ago. Used by the sweep; does not consult `refcnt`, so a
    /// leaked reference cannot keep a dead tree cached forever.
    pub(crate) fn is_stale(&self, max_age: Duration) -> bool {
        let ref_ops = self.ref_ops.lock();
        ref_ops.tree_exited()
            && ref_ops
                .exit_time
                .is_some_and(|exit_time| exit_time.elapsed() >= max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(exec_id: &str) -> ProcessRecord {
        ProcessRecord::new(Process {
            exec_id: exec_id.to_owned(),
            pid: Pid::from_raw(1000),
            ppid: Pid::from_raw(1),
            image: "/usr/bin/true".to_owned(),
        })
    }

    #[test]
    fn starts_with_own_reference() {
        let r = record("a");
        assert_eq!(r.refcnt(), 1);
        assert_eq!(r.ref_op_count(REF_PROCESS_INC), 1);
        assert_eq!(r.color(), Color::InUse);
        assert!(r.exit_time().is_none());
    }

    #[test]
    fn ledger_tracks_reasons_independently() {
        let r = record("a");
        r.ref_inc(REF_PARENT_INC);
        r.ref_inc("socket++");
        r.ref_dec("socket--");
        assert_eq!(r.refcnt(), 2);
        assert_eq!(r.ref_op_count(REF_PARENT_INC), 1);
        assert_eq!(r.ref_op_count("socket++"), 1);
        assert_eq!(r.ref_op_count("socket--"), 1);
        assert_eq!(r.ref_op_count(REF_PARENT_DEC), 0);
    }

    #[test]
    fn exit_time_set_when_tree_exits() {
        let r = record("a");
        r.ref_inc(REF_PARENT_INC);
        // Child still referenced: process exit alone is not enough.
        assert!(!r.ref_dec(REF_PROCESS_DEC));
        assert!(r.exit_time().is_none());
        assert!(r.ref_dec(REF_PARENT_DEC));
        assert!(r.exit_time().is_some());
    }

    #[test]
    fn non_exit_reasons_never_stamp_exit_time() {
        let r = record("a");
        r.ref_inc("socket++");
        r.ref_dec("socket--");
        assert!(r.exit_time().is_none());
    }

    #[test]
    fn stale_needs_exit_time_and_age() {
        let r = record("a");
        assert!(!r.is_stale(Duration::ZERO));
        assert!(r.ref_dec(REF_PROCESS_DEC));
        assert!(r.is_stale(Duration::ZERO));
        assert!(!r.is_stale(Duration::from_secs(600)));
    }
}
