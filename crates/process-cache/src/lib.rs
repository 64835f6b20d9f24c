//! Bounded cache of process records for kernel event consumers.
//!
//! Lifecycle events (fork/exec/exit) insert records and auxiliary events
//! (connect, close, ...) take references on them for as long as they are
//! in flight. Reclamation is deferred: a record whose reference count
//! drops to zero is walked through a color state machine by a dedicated
//! collector task over two 30 second ticks, so events delivered out of
//! order can still resurrect it, and a configurable stale sweep evicts
//! records whose process tree has exited even when a leaked reference
//! keeps the count positive.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//!
//! use process_cache::{Cache, CacheConfig, Pid, Process, ProcessRecord};
//!
//! let cache = Cache::new(CacheConfig::default()).unwrap();
//! let record = Arc::new(ProcessRecord::new(Process {
//!     exec_id: "42:0xcafe".into(),
//!     pid: Pid::from_raw(42),
//!     ppid: Pid::from_raw(1),
//!     image: "/bin/sh".into(),
//! }));
//! cache.add(Arc::clone(&record));
//! cache.ref_inc(&record, "socket++");
//! cache.ref_dec(&record, "socket--");
//! assert!(cache.get("42:0xcafe").is_ok());
//! cache.purge();
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod metrics;
pub mod record;
mod store;

pub use cache::{Cache, CacheError};
pub use config::{CacheConfig, ConfigError, ModuleConfig};
pub use record::{Color, Process, ProcessRecord};

pub use nix::unistd::Pid;
