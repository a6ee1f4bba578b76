//! # shtab - Shared-Memory Hierarchical Table Store
//!
//! An in-memory, shared, concurrently-accessible hierarchical key/value
//! store with automatic garbage collection of circular references,
//! designed to be mapped across cooperating worker processes of a
//! language runtime.
//!
//! ## Overview
//!
//! Multiple processes attach to one anonymous shared-memory arena and
//! read, write, and iterate *tables*: ordered maps whose values are
//! tagged scalars or references to other tables. A cooperative tracing
//! collector reclaims unreachable tables, including cycles, in
//! time-bounded incremental steps.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Client ABI (api)                        │
//! │        new / free / add / set / get / remove / iterate   │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ tagged values, pinned references
//! ┌───────────────▼───────────────┐   ┌─────────────────────┐
//! │        Tables (table)         │◀──▶│  Collector (gc)     │
//! │  rbtree entries, per-table    │   │  mark/sweep queues,  │
//! │  robust lock, version         │   │  epoch mark words    │
//! └───────────────┬───────────────┘   └──────────┬──────────┘
//!                 │ slab objects                 │
//! ┌───────────────▼──────────────────────────────▼──────────┐
//! │   Slab classes → page runs → regions  (mem)             │
//! │   one shared PageMeta array, robust locks throughout    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use shtab::{Config, Store, TValue};
//!
//! fn main() -> shtab::Result<()> {
//!     let store = Store::init(Config::default())?;
//!
//!     let root = store.root()?;
//!     store.add(&root, &TValue::from_str("answer")?, &TValue::from_i64(42))?;
//!
//!     let got = store.get(&root, &TValue::from_str("answer")?)?;
//!     assert_eq!(got.as_i64()?, 42);
//!
//!     // Drive the collector when convenient.
//!     match store.gc_run() {
//!         Ok(()) | Err(shtab::Status::NoGcData) => {}
//!         Err(e) => return Err(e),
//!     }
//!
//!     store.destroy()
//! }
//! ```
//!
//! ## Process model
//!
//! The core creates no threads and performs no I/O; within a process it
//! is single-threaded with respect to itself, and all cross-process
//! synchronisation happens through robust, process-shared mutexes stored
//! in the arena. A process that dies holding a lock is recovered from by
//! the next acquirer; its exported references are reclaimed by
//! [`Store::recycle_roots`] through the alive-mutex protocol.
//!
//! ## Modules
//!
//! - [`api`]: tagged-value entry points and iterators
//! - [`config`]: geometry bounds and runtime knobs
//! - [`gc`]: the incremental tracing collector
//! - [`intrusive`]: offset-based list and red-black tree
//! - [`mem`]: shared segment, arena, region/page/slab allocators
//! - [`store`]: init/attach/teardown, p_roots recycling
//! - [`sync`]: robust cross-process mutex
//! - [`table`]: the ordered-map object
//! - [`types`]: tags and tagged values

pub mod api;
pub mod config;
pub mod gc;
pub mod intrusive;
pub mod mem;
pub mod store;
pub mod sync;
pub mod table;
pub mod types;
pub mod util;

pub use api::StoreIter;
pub use config::Config;
pub use mem::slab::SlabStatsSnapshot;
pub use shtab_util::status::{Result, Status};
pub use store::Store;
pub use types::{IterSide, TValue, TableId, Tag};

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a store with the default configuration.
pub fn init() -> Result<Store> {
    Store::init(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
