//! Shared helpers for the integration tests.
#![allow(dead_code)]

use shtab::{Config, Status, Store};

/// A store over a small arena, collector driven explicitly by the tests.
pub fn small_store() -> Store {
    let config = Config {
        region_count: 4,
        pages_per_region: 64,
        run_gc_periodical: true,
        ..Default::default()
    };
    Store::init(config).expect("store init")
}

/// Drive the collector until it reports no work, returning the number of
/// `gc_run` calls it took.
pub fn drain_gc(store: &Store) -> usize {
    let mut calls = 0;
    loop {
        calls += 1;
        match store.gc_run() {
            Ok(()) => {}
            Err(Status::NoGcData) => return calls,
            Err(e) => panic!("gc_run failed: {e}"),
        }
        assert!(calls < 10_000, "collector failed to converge");
    }
}

/// Read one numeric field out of the collector diagnostics.
pub fn gc_stat(store: &Store, name: &str) -> u64 {
    store
        .gc_diagnostics()
        .expect("gc diagnostics")
        .get(name)
        .unwrap_or_else(|| panic!("missing diagnostic {name}"))
        .parse()
        .expect("numeric diagnostic")
}
