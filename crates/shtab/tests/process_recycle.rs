//! Crash recovery across real processes: forked workers attach, die
//! without cleanup, and the surviving peer recycles their roots through
//! the alive-mutex protocol.
//!
//! A single test function owns this binary so the forks never race
//! another test thread in the same process.

mod common;

use shtab::{Store, TValue};

/// Fork a worker, run `child` inside it, and wait for a clean exit.
fn in_forked_worker(store: &Store, child: impl FnOnce() -> bool) {
    // SAFETY: the child only touches the shared store and exits.
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            let ok = store.worker_init().is_ok() && child();
            libc::_exit(if ok { 0 } else { 1 });
        }

        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
    }
}

#[test]
fn dead_worker_roots_are_recycled() {
    let store = common::small_store();

    // First worker leaves an orphaned table behind and dies holding its
    // alive mutex.
    let orphan_key = TValue::from_str("orphan").unwrap();
    let orphan_val = TValue::from_i64(1);
    in_forked_worker(&store, || {
        store
            .new_table()
            .and_then(|mut t| {
                store
                    .add(&t, &orphan_key, &orphan_val)
                    .and_then(|()| store.free_value(&mut t))
            })
            .is_ok()
    });

    let before = store.table_count();

    // The worker's record is dead: its alive mutex is acquirable, so one
    // record gets recycled and the orphaned subtree drains through the
    // collector.
    assert_eq!(store.recycle_roots(0).unwrap(), 1);
    common::drain_gc(&store);
    assert!(store.table_count() < before);
    assert_eq!(store.recycle_roots(0).unwrap(), 0);

    // Two more dead workers; a capped pass recycles exactly one.
    in_forked_worker(&store, || true);
    in_forked_worker(&store, || true);

    assert_eq!(store.recycle_roots(1).unwrap(), 1);
    assert_eq!(store.recycle_roots(0).unwrap(), 1);

    common::drain_gc(&store);
    store.destroy().unwrap();
}
