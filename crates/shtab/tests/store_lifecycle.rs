//! Store init, attach, and phase-unwound teardown.

mod common;

use shtab::{Config, Status, Store, TValue};

#[test]
fn init_populate_destroy() {
    let store = common::small_store();
    let root = store.root().unwrap();

    let mut child = store.new_table().unwrap();
    store
        .add(&child, &TValue::from_str("k").unwrap(), &TValue::from_i64(9))
        .unwrap();
    store
        .add(&root, &TValue::from_str("c").unwrap(), &child)
        .unwrap();
    store.free_value(&mut child).unwrap();

    // Teardown unwinds every phase even with live content and pins.
    store.destroy().unwrap();
}

#[test]
fn config_bounds_are_enforced() {
    let config = Config {
        region_count: 0,
        ..Default::default()
    };
    assert!(matches!(
        Store::init(config),
        Err(Status::ArgInvalid(_))
    ));
}

#[test]
fn worker_init_twice_in_same_process_is_rejected() {
    let store = common::small_store();
    // init() already attached this process.
    assert_eq!(store.worker_init(), Err(Status::InitTwice));
    store.destroy().unwrap();
}

#[test]
fn attach_rejects_foreign_segments() {
    let file = tempfile::tempfile().unwrap();
    file.set_len(page_size::get() as u64 * 16).unwrap();
    assert!(Store::attach(file).is_err());
}

#[test]
fn attach_by_fd_sees_the_same_tables() -> anyhow::Result<()> {
    let store = common::small_store();
    let root = store.root()?;
    store.add(&root, &TValue::from_str("shared")?, &TValue::from_i64(5))?;

    let dup = store.shm_file().try_clone()?;
    let view = Store::attach(dup)?;

    // Same pid is still attached through the first handle.
    assert_eq!(view.worker_init(), Err(Status::Existed));

    // Reads work through table handles resolved in the second mapping.
    assert_eq!(view.table_count(), store.table_count());

    drop(view);
    store.destroy()?;
    Ok(())
}

#[test]
fn allocator_observability_surfaces() {
    let store = common::small_store();
    let root = store.root().unwrap();
    store
        .add(&root, &TValue::from_i64(1), &TValue::from_i64(2))
        .unwrap();

    // At least the tables and the entry live in slab classes.
    let small = store.slab_stats(8).unwrap();
    assert!(small.alloc_total >= 0);
    assert!(store.table_count() >= 2);
    assert!(store.free_page_runs().is_ok());
    assert!(store.gc_diagnostics().unwrap().contains_key("round"));

    store.destroy().unwrap();
}
