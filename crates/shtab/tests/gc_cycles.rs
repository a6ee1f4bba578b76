//! Collector behaviour: cycle reclamation, idempotent pushes, round
//! accounting.

mod common;

use shtab::{Status, TValue};

#[test]
fn empty_collector_reports_no_data() {
    let store = common::small_store();
    assert_eq!(store.gc_run(), Err(Status::NoGcData));
    store.destroy().unwrap();
}

#[test]
fn cycle_of_two_tables_is_reclaimed() {
    let store = common::small_store();

    let mut a = store.new_table().unwrap();
    let mut b = store.new_table().unwrap();
    let c = store.new_table().unwrap();

    // a <-> b form a cycle; c stays externally referenced.
    store.add(&a, &TValue::from_str("b").unwrap(), &b).unwrap();
    store.add(&b, &TValue::from_str("a").unwrap(), &a).unwrap();
    store
        .add(&c, &TValue::from_str("tag").unwrap(), &TValue::from_i64(7))
        .unwrap();

    let before = store.table_count();

    // Drop the external references to the cycle.
    store.free_value(&mut a).unwrap();
    store.free_value(&mut b).unwrap();

    common::drain_gc(&store);

    assert_eq!(store.table_count(), before - 2);

    // c is untouched.
    let tag = store.get(&c, &TValue::from_str("tag").unwrap()).unwrap();
    assert_eq!(tag.as_i64().unwrap(), 7);

    store.destroy().unwrap();
}

#[test]
fn self_referencing_table_is_reclaimed() {
    let store = common::small_store();

    let mut t = store.new_table().unwrap();
    store.add(&t, &TValue::from_str("me").unwrap(), &t).unwrap();

    let before = store.table_count();
    store.free_value(&mut t).unwrap();
    common::drain_gc(&store);

    assert_eq!(store.table_count(), before - 1);
    store.destroy().unwrap();
}

#[test]
fn reachable_tables_survive_collection() {
    let store = common::small_store();
    let root = store.root().unwrap();

    let mut child = store.new_table().unwrap();
    store
        .add(&child, &TValue::from_str("k").unwrap(), &TValue::from_i64(1))
        .unwrap();
    store
        .add(&root, &TValue::from_str("child").unwrap(), &child)
        .unwrap();

    let before = store.table_count();

    // The pin goes away, but the g_root edge keeps the child alive.
    store.free_value(&mut child).unwrap();
    common::drain_gc(&store);

    assert_eq!(store.table_count(), before);

    let mut fetched = store
        .get(&root, &TValue::from_str("child").unwrap())
        .unwrap();
    let v = store.get(&fetched, &TValue::from_str("k").unwrap()).unwrap();
    assert_eq!(v.as_i64().unwrap(), 1);
    store.free_value(&mut fetched).unwrap();

    store.destroy().unwrap();
}

#[test]
fn removing_last_edge_frees_subtree() {
    let store = common::small_store();
    let root = store.root().unwrap();

    let mut child = store.new_table().unwrap();
    let mut grandchild = store.new_table().unwrap();
    store
        .add(&child, &TValue::from_str("g").unwrap(), &grandchild)
        .unwrap();
    store
        .add(&root, &TValue::from_str("c").unwrap(), &child)
        .unwrap();
    store.free_value(&mut child).unwrap();
    store.free_value(&mut grandchild).unwrap();
    common::drain_gc(&store);

    let before = store.table_count();
    store.remove_key(&root, &TValue::from_str("c").unwrap()).unwrap();
    common::drain_gc(&store);

    assert_eq!(store.table_count(), before - 2);
    store.destroy().unwrap();
}

#[test]
fn push_to_mark_is_idempotent() {
    let store = common::small_store();
    let root = store.root().unwrap();

    let mut child = store.new_table().unwrap();
    // The pin already queued the child for marking; further inserts of
    // the same table must not queue it again.
    let after_pin = common::gc_stat(&store, "mark_queue");
    store.add(&root, &TValue::from_i64(1), &child).unwrap();
    store.add(&root, &TValue::from_i64(2), &child).unwrap();
    assert_eq!(common::gc_stat(&store, "mark_queue"), after_pin);

    store.free_value(&mut child).unwrap();
    store.destroy().unwrap();
}

#[test]
fn round_advances_by_four_per_cycle() {
    let store = common::small_store();

    let mut t = store.new_table().unwrap();
    store.free_value(&mut t).unwrap();

    let mut rounds = vec![common::gc_stat(&store, "round")];
    loop {
        match store.gc_run() {
            Ok(()) => {
                let r = common::gc_stat(&store, "round");
                if r != *rounds.last().unwrap() {
                    rounds.push(r);
                }
            }
            Err(Status::NoGcData) => break,
            Err(e) => panic!("gc_run failed: {e}"),
        }
    }

    assert!(rounds.len() > 1, "no cycle completed");
    for pair in rounds.windows(2) {
        assert_eq!(pair[1] - pair[0], 4);
    }

    store.destroy().unwrap();
}

#[test]
fn incremental_steps_bound_work() {
    let store = common::small_store();
    let root = store.root().unwrap();

    // A chain of tables hung off the root, then cut loose.
    let mut parent = store.root().unwrap();
    for i in 0..300i64 {
        let child = store.new_table().unwrap();
        store.add(&parent, &TValue::from_i64(i), &child).unwrap();
        if parent.bytes() != root.bytes() {
            let mut old = parent;
            store.free_value(&mut old).unwrap();
        }
        parent = child;
    }
    let mut tail = parent;
    store.free_value(&mut tail).unwrap();

    let baseline = store.table_count() - 300;
    store.remove_key(&root, &TValue::from_i64(0)).unwrap();

    let calls = common::drain_gc(&store);
    assert!(calls > 2, "collection completed in one step");
    assert_eq!(store.table_count(), baseline);

    store.destroy().unwrap();
}
