//! Table mutation, lookup, and iteration through the client ABI.

mod common;

use shtab::{IterSide, Status, TValue};

#[test]
fn add_then_get_returns_byte_equal_value() {
    let store = common::small_store();
    let root = store.root().unwrap();

    let key = TValue::from_str("greeting").unwrap();
    let value = TValue::from_str("hello").unwrap();
    store.add(&root, &key, &value).unwrap();

    let got = store.get(&root, &key).unwrap();
    assert_eq!(got.bytes(), b"hello\0");
    assert_eq!(got.as_str().unwrap(), "hello");

    store.destroy().unwrap();
}

#[test]
fn duplicate_add_is_existed_and_set_upserts() {
    let store = common::small_store();
    let root = store.root().unwrap();
    let key = TValue::from_i64(1);

    store.add(&root, &key, &TValue::from_i64(10)).unwrap();
    assert_eq!(
        store.add(&root, &key, &TValue::from_i64(11)),
        Err(Status::Existed)
    );

    store.set(&root, &key, &TValue::from_i64(12)).unwrap();
    assert_eq!(store.get(&root, &key).unwrap().as_i64().unwrap(), 12);

    store.destroy().unwrap();
}

#[test]
fn remove_missing_key_is_not_found() {
    let store = common::small_store();
    let root = store.root().unwrap();

    assert_eq!(
        store.remove_key(&root, &TValue::from_i64(404)),
        Err(Status::NotFound)
    );

    store.destroy().unwrap();
}

#[test]
fn remove_if_value_checks_payload() {
    let store = common::small_store();
    let root = store.root().unwrap();
    let key = TValue::from_str("pid").unwrap();

    store.add(&root, &key, &TValue::from_u64(42)).unwrap();

    assert_eq!(
        store.remove_key_if_value(&root, &key, &TValue::from_u64(7)),
        Err(Status::NotEqual)
    );
    assert_eq!(store.get(&root, &key).unwrap().as_u64().unwrap(), 42);

    store
        .remove_key_if_value(&root, &key, &TValue::from_u64(42))
        .unwrap();
    assert_eq!(store.get(&root, &key), Err(Status::NotFound));

    store.destroy().unwrap();
}

#[test]
fn add_remove_leaves_table_as_before() {
    let store = common::small_store();
    let root = store.root().unwrap();

    for i in 0..10 {
        store
            .add(&root, &TValue::from_i64(i), &TValue::from_i64(i))
            .unwrap();
    }

    let key = TValue::from_i64(99);
    store.add(&root, &key, &TValue::from_bool(true)).unwrap();
    store.remove_key(&root, &key).unwrap();

    let mut seen = 0;
    store
        .foreach(&root, None, IterSide::LeftEq, |_, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, 10);

    store.destroy().unwrap();
}

#[test]
fn iteration_from_key_ascends_in_order() {
    let store = common::small_store();
    let root = store.root().unwrap();

    for i in 0..100i64 {
        store
            .add(&root, &TValue::from_i64(i), &TValue::from_i64(i))
            .unwrap();
    }

    let init = TValue::from_i64(5);
    let mut iter = store
        .iter_init(&root, Some(&init), IterSide::LeftEq)
        .unwrap();

    let mut expected = 5i64;
    loop {
        match store.next(&mut iter) {
            Ok((k, v)) => {
                assert_eq!(k.as_i64().unwrap(), expected);
                assert_eq!(v.as_i64().unwrap(), expected);
                expected += 1;
            }
            Err(Status::NotFound) => break,
            Err(e) => panic!("unexpected: {e}"),
        }
    }
    assert_eq!(expected, 100);

    store.free_iter(iter).unwrap();
    store.destroy().unwrap();
}

#[test]
fn structural_change_invalidates_iterator() {
    let store = common::small_store();
    let root = store.root().unwrap();

    for i in 0..100i64 {
        store
            .add(&root, &TValue::from_i64(i), &TValue::from_i64(i))
            .unwrap();
    }

    let init = TValue::from_i64(5);
    let mut iter = store
        .iter_init(&root, Some(&init), IterSide::LeftEq)
        .unwrap();
    let (k, _) = store.next(&mut iter).unwrap();
    assert_eq!(k.as_i64().unwrap(), 5);

    store.remove_key(&root, &TValue::from_i64(50)).unwrap();
    assert_eq!(store.next(&mut iter), Err(Status::TableModified));

    store.free_iter(iter).unwrap();
    store.destroy().unwrap();
}

#[test]
fn iter_side_selection() {
    let store = common::small_store();
    let root = store.root().unwrap();

    for i in [10i64, 20, 30] {
        store
            .add(&root, &TValue::from_i64(i), &TValue::from_i64(i))
            .unwrap();
    }

    // Eq misses.
    let probe = TValue::from_i64(15);
    assert_eq!(
        store
            .iter_init(&root, Some(&probe), IterSide::Eq)
            .map(|_| ()),
        Err(Status::NotFound)
    );

    // LeftEq falls back to the greatest key <= probe.
    let mut iter = store
        .iter_init(&root, Some(&probe), IterSide::LeftEq)
        .unwrap();
    let (k, _) = store.next(&mut iter).unwrap();
    assert_eq!(k.as_i64().unwrap(), 10);
    store.free_iter(iter).unwrap();

    // RightEq to the smallest key >= probe.
    let mut iter = store
        .iter_init(&root, Some(&probe), IterSide::RightEq)
        .unwrap();
    let (k, _) = store.next(&mut iter).unwrap();
    assert_eq!(k.as_i64().unwrap(), 20);
    store.free_iter(iter).unwrap();

    store.destroy().unwrap();
}

#[test]
fn foreach_stops_on_iter_stop() {
    let store = common::small_store();
    let root = store.root().unwrap();

    for i in 0..10i64 {
        store
            .add(&root, &TValue::from_i64(i), &TValue::from_i64(i))
            .unwrap();
    }

    let mut seen = Vec::new();
    store
        .foreach(&root, None, IterSide::LeftEq, |k, _| {
            seen.push(k.as_i64().unwrap());
            if seen.len() == 3 {
                Err(Status::IterStop)
            } else {
                Ok(())
            }
        })
        .unwrap();
    assert_eq!(seen, vec![0, 1, 2]);

    store.destroy().unwrap();
}

#[test]
fn nested_tables_roundtrip() {
    let store = common::small_store();
    let root = store.root().unwrap();

    let mut child = store.new_table().unwrap();
    store
        .add(&child, &TValue::from_str("x").unwrap(), &TValue::from_f64(2.5))
        .unwrap();
    store
        .add(&root, &TValue::from_str("child").unwrap(), &child)
        .unwrap();
    store.free_value(&mut child).unwrap();

    let mut fetched = store
        .get(&root, &TValue::from_str("child").unwrap())
        .unwrap();
    let x = store
        .get(&fetched, &TValue::from_str("x").unwrap())
        .unwrap();
    assert_eq!(x.as_f64().unwrap(), 2.5);

    store.free_value(&mut fetched).unwrap();
    store.destroy().unwrap();
}
