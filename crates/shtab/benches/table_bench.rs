//! Table mutation and collection benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shtab::{Config, Status, Store, TValue};

fn bench_store() -> Store {
    let config = Config {
        region_count: 16,
        pages_per_region: 128,
        run_gc_periodical: true,
        ..Default::default()
    };
    Store::init(config).expect("store init")
}

fn drain(store: &Store) {
    loop {
        match store.gc_run() {
            Ok(()) => {}
            Err(Status::NoGcData) => break,
            Err(e) => panic!("gc_run: {e}"),
        }
    }
}

fn bench_add_get_remove(c: &mut Criterion) {
    let store = bench_store();
    let root = store.root().expect("root");
    let value = TValue::from_i64(42);

    let mut i = 0i64;
    c.bench_function("add_get_remove", |b| {
        b.iter(|| {
            let key = TValue::from_i64(i);
            i = i.wrapping_add(1);
            store.add(&root, &key, &value).expect("add");
            let got = store.get(&root, &key).expect("get");
            black_box(got.as_i64().expect("i64"));
            store.remove_key(&root, &key).expect("remove");
        })
    });
}

fn bench_get_hit(c: &mut Criterion) {
    let store = bench_store();
    let root = store.root().expect("root");
    for i in 0..1024i64 {
        store
            .add(&root, &TValue::from_i64(i), &TValue::from_i64(i))
            .expect("add");
    }

    let mut i = 0i64;
    c.bench_function("get_hit_1024", |b| {
        b.iter(|| {
            let key = TValue::from_i64(i & 1023);
            i = i.wrapping_add(1);
            black_box(store.get(&root, &key).expect("get"));
        })
    });
}

fn bench_collect_churn(c: &mut Criterion) {
    let store = bench_store();

    c.bench_function("collect_64_tables", |b| {
        b.iter(|| {
            for _ in 0..64 {
                let mut t = store.new_table().expect("new");
                store.free_value(&mut t).expect("free");
            }
            drain(&store);
        })
    });
}

criterion_group!(
    benches,
    bench_add_get_remove,
    bench_get_hit,
    bench_collect_churn
);
criterion_main!(benches);
