use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use filament_core::{run_until_idle, ReactiveError, Scope, Value, WatcherOptions};

fn bench_tracked_read(c: &mut Criterion) {
    let scope = Scope::new(Value::from_json(json!({ "a": 1 })));
    let counted = scope
        .computed(|root| {
            let map = root
                .as_map()
                .ok_or_else(|| ReactiveError::eval("root is not a map"))?;
            Ok(map.get("a"))
        })
        .unwrap();

    c.bench_function("computed_cached_read", |b| {
        b.iter(|| black_box(counted.value()))
    });
}

fn bench_write_and_flush(c: &mut Criterion) {
    let scope = Scope::new(Value::from_json(json!({ "a": 0 })));
    for _ in 0..10 {
        scope
            .watch("a", |_, _| Ok(()), WatcherOptions::default())
            .unwrap();
    }
    let root = scope.data();
    let map = root.as_map().unwrap().clone();

    let mut n = 0i64;
    c.bench_function("write_flush_10_watchers", |b| {
        b.iter(|| {
            n += 1;
            map.set("a", Value::Int(n)).unwrap();
            run_until_idle();
        })
    });
}

fn bench_retracking(c: &mut Criterion) {
    // Every re-run rebuilds the dependency set over 32 keys.
    let mut seed = serde_json::Map::new();
    for i in 0..32 {
        seed.insert(format!("k{i}"), json!(i));
    }
    let scope = Scope::new(Value::from_json(serde_json::Value::Object(seed)));
    scope
        .watch_fn(
            |root| {
                let map = root
                    .as_map()
                    .ok_or_else(|| ReactiveError::eval("root is not a map"))?;
                let mut sum = 0;
                for key in map.keys() {
                    sum += map.get(&key).as_i64().unwrap_or(0);
                }
                Ok(Value::Int(sum))
            },
            |_, _| Ok(()),
            WatcherOptions::default(),
        )
        .unwrap();
    let root = scope.data();
    let map = root.as_map().unwrap().clone();

    let mut n = 0i64;
    c.bench_function("flush_retracks_32_deps", |b| {
        b.iter(|| {
            n += 1;
            map.set("k0", Value::Int(n)).unwrap();
            run_until_idle();
        })
    });
}

criterion_group!(
    benches,
    bench_tracked_read,
    bench_write_and_flush,
    bench_retracking
);
criterion_main!(benches);
