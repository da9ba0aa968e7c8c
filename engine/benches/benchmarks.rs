//! Performance benchmarks for kindstore-engine

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kindstore_engine::{
    Entity, Field, FilterOp, Holder, Key, Kind, KindOptions, Query, Value, ValueType,
};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;

fn create_test_kind() -> Arc<Kind> {
    Arc::new(
        Kind::dynamic(
            "User",
            vec![
                Field::string("name").required(),
                Field::string("email"),
                Field::int("age"),
                Field::list("tags", ValueType::String),
                Field::group_list("addresses", vec![Field::string("city"), Field::string("zip")]),
            ],
            KindOptions::default(),
        )
        .expect("valid kind"),
    )
}

fn sample_input(i: usize) -> Map<String, JsonValue> {
    match json!({
        "name": format!("User {i}"),
        "email": format!("user{i}@example.com"),
        "age": i % 90,
        "tags": ["a", "b", "c"],
        "addresses": [{"city": "Oslo", "zip": "0150"}, {"city": "Bergen"}],
    }) {
        JsonValue::Object(map) => map,
        _ => unreachable!(),
    }
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let kind = create_test_kind();
    let input = sample_input(1);

    group.bench_function("parse_input", |b| {
        b.iter(|| {
            let mut holder = Holder::new(kind.clone());
            holder.parse_input(black_box(&input)).unwrap();
            holder
        })
    });

    group.bench_function("save", |b| {
        let mut holder = Holder::new(kind.clone());
        holder.parse_input(&input).unwrap();
        let now = Utc::now();
        b.iter(|| holder.save(black_box(now)).unwrap())
    });

    group.bench_function("load_output", |b| {
        let mut holder = Holder::new(kind.clone());
        holder.parse_input(&input).unwrap();
        let props = holder.save(Utc::now()).unwrap();
        b.iter(|| {
            let mut loaded = Holder::new(kind.clone());
            loaded.load(black_box(&props));
            loaded.output()
        })
    });

    group.finish();
}

fn bench_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch");
    let kind = create_test_kind();
    let mut base = Holder::new(kind);
    base.parse_input(&sample_input(1)).unwrap();

    let patch = br#"[
        {"op": "replace", "path": "/name", "value": "Renamed"},
        {"op": "add", "path": "/tags/-", "value": "d"},
        {"op": "move", "from": "/addresses/1/city", "path": "/addresses/0/zip"},
        {"op": "test", "path": "/age", "value": 1}
    ]"#;

    group.bench_function("apply_four_ops", |b| {
        b.iter(|| {
            let mut holder = base.clone();
            holder.patch(black_box(patch)).unwrap();
            holder
        })
    });

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let kind = create_test_kind();

    for size in [100usize, 1000, 10000] {
        let entities: Vec<Entity> = (0..size)
            .map(|i| {
                let mut holder = Holder::new(kind.clone());
                holder.parse_input(&sample_input(i)).unwrap();
                let props = holder.save(Utc::now()).unwrap();
                Entity::new(Key::with_int_id("User", i as i64 + 1), props)
            })
            .collect();
        let query = Query::new("User")
            .filter("age", FilterOp::Ge, Value::Int(30))
            .order("name", true)
            .limit(20)
            .offset(20);

        group.bench_with_input(BenchmarkId::new("filter_sort_page", size), &entities, |b, entities| {
            b.iter(|| query.apply(black_box(entities.iter().cloned())))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_patch, bench_query);
criterion_main!(benches);
