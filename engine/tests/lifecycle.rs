//! End-to-end tests for kindstore-engine
//!
//! These tests drive the engine through the in-memory datastore the way an
//! API layer would.

use kindstore_engine::{
    CounterConfig, Datastore, Engine, EngineConfig, Entity, Error, Field, Holder, Key, KeyId,
    KindOptions, MemoryCache, MemoryDatastore, MemoryTransaction, NoCache, Query, QueryParams,
    Record, Registry, RetryPolicy, ShardedCounter, ValueType,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Item {
    name: String,
    tags: Vec<String>,
}

impl Record for Item {
    fn fields() -> Vec<Field> {
        vec![
            Field::string("name").required().json_name("Name"),
            Field::list("tags", ValueType::String).json_name("Tags"),
        ]
    }
}

fn engine_with(registry: Registry, config: EngineConfig) -> Engine<MemoryDatastore, MemoryCache> {
    Engine::new(
        Arc::new(MemoryDatastore::new()),
        Arc::new(MemoryCache::new()),
        Arc::new(registry),
        config,
    )
}

fn people() -> (Registry, Arc<kindstore_engine::Kind>) {
    let registry = Registry::new();
    let kind = registry
        .register_dynamic(
            "Person",
            vec![
                Field::string("name"),
                Field::int("age"),
                Field::group("address", vec![Field::string("city")]),
            ],
            KindOptions::default(),
        )
        .unwrap();
    (registry, kind)
}

async fn add_person<D: Datastore, C: kindstore_engine::Cache>(
    engine: &Engine<D, C>,
    parent: Option<&Key>,
    name: &str,
    age: i64,
    city: &str,
) -> Key {
    let mut holder = engine.holder_by_name("Person").unwrap();
    if let Some(parent) = parent {
        holder = holder.with_parent(parent.clone());
    }
    let input = json!({"name": name, "age": age, "address": {"city": city}});
    holder.parse_input(input.as_object().unwrap()).unwrap();
    engine.add(&mut holder).await.unwrap()
}

// ============================================================================
// CRUD
// ============================================================================

#[tokio::test]
async fn add_get_update_scenario() {
    let registry = Registry::new();
    registry.register::<Item>(KindOptions::default()).unwrap();
    let engine = engine_with(registry, EngineConfig::default());

    let mut holder = engine.holder::<Item>().unwrap();
    holder
        .set_value(&Item {
            name: "a".into(),
            tags: vec!["x".into(), "y".into()],
        })
        .unwrap();
    let key = engine.add(&mut holder).await.unwrap();
    assert!(key.is_complete());

    let mut loaded = engine.holder::<Item>().unwrap();
    engine.get(&mut loaded, &key).await.unwrap();
    let output = loaded.output();
    assert_eq!(output["id"], json!(key.encode()));
    assert_eq!(output["Name"], json!("a"));
    assert_eq!(output["Tags"], json!(["x", "y"]));

    let mut edit = engine.holder::<Item>().unwrap();
    edit.parse_input_bytes(br#"{"Tags": ["z"]}"#).unwrap();
    engine.update(&mut edit, &key).await.unwrap();

    let mut after = engine.holder::<Item>().unwrap();
    engine.get(&mut after, &key).await.unwrap();
    assert_eq!(
        after.value::<Item>().unwrap(),
        Item {
            name: "a".into(),
            tags: vec!["z".into()],
        }
    );
    assert!(after.meta().updated_at >= after.meta().created_at);
}

#[tokio::test]
async fn named_add_twice_creates_one_entity() {
    let registry = Registry::new();
    registry.register::<Item>(KindOptions::default()).unwrap();
    let engine = engine_with(registry, EngineConfig::default());

    for attempt in 0..2 {
        let mut holder = engine.holder::<Item>().unwrap();
        holder.assign_name("only").unwrap();
        holder
            .set_value(&Item {
                name: format!("try-{attempt}"),
                ..Item::default()
            })
            .unwrap();
        let result = engine.add(&mut holder).await;
        if attempt == 0 {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(Error::AlreadyExists(_))));
        }
    }
    assert_eq!(engine.datastore().len(), 1);

    let mut loaded = engine.holder::<Item>().unwrap();
    engine
        .get(&mut loaded, &Key::named("Item", "only"))
        .await
        .unwrap();
    assert_eq!(loaded.value::<Item>().unwrap().name, "try-0");
}

#[tokio::test]
async fn add_without_required_field_fails() {
    let registry = Registry::new();
    registry.register::<Item>(KindOptions::default()).unwrap();
    let engine = engine_with(registry, EngineConfig::default());

    let mut holder = engine.holder::<Item>().unwrap();
    holder.parse_input_bytes(br#"{"Tags": ["x"]}"#).unwrap();
    assert!(matches!(
        engine.add(&mut holder).await,
        Err(Error::FieldRequired(name)) if name == "name"
    ));
    assert!(engine.datastore().is_empty());
}

#[tokio::test]
async fn patch_replace_then_move() {
    let registry = Registry::new();
    let kind = registry
        .register_dynamic(
            "Post",
            vec![Field::string("title"), Field::string("subtitle"), Field::int("views")],
            KindOptions::default(),
        )
        .unwrap();
    let engine = engine_with(registry, EngineConfig::default());

    let mut holder = Holder::new(kind.clone());
    holder
        .parse_input_bytes(br#"{"title": "old", "views": 3}"#)
        .unwrap();
    let key = engine.add(&mut holder).await.unwrap();

    let mut edit = Holder::new(kind.clone());
    engine
        .patch(
            &mut edit,
            &key,
            br#"[{"op": "replace", "path": "/title", "value": "new"}]"#,
        )
        .await
        .unwrap();
    let mut edit = Holder::new(kind.clone());
    engine
        .patch(
            &mut edit,
            &key,
            br#"[{"op": "move", "from": "/title", "path": "/subtitle"}]"#,
        )
        .await
        .unwrap();

    let mut loaded = Holder::new(kind);
    engine.get(&mut loaded, &key).await.unwrap();
    assert_eq!(loaded.get("title"), Some(&json!("")));
    assert_eq!(loaded.get("subtitle"), Some(&json!("new")));
    assert_eq!(loaded.get("views"), Some(&json!(3)));
}

#[tokio::test]
async fn failed_patch_writes_nothing() {
    let (registry, kind) = people();
    let engine = engine_with(registry, EngineConfig::default());
    let key = add_person(&engine, None, "Ann", 30, "Oslo").await;

    let mut edit = Holder::new(kind.clone());
    let result = engine
        .patch(
            &mut edit,
            &key,
            br#"[{"op": "replace", "path": "/name", "value": "Bo"},
                 {"op": "test", "path": "/age", "value": 99}]"#,
        )
        .await;
    assert!(matches!(result, Err(Error::TestFailed(_))));

    let mut loaded = Holder::new(kind);
    engine.get(&mut loaded, &key).await.unwrap();
    assert_eq!(loaded.get("name"), Some(&json!("Ann")));
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let (registry, kind) = people();
    let engine = engine_with(registry, EngineConfig::default());
    let key = add_person(&engine, None, "Ann", 30, "Oslo").await;

    engine.delete(&kind, &key).await.unwrap();
    let mut holder = Holder::new(kind.clone());
    assert!(matches!(
        engine.get(&mut holder, &key).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.delete(&kind, &Key::incomplete("Person")).await,
        Err(Error::IncompleteKey(_))
    ));
}

#[tokio::test]
async fn kind_counter_tracks_adds_and_deletes() {
    let registry = Registry::new();
    let kind = registry
        .register_dynamic(
            "Ticket",
            vec![Field::string("subject")],
            KindOptions::default().counter("tickets"),
        )
        .unwrap();
    let engine = engine_with(registry, EngineConfig::default());

    let mut keys = Vec::new();
    for i in 0..4 {
        let mut holder = Holder::new(kind.clone());
        holder
            .parse_input_bytes(format!(r#"{{"subject": "s{i}"}}"#).as_bytes())
            .unwrap();
        keys.push(engine.add(&mut holder).await.unwrap());
    }
    let mut named = Holder::new(kind.clone());
    named.assign_name("pinned").unwrap();
    engine.add(&mut named).await.unwrap();

    assert_eq!(engine.kind_count(&kind).await.unwrap(), Some(5));
    engine.delete(&kind, &keys[1]).await.unwrap();
    engine.delete(&kind, &keys[2]).await.unwrap();
    assert_eq!(engine.kind_count(&kind).await.unwrap(), Some(3));
    assert_eq!(engine.counter().sum_shards("tickets").await.unwrap(), 3);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn pagination_over_57_entities() {
    let (registry, kind) = people();
    let engine = engine_with(registry, EngineConfig::default());
    for i in 0..57 {
        add_person(&engine, None, &format!("p{i:02}"), i, "Oslo").await;
    }

    let params = QueryParams::from_query_string("order=age&limit=20&offset=20").unwrap();
    let page = engine
        .query(&kind, &params, "https://api.test/people")
        .await
        .unwrap();
    assert_eq!(page.total, 57);
    assert_eq!(page.count, 20);
    assert_eq!(page.items[0]["age"], json!(20));
    assert_eq!(page.items[19]["age"], json!(39));
    assert_eq!(page.pagination.next, Some(40));
    assert_eq!(page.pagination.prev, Some(0));

    let link = page.link.unwrap();
    assert!(link.contains("<https://api.test/people?order=age&limit=20&offset=40>; rel=\"next\""));
    assert!(link.contains("offset=0>; rel=\"prev\""));

    let params = QueryParams::from_query_string("order=age&limit=20&offset=40").unwrap();
    let last = engine.query(&kind, &params, "/people").await.unwrap();
    assert_eq!(last.count, 17);
    assert_eq!(last.pagination.next, None);
    assert_eq!(last.pagination.last, None);
}

#[tokio::test]
async fn filters_on_scalar_and_nested_fields() {
    let (registry, kind) = people();
    let engine = engine_with(registry, EngineConfig::default());
    add_person(&engine, None, "Ann", 17, "Oslo").await;
    add_person(&engine, None, "Bo", 18, "Bergen").await;
    add_person(&engine, None, "Cy", 40, "Oslo").await;

    let params = QueryParams::from_pairs([
        ("filters[0][filterStr]", "age >="),
        ("filters[0][value]", "18"),
        ("filters[1][filterStr]", "address.city"),
        ("filters[1][value]", "Oslo"),
    ])
    .unwrap();
    let page = engine.query(&kind, &params, "/people").await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0]["name"], json!("Cy"));

    let params = QueryParams::from_pairs([
        ("filters[0][filterStr]", "name !="),
        ("filters[0][value]", "Bo"),
        ("order", "-age"),
    ])
    .unwrap();
    let page = engine.query(&kind, &params, "/people").await.unwrap();
    let names: Vec<_> = page.items.iter().map(|i| i["name"].clone()).collect();
    assert_eq!(names, vec![json!("Cy"), json!("Ann")]);

    let bad = QueryParams::from_pairs([("filters[0][filterStr]", "age"), ("filters[0][value]", "x")]).unwrap();
    assert!(matches!(
        engine.query(&kind, &bad, "/people").await,
        Err(Error::FieldTypeInvalid { .. })
    ));
}

#[tokio::test]
async fn ancestor_scopes_results() {
    let (registry, kind) = people();
    let engine = engine_with(registry, EngineConfig::default());
    let family = Key::named("Family", "smith");
    let child = add_person(&engine, Some(&family), "Kid", 8, "Oslo").await;
    add_person(&engine, Some(&family), "Teen", 15, "Oslo").await;
    add_person(&engine, None, "Other", 30, "Oslo").await;

    assert_eq!(child.parent(), Some(family.clone()));
    let params = QueryParams::from_pairs([("ancestor", family.encode())]).unwrap();
    let page = engine.query(&kind, &params, "/people").await.unwrap();
    assert_eq!(page.total, 2);
    assert!(page.link.is_none());
}

#[tokio::test]
async fn id_lookup_is_exclusive() {
    let (registry, kind) = people();
    let engine = engine_with(registry, EngineConfig::default());
    let key = add_person(&engine, None, "Ann", 30, "Oslo").await;

    let params = QueryParams::from_pairs([("id", key.encode()), ("limit", "5".to_string())]).unwrap();
    match engine.query(&kind, &params, "/people").await {
        Err(Error::ConflictingParameters(conflicts)) => {
            assert_eq!(conflicts, vec!["id cannot be combined with limit"]);
        }
        other => panic!("unexpected {other:?}"),
    }

    let params = QueryParams::from_pairs([("id", key.encode())]).unwrap();
    let page = engine.query(&kind, &params, "/people").await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.items[0]["name"], json!("Ann"));
}

// ============================================================================
// Counters and concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_all_counted() {
    for shards in [1, 3, 20] {
        let counter = ShardedCounter::new(
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryCache::new()),
            CounterConfig {
                default_shards: shards,
                ..CounterConfig::default()
            },
            RetryPolicy {
                max_attempts: 50,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
            },
        );
        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.increment("views").await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }
        counter.invalidate("views").await;
        assert_eq!(counter.count("views").await.unwrap(), 40, "shards = {shards}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_shard_increments_succeed_with_default_retries() {
    let counter = ShardedCounter::new(
        Arc::new(MemoryDatastore::new()),
        Arc::new(MemoryCache::new()),
        CounterConfig {
            default_shards: 1,
            ..CounterConfig::default()
        },
        RetryPolicy::default(),
    );
    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let counter = counter.clone();
            tokio::spawn(async move { counter.increment("hits").await })
        })
        .collect();
    let succeeded = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|result| matches!(result, Ok(Ok(()))))
        .count();
    assert_eq!(succeeded, 40);
    counter.invalidate("hits").await;
    assert_eq!(counter.count("hits").await.unwrap(), 40);
}

#[tokio::test]
async fn counter_without_cache_sums_shards() {
    let counter = ShardedCounter::new(
        Arc::new(MemoryDatastore::new()),
        Arc::new(NoCache),
        CounterConfig::default(),
        RetryPolicy::default(),
    );
    counter.add("likes", 5).await.unwrap();
    counter.decrement("likes").await.unwrap();
    assert_eq!(counter.count("likes").await.unwrap(), 4);
    assert_eq!(counter.increase_shards("likes", 50).await.unwrap(), 50);
    counter.increment("likes").await.unwrap();
    assert_eq!(counter.count("likes").await.unwrap(), 5);
}

// ============================================================================
// Deadlines
// ============================================================================

/// Memory datastore whose point reads stall.
#[derive(Clone, Default)]
struct SlowDatastore {
    inner: MemoryDatastore,
    delay: Duration,
}

impl Datastore for SlowDatastore {
    type Tx = MemoryTransaction;

    async fn get(&self, key: &Key) -> kindstore_engine::Result<Option<Entity>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, entity: Entity) -> kindstore_engine::Result<Key> {
        self.inner.put(entity).await
    }

    async fn delete(&self, key: &Key) -> kindstore_engine::Result<()> {
        self.inner.delete(key).await
    }

    async fn begin(&self) -> kindstore_engine::Result<MemoryTransaction> {
        self.inner.begin().await
    }

    async fn run_query(&self, query: &Query) -> kindstore_engine::Result<Vec<Entity>> {
        self.inner.run_query(query).await
    }

    async fn count(&self, query: &Query) -> kindstore_engine::Result<usize> {
        self.inner.count(query).await
    }
}

#[tokio::test]
async fn slow_reads_hit_the_deadline() {
    let (registry, kind) = people();
    let engine = Engine::new(
        Arc::new(SlowDatastore {
            inner: MemoryDatastore::new(),
            delay: Duration::from_millis(200),
        }),
        Arc::new(NoCache),
        Arc::new(registry),
        EngineConfig {
            op_timeout: Some(Duration::from_millis(20)),
            ..EngineConfig::default()
        },
    );
    let key = add_person(&engine, None, "Ann", 30, "Oslo").await;

    let mut holder = Holder::new(kind);
    assert!(matches!(
        engine.get(&mut holder, &key).await,
        Err(Error::DeadlineExceeded)
    ));
    assert!(holder.key().is_none());
}

#[tokio::test]
async fn keys_round_trip_through_encoding() {
    let parent = Key::named("Family", "smith");
    let key = parent.child("Person", KeyId::Id(7)).unwrap();
    let decoded = Key::decode(&key.encode()).unwrap();
    assert_eq!(decoded, key);
    assert!(parent.is_ancestor_of(&decoded));
}
