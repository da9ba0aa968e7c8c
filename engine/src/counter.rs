//! Sharded counters.
//!
//! A logical counter is split across N shard entities so concurrent writers
//! rarely touch the same row. Each write picks a shard at random and updates
//! it in its own small transaction. The true value is the sum of all shards;
//! the cache only shortens reads.
//!
//! Persisted state:
//!
//! | kind            | key                    | properties        |
//! |-----------------|------------------------|-------------------|
//! | `__ShardConfig` | `<counter>`            | `shardCount`      |
//! | `__Shard`       | `<counter>#<index>`    | `name`, `count`   |

use crate::cache::Cache;
use crate::datastore::{Datastore, Entity, FilterOp, Query, Transaction};
use crate::property::{Property, Value};
use crate::retry::RetryPolicy;
use crate::{error::Result, Key};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SHARD_CONFIG_KIND: &str = "__ShardConfig";
pub const SHARD_KIND: &str = "__Shard";

const SHARD_COUNT: &str = "shardCount";
const NAME: &str = "name";
const COUNT: &str = "count";

/// Counter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterConfig {
    /// Shards given to a counter on first use
    pub default_shards: u32,
    /// Lifetime of a cached total
    pub cache_ttl: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            default_shards: 20,
            cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Cache key holding a counter's total.
pub fn cache_key(name: &str) -> String {
    format!("shard:{name}")
}

fn config_key(name: &str) -> Key {
    Key::named(SHARD_CONFIG_KIND, name)
}

fn shard_key(name: &str, index: u32) -> Key {
    Key::named(SHARD_KIND, format!("{name}#{index}"))
}

fn config_entity(name: &str, shards: u32) -> Entity {
    Entity::new(
        config_key(name),
        vec![Property::new(SHARD_COUNT, Value::Int(i64::from(shards))).no_index(true)],
    )
}

fn shard_entity(key: Key, name: &str, count: i64) -> Entity {
    Entity::new(
        key,
        vec![
            Property::new(NAME, Value::String(name.to_string())),
            Property::new(COUNT, Value::Int(count)).no_index(true),
        ],
    )
}

fn shard_count_of(entity: &Entity) -> Option<u32> {
    entity
        .value(SHARD_COUNT)
        .and_then(Value::as_i64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
}

fn count_of(entity: &Entity) -> i64 {
    entity.value(COUNT).and_then(Value::as_i64).unwrap_or(0)
}

/// Counters over a datastore, with a cache in front of reads.
pub struct ShardedCounter<D, C> {
    datastore: Arc<D>,
    cache: Arc<C>,
    config: CounterConfig,
    retry: RetryPolicy,
}

impl<D, C> Clone for ShardedCounter<D, C> {
    fn clone(&self) -> Self {
        Self {
            datastore: self.datastore.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<D: Datastore, C: Cache> ShardedCounter<D, C> {
    pub fn new(datastore: Arc<D>, cache: Arc<C>, config: CounterConfig, retry: RetryPolicy) -> Self {
        Self {
            datastore,
            cache,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    pub async fn increment(&self, name: &str) -> Result<()> {
        self.add(name, 1).await
    }

    pub async fn decrement(&self, name: &str) -> Result<()> {
        self.add(name, -1).await
    }

    /// Add `delta` to one random shard of the counter.
    pub async fn add(&self, name: &str, delta: i64) -> Result<()> {
        let shards = self.shard_count(name).await?;
        self.retry
            .run(|| async move {
                let mut tx = self.datastore.begin().await?;
                self.apply_to_shard(&mut tx, name, shards, delta).await?;
                tx.commit().await
            })
            .await?;
        self.bump_cache(name, delta).await;
        Ok(())
    }

    /// Current total: the cached value, or the sum of all shards.
    pub async fn count(&self, name: &str) -> Result<i64> {
        let key = cache_key(name);
        match self.cache.get(&key).await {
            Ok(Some(total)) => return Ok(total),
            Ok(None) => {}
            Err(e) => warn!(counter = %name, error = %e, "counter cache read failed"),
        }
        let total = self.sum_shards(name).await?;
        if let Err(e) = self.cache.set(&key, total, self.config.cache_ttl).await {
            warn!(counter = %name, error = %e, "counter cache write failed");
        }
        Ok(total)
    }

    /// Sum the shards directly, bypassing the cache.
    pub async fn sum_shards(&self, name: &str) -> Result<i64> {
        let query = Query::new(SHARD_KIND).filter(NAME, FilterOp::Eq, Value::String(name.to_string()));
        let shards = self.datastore.run_query(&query).await?;
        Ok(shards.iter().map(count_of).sum())
    }

    /// Raise the counter's shard count to at least `shards`.
    ///
    /// Never lowers it; returns the resulting count.
    pub async fn increase_shards(&self, name: &str, shards: u32) -> Result<u32> {
        let key = &config_key(name);
        let default_shards = self.config.default_shards;
        let result = self
            .retry
            .run(|| async move {
                let mut tx = self.datastore.begin().await?;
                let current = tx
                    .get(key)
                    .await?
                    .and_then(|e| shard_count_of(&e))
                    .unwrap_or(default_shards);
                if shards <= current {
                    tx.rollback().await?;
                    return Ok(current);
                }
                tx.put(config_entity(name, shards)).await?;
                tx.commit().await?;
                Ok(shards)
            })
            .await?;
        debug!(counter = %name, shards = result, "shard count updated");
        Ok(result)
    }

    /// Apply `delta` inside a caller's transaction.
    ///
    /// The caller commits, then calls [`ShardedCounter::bump_cache`].
    pub async fn apply_in<T: Transaction>(&self, tx: &mut T, name: &str, delta: i64) -> Result<()> {
        let shards = match tx.get(&config_key(name)).await? {
            Some(entity) => shard_count_of(&entity).unwrap_or(self.config.default_shards),
            None => {
                tx.put(config_entity(name, self.config.default_shards)).await?;
                self.config.default_shards
            }
        };
        self.apply_to_shard(tx, name, shards, delta).await
    }

    /// Best-effort adjustment of a cached total. A missing entry stays
    /// missing; the next read rebuilds it from the shards.
    pub async fn bump_cache(&self, name: &str, delta: i64) {
        if let Err(e) = self.cache.incr(&cache_key(name), delta).await {
            warn!(counter = %name, error = %e, "counter cache update failed");
        }
    }

    /// Drop the cached total.
    pub async fn invalidate(&self, name: &str) {
        if let Err(e) = self.cache.delete(&cache_key(name)).await {
            warn!(counter = %name, error = %e, "counter cache delete failed");
        }
    }

    async fn shard_count(&self, name: &str) -> Result<u32> {
        let key = &config_key(name);
        if let Some(shards) = self.datastore.get(key).await?.and_then(|e| shard_count_of(&e)) {
            return Ok(shards);
        }
        let default_shards = self.config.default_shards;
        self.retry
            .run(|| async move {
                let mut tx = self.datastore.begin().await?;
                if let Some(entity) = tx.get(key).await? {
                    tx.rollback().await?;
                    return Ok(shard_count_of(&entity).unwrap_or(default_shards));
                }
                tx.put(config_entity(name, default_shards)).await?;
                tx.commit().await?;
                debug!(counter = %name, shards = default_shards, "created counter");
                Ok(default_shards)
            })
            .await
    }

    async fn apply_to_shard<T: Transaction>(
        &self,
        tx: &mut T,
        name: &str,
        shards: u32,
        delta: i64,
    ) -> Result<()> {
        let index = rand::thread_rng().gen_range(0..shards.max(1));
        let key = shard_key(name, index);
        let current = tx.get(&key).await?.map(|e| count_of(&e)).unwrap_or(0);
        tx.put(shard_entity(key, name, current + delta)).await?;
        debug!(counter = %name, shard = index, delta, "applied shard delta");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NoCache};
    use crate::memory::MemoryDatastore;
    use crate::Error;
    use std::future::Future;

    fn counter(shards: u32) -> (ShardedCounter<MemoryDatastore, MemoryCache>, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let counter = ShardedCounter::new(
            Arc::new(MemoryDatastore::new()),
            cache.clone(),
            CounterConfig {
                default_shards: shards,
                ..CounterConfig::default()
            },
            RetryPolicy::default(),
        );
        (counter, cache)
    }

    struct BrokenCache;

    impl Cache for BrokenCache {
        fn get(&self, _key: &str) -> impl Future<Output = Result<Option<i64>>> + Send {
            async { Err(Error::Backend("cache down".into())) }
        }

        fn set(&self, _key: &str, _value: i64, _ttl: Duration) -> impl Future<Output = Result<()>> + Send {
            async { Err(Error::Backend("cache down".into())) }
        }

        fn incr(&self, _key: &str, _delta: i64) -> impl Future<Output = Result<Option<i64>>> + Send {
            async { Err(Error::Backend("cache down".into())) }
        }

        fn delete(&self, _key: &str) -> impl Future<Output = Result<()>> + Send {
            async { Err(Error::Backend("cache down".into())) }
        }
    }

    #[tokio::test]
    async fn increments_sum_across_shards() {
        let (counter, _) = counter(4);
        for _ in 0..25 {
            counter.increment("views").await.unwrap();
        }
        counter.decrement("views").await.unwrap();
        assert_eq!(counter.count("views").await.unwrap(), 24);
        assert_eq!(counter.count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn count_is_served_from_cache() {
        let (counter, cache) = counter(2);
        counter.add("views", 5).await.unwrap();
        assert_eq!(counter.count("views").await.unwrap(), 5);
        assert_eq!(cache.get(&cache_key("views")).await.unwrap(), Some(5));

        // Writes bump a cached total in place.
        counter.increment("views").await.unwrap();
        assert_eq!(cache.get(&cache_key("views")).await.unwrap(), Some(6));

        // A stale cache wins until it is invalidated.
        cache.set(&cache_key("views"), 100, Duration::from_secs(60)).await.unwrap();
        assert_eq!(counter.count("views").await.unwrap(), 100);
        counter.invalidate("views").await;
        assert_eq!(counter.count("views").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn cache_failures_are_ignored() {
        let counter = ShardedCounter::new(
            Arc::new(MemoryDatastore::new()),
            Arc::new(BrokenCache),
            CounterConfig::default(),
            RetryPolicy::default(),
        );
        counter.add("views", 3).await.unwrap();
        assert_eq!(counter.count("views").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn config_row_is_created_lazily() {
        let store = Arc::new(MemoryDatastore::new());
        let counter = ShardedCounter::new(
            store.clone(),
            Arc::new(NoCache),
            CounterConfig::default(),
            RetryPolicy::default(),
        );
        counter.increment("views").await.unwrap();
        let config = store.get(&config_key("views")).await.unwrap().unwrap();
        assert_eq!(shard_count_of(&config), Some(20));
    }

    #[tokio::test]
    async fn shard_count_only_grows() {
        let (counter, _) = counter(3);
        assert_eq!(counter.increase_shards("views", 2).await.unwrap(), 3);
        assert_eq!(counter.increase_shards("views", 8).await.unwrap(), 8);
        assert_eq!(counter.increase_shards("views", 5).await.unwrap(), 8);
        for _ in 0..10 {
            counter.increment("views").await.unwrap();
        }
        assert_eq!(counter.sum_shards("views").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn apply_in_shares_the_transaction() {
        let store = Arc::new(MemoryDatastore::new());
        let counter = ShardedCounter::new(
            store.clone(),
            Arc::new(NoCache),
            CounterConfig::default(),
            RetryPolicy::default(),
        );

        let mut tx = store.begin().await.unwrap();
        counter.apply_in(&mut tx, "posts", 1).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(counter.count("posts").await.unwrap(), 0);

        let mut tx = store.begin().await.unwrap();
        counter.apply_in(&mut tx, "posts", 1).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(counter.count("posts").await.unwrap(), 1);
    }
}
