//! Transactional CRUD over a [`Datastore`].
//!
//! The engine moves holders in and out of storage. Writes that must observe
//! existing state run in a transaction and are retried on
//! [`Error::Conflict`] according to the configured [`RetryPolicy`]. When an
//! operation timeout is configured, an operation that runs past it fails
//! with [`Error::DeadlineExceeded`]; its open transaction is dropped, so
//! nothing it wrote becomes visible.

use crate::counter::{CounterConfig, ShardedCounter};
use crate::datastore::{Datastore, Entity, Transaction};
use crate::query::{Pagination, QueryParams, QueryResult};
use crate::retry::RetryPolicy;
use crate::{error::Result, Cache, Error, Holder, Key, KeyId, Kind, Record, Registry};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Deadline for a whole operation, retries included
    pub op_timeout: Option<Duration>,
    pub counter: CounterConfig,
}

/// Entity operations bound to a datastore, a cache, and a registry.
pub struct Engine<D, C> {
    datastore: Arc<D>,
    registry: Arc<Registry>,
    counter: ShardedCounter<D, C>,
    config: EngineConfig,
}

impl<D, C> Clone for Engine<D, C> {
    fn clone(&self) -> Self {
        Self {
            datastore: self.datastore.clone(),
            registry: self.registry.clone(),
            counter: self.counter.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: Datastore, C: Cache> Engine<D, C> {
    pub fn new(datastore: Arc<D>, cache: Arc<C>, registry: Arc<Registry>, config: EngineConfig) -> Self {
        let counter = ShardedCounter::new(
            datastore.clone(),
            cache,
            config.counter.clone(),
            config.retry.clone(),
        );
        Self {
            datastore,
            registry,
            counter,
            config,
        }
    }

    pub fn datastore(&self) -> &Arc<D> {
        &self.datastore
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn counter(&self) -> &ShardedCounter<D, C> {
        &self.counter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Empty holder for a registered record type.
    pub fn holder<T: Record>(&self) -> Result<Holder> {
        Ok(Holder::new(self.registry.kind::<T>()?))
    }

    /// Empty holder for a kind looked up by name.
    pub fn holder_by_name(&self, name: &str) -> Result<Holder> {
        self.registry
            .by_name(name)
            .map(Holder::new)
            .ok_or_else(|| Error::InvalidSchema(format!("unknown kind '{name}'")))
    }

    /// Load the entity at `key` into `holder`.
    pub async fn get(&self, holder: &mut Holder, key: &Key) -> Result<()> {
        check_key(holder.kind(), key)?;
        self.deadline("get", async {
            let entity = self
                .datastore
                .get(key)
                .await?
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            holder.set_key(key.clone())?;
            holder.load(&entity.properties);
            Ok(())
        })
        .await
    }

    /// Store a new entity.
    ///
    /// A holder bound to a complete key is created under that key and fails
    /// with [`Error::AlreadyExists`] if it is taken. Otherwise the datastore
    /// allocates an id under the holder's parent. Returns the new key.
    pub async fn add(&self, holder: &mut Holder) -> Result<Key> {
        let kind = holder.kind().clone();
        if let Some(hooks) = kind.hooks() {
            hooks.on_before_create(holder)?;
        }
        let now = Utc::now();
        let key = self
            .deadline("add", async {
                let named = holder.key().filter(|k| k.is_complete()).cloned();
                match named {
                    Some(key) => self.add_named(holder, key, now).await,
                    None => self.add_allocated(holder, now).await,
                }
            })
            .await?;
        if let Some(counter) = kind.counter() {
            self.counter.bump_cache(counter, 1).await;
        }
        info!(kind = %kind.name(), key = %key, "entity added");
        Ok(key)
    }

    async fn add_named(&self, holder: &mut Holder, key: Key, now: DateTime<Utc>) -> Result<Key> {
        let mut attempt = 1;
        loop {
            let result = self.try_add_named(holder, &key, now).await;
            let err = match result {
                Ok(()) => return Ok(key),
                Err(err) => err,
            };
            attempt = self.backoff("add", attempt, err).await?;
        }
    }

    async fn try_add_named(&self, holder: &mut Holder, key: &Key, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.datastore.begin().await?;
        if tx.get(key).await?.is_some() {
            tx.rollback().await?;
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let properties = holder.save(now)?;
        tx.put(Entity::new(key.clone(), properties)).await?;
        if let Some(counter) = holder.kind().counter() {
            self.counter.apply_in(&mut tx, counter, 1).await?;
        }
        after_create(holder)?;
        tx.commit().await
    }

    async fn add_allocated(&self, holder: &mut Holder, now: DateTime<Utc>) -> Result<Key> {
        let incomplete = Key::new(holder.kind().name(), KeyId::Incomplete, holder.parent())?;
        if holder.kind().counter().is_none() {
            let properties = holder.save(now)?;
            let key = self.datastore.put(Entity::new(incomplete, properties)).await?;
            holder.set_key(key.clone())?;
            after_create(holder)?;
            return Ok(key);
        }

        let mut attempt = 1;
        loop {
            let err = match self.try_add_counted(holder, &incomplete, now).await {
                Ok(key) => return Ok(key),
                Err(err) => err,
            };
            attempt = self.backoff("add", attempt, err).await?;
        }
    }

    async fn try_add_counted(&self, holder: &mut Holder, incomplete: &Key, now: DateTime<Utc>) -> Result<Key> {
        let mut tx = self.datastore.begin().await?;
        let properties = holder.save(now)?;
        let key = tx.put(Entity::new(incomplete.clone(), properties)).await?;
        if let Some(counter) = holder.kind().counter() {
            self.counter.apply_in(&mut tx, counter, 1).await?;
        }
        holder.set_key(key.clone())?;
        after_create(holder)?;
        tx.commit().await?;
        Ok(key)
    }

    /// Merge the holder's supplied fields into the stored entity at `key`.
    pub async fn update(&self, holder: &mut Holder, key: &Key) -> Result<()> {
        check_key(holder.kind(), key)?;
        let kind = holder.kind().clone();
        if let Some(hooks) = kind.hooks() {
            hooks.on_before_update(holder)?;
        }
        let now = Utc::now();
        self.deadline("update", async {
            let mut attempt = 1;
            loop {
                let err = match self.try_update(holder, key, now).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };
                attempt = self.backoff("update", attempt, err).await?;
            }
        })
        .await?;
        debug!(kind = %kind.name(), key = %key, "entity updated");
        Ok(())
    }

    async fn try_update(&self, holder: &mut Holder, key: &Key, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.datastore.begin().await?;
        let entity = tx
            .get(key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        holder.set_key(key.clone())?;
        holder.load(&entity.properties);
        let properties = holder.save(now)?;
        tx.put(Entity::new(key.clone(), properties)).await?;
        if let Some(hooks) = holder.kind().hooks() {
            hooks.on_after_update(holder)?;
        }
        tx.commit().await
    }

    /// Load, patch, and update the entity at `key` in one call.
    pub async fn patch(&self, holder: &mut Holder, key: &Key, raw: &[u8]) -> Result<()> {
        self.get(holder, key).await?;
        holder.patch(raw)?;
        self.update(holder, key).await
    }

    /// Delete the entity at `key`, decrementing the kind's counter.
    pub async fn delete(&self, kind: &Kind, key: &Key) -> Result<()> {
        check_key(kind, key)?;
        let counter = kind.counter();
        self.deadline(
            "delete",
            self.config.retry.run(|| async move {
                let mut tx = self.datastore.begin().await?;
                tx.delete(key).await?;
                if let Some(counter) = counter {
                    self.counter.apply_in(&mut tx, counter, -1).await?;
                }
                tx.commit().await
            }),
        )
        .await?;
        if let Some(counter) = counter {
            self.counter.bump_cache(counter, -1).await;
        }
        info!(kind = %kind.name(), key = %key, "entity deleted");
        Ok(())
    }

    /// Number of entities of a kind that keeps an aggregate counter.
    pub async fn kind_count(&self, kind: &Kind) -> Result<Option<i64>> {
        match kind.counter() {
            Some(counter) => self.counter.count(counter).await.map(Some),
            None => Ok(None),
        }
    }

    /// List entities of `kind`.
    ///
    /// `base_url` is the URL the parameters came from; pagination links are
    /// built on it.
    pub async fn query(&self, kind: &Arc<Kind>, params: &QueryParams, base_url: &str) -> Result<QueryResult> {
        self.deadline("query", async {
            if params.is_id_lookup() {
                return self.lookup(kind, params).await;
            }
            let query = params.build(kind)?;
            let total = self.datastore.count(&query.unbounded()).await?;
            let entities = self.datastore.run_query(&query).await?;
            let items = entities
                .into_iter()
                .map(|entity| output_of(kind, entity))
                .collect::<Result<Vec<_>>>()?;
            let pagination = Pagination::compute(params.offset(), params.limit(), total);
            let link = pagination.link_header(base_url, params);
            debug!(kind = %kind.name(), total, count = items.len(), "query executed");
            Ok(QueryResult {
                count: items.len(),
                items,
                total,
                pagination,
                link,
            })
        })
        .await
    }

    /// Fetch by id list. Ids with no entity are skipped.
    async fn lookup(&self, kind: &Arc<Kind>, params: &QueryParams) -> Result<QueryResult> {
        params.check_conflicts()?;
        let mut items = Vec::new();
        for key in params.keys(kind)? {
            match self.datastore.get(&key).await? {
                Some(entity) => items.push(output_of(kind, entity)?),
                None => debug!(key = %key, "id lookup missed"),
            }
        }
        Ok(QueryResult {
            total: items.len(),
            count: items.len(),
            items,
            pagination: Pagination::default(),
            link: None,
        })
    }

    /// Sleep before the next attempt, or hand back the final error.
    async fn backoff(&self, op: &'static str, attempt: u32, err: Error) -> Result<u32> {
        let Some(delay) = self.config.retry.should_retry(attempt, &err) else {
            return Err(err);
        };
        warn!(op, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying after conflict");
        tokio::time::sleep(delay).await;
        Ok(attempt + 1)
    }

    async fn deadline<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let Some(limit) = self.config.op_timeout else {
            return fut.await;
        };
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = limit.as_millis() as u64, "operation deadline exceeded");
                Err(Error::DeadlineExceeded)
            }
        }
    }
}

fn check_key(kind: &Kind, key: &Key) -> Result<()> {
    if !key.is_complete() {
        return Err(Error::IncompleteKey(key.to_string()));
    }
    if key.kind() != kind.name() {
        return Err(Error::KindMismatch {
            expected: kind.name().to_string(),
            got: key.kind().to_string(),
        });
    }
    Ok(())
}

fn after_create(holder: &Holder) -> Result<()> {
    match holder.kind().hooks() {
        Some(hooks) => hooks.on_after_create(holder),
        None => Ok(()),
    }
}

fn output_of(kind: &Arc<Kind>, entity: Entity) -> Result<Map<String, JsonValue>> {
    let mut holder = Holder::new(kind.clone());
    holder.set_key(entity.key)?;
    holder.load(&entity.properties);
    Ok(holder.output())
}
