//! In-process datastore with optimistic transactions.
//!
//! Every stored entity carries the version of the commit that wrote it.
//! A transaction records the version of each key it reads (0 for absent)
//! and buffers its writes; commit fails with [`Error::Conflict`] when any
//! read key has changed since. Blind writes never conflict.

use crate::datastore::{Datastore, Entity, Query, Transaction};
use crate::property::Property;
use crate::{error::Result, Error, Key};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Stored {
    version: u64,
    properties: Vec<Property>,
}

#[derive(Debug, Default)]
struct State {
    entities: BTreeMap<Key, Stored>,
    next_id: i64,
    version: u64,
}

impl State {
    fn complete(&mut self, key: Key) -> Key {
        if key.is_complete() {
            return key;
        }
        self.next_id += 1;
        key.with_allocated_id(self.next_id)
    }

    fn version_of(&self, key: &Key) -> u64 {
        self.entities.get(key).map(|s| s.version).unwrap_or(0)
    }

    fn entity(&self, key: &Key) -> Option<Entity> {
        self.entities
            .get(key)
            .map(|s| Entity::new(key.clone(), s.properties.clone()))
    }

    fn write(&mut self, key: Key, properties: Vec<Property>) {
        self.version += 1;
        let version = self.version;
        self.entities.insert(
            key,
            Stored {
                version,
                properties,
            },
        );
    }
}

/// Datastore held entirely in memory. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    state: Arc<Mutex<State>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities across all kinds.
    pub fn len(&self) -> usize {
        self.state.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemoryDatastore {
    type Tx = MemoryTransaction;

    async fn get(&self, key: &Key) -> Result<Option<Entity>> {
        Ok(self.state.lock().entity(key))
    }

    async fn put(&self, entity: Entity) -> Result<Key> {
        let mut state = self.state.lock();
        let key = state.complete(entity.key);
        state.write(key.clone(), entity.properties);
        Ok(key)
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let mut state = self.state.lock();
        match state.entities.remove(key) {
            Some(_) => {
                state.version += 1;
                Ok(())
            }
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    async fn begin(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            state: self.state.clone(),
            read_set: HashMap::new(),
            writes: BTreeMap::new(),
        })
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Entity>> {
        let snapshot: Vec<Entity> = {
            let state = self.state.lock();
            state
                .entities
                .iter()
                .filter(|(key, _)| key.kind() == query.kind)
                .map(|(key, stored)| Entity::new(key.clone(), stored.properties.clone()))
                .collect()
        };
        Ok(query.apply(snapshot))
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        self.run_query(&query.unbounded()).await.map(|items| items.len())
    }
}

/// Transaction over a [`MemoryDatastore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    /// Version of each key as first read; 0 when absent
    read_set: HashMap<Key, u64>,
    /// Buffered writes; `None` deletes
    writes: BTreeMap<Key, Option<Vec<Property>>>,
}

impl MemoryTransaction {
    fn read(&mut self, key: &Key) -> Option<Entity> {
        if let Some(buffered) = self.writes.get(key) {
            return buffered
                .as_ref()
                .map(|props| Entity::new(key.clone(), props.clone()));
        }
        let state = self.state.lock();
        self.read_set
            .entry(key.clone())
            .or_insert_with(|| state.version_of(key));
        state.entity(key)
    }
}

impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &Key) -> Result<Option<Entity>> {
        Ok(self.read(key))
    }

    async fn put(&mut self, entity: Entity) -> Result<Key> {
        let key = self.state.lock().complete(entity.key);
        self.writes.insert(key.clone(), Some(entity.properties));
        Ok(key)
    }

    async fn delete(&mut self, key: &Key) -> Result<()> {
        if self.read(key).is_none() {
            return Err(Error::NotFound(key.to_string()));
        }
        self.writes.insert(key.clone(), None);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut state = self.state.lock();
        for (key, version) in &self.read_set {
            let current = state.version_of(key);
            if current != *version {
                debug!(key = %key, read = version, current, "transaction conflict");
                return Err(Error::Conflict(key.to_string()));
            }
        }
        for (key, write) in self.writes {
            match write {
                Some(properties) => state.write(key, properties),
                None => {
                    state.entities.remove(&key);
                    state.version += 1;
                }
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
