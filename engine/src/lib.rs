//! # Kindstore Engine
//!
//! Entity mapping and property storage over a transactional datastore.
//!
//! Application records are declared once as a [`Kind`]: a list of fields
//! with their storage names, JSON names, and flags. A [`Holder`] carries one
//! entity between the three forms it takes:
//!
//! - typed records and generic JSON input from callers;
//! - flat, dotted-name [`Property`] lists in the datastore;
//! - caller-facing JSON output keyed by JSON name.
//!
//! ## Core Concepts
//!
//! ### Kinds and Fields
//!
//! A [`Record`] type lists its [`Field`]s. The [`Registry`] derives and
//! caches a [`Kind`] per record type; invalid declarations fail with
//! [`Error::InvalidSchema`] at registration.
//!
//! ### Holders
//!
//! Input is parsed into a working value, prepared into property trees per
//! supplied field, and merged over the stored state on save. Fields the
//! caller did not supply keep their stored value. [`Holder::patch`] applies
//! JSON Patch style operations all-or-nothing.
//!
//! ### Engine
//!
//! The [`Engine`] runs get, add, update, delete, and query against any
//! [`Datastore`]. Writes that read first run in a transaction and retry on
//! [`Error::Conflict`] with exponential backoff.
//!
//! ### Sharded Counters
//!
//! A [`ShardedCounter`] spreads increments over many small rows and caches
//! the sum in a [`Cache`].
//!
//! ## Quick Start
//!
//! ```rust
//! use kindstore_engine::{
//!     Engine, EngineConfig, Field, KindOptions, MemoryCache, MemoryDatastore,
//!     QueryParams, Record, Registry, ValueType,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! #[serde(default)]
//! struct Article {
//!     title: String,
//!     tags: Vec<String>,
//! }
//!
//! impl Record for Article {
//!     fn fields() -> Vec<Field> {
//!         vec![
//!             Field::string("title").required(),
//!             Field::list("tags", ValueType::String),
//!         ]
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! // 1. Register the kind
//! let registry = Registry::new();
//! let kind = registry.register::<Article>(KindOptions::default()).unwrap();
//!
//! // 2. Build an engine over a datastore and a cache
//! let engine = Engine::new(
//!     Arc::new(MemoryDatastore::new()),
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(registry),
//!     EngineConfig::default(),
//! );
//!
//! // 3. Store an entity
//! let mut holder = engine.holder::<Article>().unwrap();
//! holder.parse_input_bytes(br#"{"title": "Hello", "tags": ["intro"]}"#).unwrap();
//! let key = engine.add(&mut holder).await.unwrap();
//!
//! // 4. Read it back
//! let mut loaded = engine.holder::<Article>().unwrap();
//! engine.get(&mut loaded, &key).await.unwrap();
//! assert_eq!(loaded.value::<Article>().unwrap().title, "Hello");
//!
//! // 5. Query
//! let params = QueryParams::from_query_string("order=title").unwrap();
//! let page = engine.query(&kind, &params, "/articles").await.unwrap();
//! assert_eq!(page.total, 1);
//! # });
//! ```
//!
//! ## Backends
//!
//! [`MemoryDatastore`] keeps everything in process. Other backends implement
//! [`Datastore`] and [`Transaction`]; see the `kindstore-postgres` crate.

pub mod cache;
pub mod counter;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod field;
pub mod holder;
pub mod key;
pub mod kind;
pub mod memory;
pub mod patch;
pub mod property;
pub mod query;
pub mod retry;

// Re-export main types at crate root
pub use cache::{Cache, MemoryCache, NoCache};
pub use counter::{CounterConfig, ShardedCounter};
pub use datastore::{Datastore, Entity, Filter, FilterOp, Order, Query, Transaction};
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
pub use field::{Field, FieldDescriptor, FieldType, MetaRole, Naming, Shape, ValueType};
pub use holder::{Holder, Meta};
pub use key::{Key, KeyId, PathElement};
pub use kind::{Hooks, Kind, KindOptions, Record, Registry};
pub use memory::{MemoryDatastore, MemoryTransaction};
pub use patch::{Op, Operation};
pub use property::{Property, PropertyTree, Value};
pub use query::{FilterParam, Pagination, QueryParams, QueryResult};
pub use retry::RetryPolicy;
