//! # Kindstore Postgres
//!
//! A [`kindstore_engine::Datastore`] backed by PostgreSQL.
//!
//! Every entity is one row of the `entities` table, keyed by its canonical
//! key path. Properties are stored as JSONB, alongside a `fields` column of
//! indexed values that equality filters are pushed down to. Ids for
//! incomplete keys come from the `entity_ids` sequence.
//!
//! ```rust,no_run
//! use kindstore_engine::{Engine, NoCache, Registry};
//! use kindstore_postgres::{Config, PgDatastore};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! let datastore = PgDatastore::connect(&config.database_url, config.max_connections).await?;
//! datastore.migrate().await?;
//!
//! let engine = Engine::new(
//!     Arc::new(datastore),
//!     Arc::new(NoCache),
//!     Arc::new(Registry::new()),
//!     config.engine_config(),
//! );
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;

pub use config::{Config, ConfigError};
pub use db::{PgDatastore, PgTransaction};
pub use error::{backend_error, AppError};
