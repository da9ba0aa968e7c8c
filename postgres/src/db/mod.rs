//! Database module for PostgreSQL persistence.

mod datastore;
mod entities;

pub use datastore::*;
pub use entities::*;
