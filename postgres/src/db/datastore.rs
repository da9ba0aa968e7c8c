//! [`Datastore`] implementation over PostgreSQL.
//!
//! Transactions run at `SERIALIZABLE`; a serialization failure surfaces as
//! `Conflict` and the engine retries the whole transaction.

use super::entities::{
    count_sql, fields_index, is_fully_pushed, select_sql, sort_key, Bind, StoredEntity,
    ENTITY_COLUMNS,
};
use crate::error::backend_error;
use chrono::Utc;
use kindstore_engine::{Datastore, Entity, Error, Key, Property, Query, Result, Transaction};
use sqlx::postgres::{PgArguments, PgPoolOptions, Postgres};
use sqlx::query::QueryAs;
use sqlx::types::Json;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

/// Entity store backed by a connection pool. Clones share the pool.
#[derive(Debug, Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to database");
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn fetch_entity<'e, E>(executor: E, key: &Key) -> Result<Option<Entity>>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE key_path = $1");
    let row: Option<StoredEntity> = sqlx::query_as(&sql)
        .bind(key.to_path_string())
        .fetch_optional(executor)
        .await
        .map_err(backend_error)?;
    row.map(StoredEntity::into_entity).transpose()
}

async fn allocate_id<'e, E>(executor: E) -> Result<i64>
where
    E: Executor<'e, Database = Postgres>,
{
    let (id,): (i64,) = sqlx::query_as("SELECT nextval('entity_ids')")
        .fetch_one(executor)
        .await
        .map_err(backend_error)?;
    Ok(id)
}

async fn upsert_entity<'e, E>(executor: E, key: &Key, properties: &[Property]) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO entities (
            key_path, encoded_key, sort_key, kind, parent_path, properties, fields,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
        ON CONFLICT (key_path) DO UPDATE SET
            properties = EXCLUDED.properties,
            fields = EXCLUDED.fields,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(key.to_path_string())
    .bind(key.encode())
    .bind(sort_key(key))
    .bind(key.kind())
    .bind(key.parent().map(|p| p.to_path_string()))
    .bind(Json(properties))
    .bind(Json(fields_index(properties)))
    .bind(Utc::now())
    .execute(executor)
    .await
    .map_err(backend_error)?;
    debug!(key = %key, properties = properties.len(), "entity written");
    Ok(())
}

/// Delete the row at `key`, returning whether one existed.
async fn delete_entity<'e, E>(executor: E, key: &Key) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM entities WHERE key_path = $1")
        .bind(key.to_path_string())
        .execute(executor)
        .await
        .map_err(backend_error)?;
    Ok(result.rows_affected() > 0)
}

impl Datastore for PgDatastore {
    type Tx = PgTransaction;

    async fn get(&self, key: &Key) -> Result<Option<Entity>> {
        fetch_entity(&self.pool, key).await
    }

    async fn put(&self, entity: Entity) -> Result<Key> {
        let key = if entity.key.is_complete() {
            entity.key
        } else {
            entity.key.with_allocated_id(allocate_id(&self.pool).await?)
        };
        upsert_entity(&self.pool, &key, &entity.properties).await?;
        Ok(key)
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        if delete_entity(&self.pool, key).await? {
            Ok(())
        } else {
            Err(Error::NotFound(key.to_string()))
        }
    }

    async fn begin(&self) -> Result<PgTransaction> {
        let mut tx = self.pool.begin().await.map_err(backend_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(backend_error)?;
        Ok(PgTransaction { tx })
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Entity>> {
        let sql = select_sql(query);
        let rows = bind_all(sqlx::query_as::<_, StoredEntity>(&sql.sql), sql.binds)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error)?;
        let entities = rows
            .into_iter()
            .map(StoredEntity::into_entity)
            .collect::<Result<Vec<_>>>()?;
        if is_fully_pushed(query) {
            return Ok(entities);
        }
        debug!(kind = %query.kind, candidates = entities.len(), "applying query in memory");
        Ok(query.apply(entities))
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        let unbounded = query.unbounded();
        let Some(sql) = count_sql(&unbounded) else {
            return self.run_query(&unbounded).await.map(|entities| entities.len());
        };
        let (count,): (i64,) = bind_all(sqlx::query_as(&sql.sql), sql.binds)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn bind_all<'q, O>(
    mut query: QueryAs<'q, Postgres, O, PgArguments>,
    binds: Vec<Bind>,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Text(text) => query.bind(text),
            Bind::Json(value) => query.bind(Json(value)),
            Bind::Int(n) => query.bind(n),
        };
    }
    query
}

/// A serializable transaction. Dropping it without commit rolls back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl Transaction for PgTransaction {
    async fn get(&mut self, key: &Key) -> Result<Option<Entity>> {
        fetch_entity(&mut *self.tx, key).await
    }

    async fn put(&mut self, entity: Entity) -> Result<Key> {
        let key = if entity.key.is_complete() {
            entity.key
        } else {
            entity.key.with_allocated_id(allocate_id(&mut *self.tx).await?)
        };
        upsert_entity(&mut *self.tx, &key, &entity.properties).await?;
        Ok(key)
    }

    async fn delete(&mut self, key: &Key) -> Result<()> {
        if delete_entity(&mut *self.tx, key).await? {
            Ok(())
        } else {
            Err(Error::NotFound(key.to_string()))
        }
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(backend_error)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(backend_error)
    }
}
