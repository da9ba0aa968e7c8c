//! Kindstore Postgres - maintenance tool for the PostgreSQL backend.
//!
//! Usage:
//!
//! ```text
//! kindstore-postgres [migrate]          apply pending migrations
//! kindstore-postgres counter <name>     print a sharded counter's value
//! kindstore-postgres shards <name> <n>  raise a counter's shard count
//! ```

use kindstore_engine::{NoCache, ShardedCounter};
use kindstore_postgres::error::Result;
use kindstore_postgres::{AppError, Config, PgDatastore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Migrate,
    Counter { name: String },
    Shards { name: String, shards: u32 },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args {
            [] => Ok(Command::Migrate),
            [cmd] if cmd == "migrate" => Ok(Command::Migrate),
            [cmd, name] if cmd == "counter" => Ok(Command::Counter { name: name.clone() }),
            [cmd, name, shards] if cmd == "shards" => {
                let shards = shards
                    .parse()
                    .map_err(|_| AppError::Usage(format!("invalid shard count '{shards}'")))?;
                Ok(Command::Shards {
                    name: name.clone(),
                    shards,
                })
            }
            _ => Err(AppError::Usage(
                "kindstore-postgres [migrate | counter <name> | shards <name> <n>]".into(),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kindstore_postgres=debug,kindstore_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let datastore = PgDatastore::connect(&config.database_url, config.max_connections).await?;

    tracing::info!("Running database migrations...");
    datastore.migrate().await?;

    let engine_config = config.engine_config();
    let counter = ShardedCounter::new(
        Arc::new(datastore),
        Arc::new(NoCache),
        engine_config.counter,
        engine_config.retry,
    );

    match command {
        Command::Migrate => tracing::info!("Migrations applied"),
        Command::Counter { name } => {
            let count = counter.count(&name).await?;
            println!("{name}: {count}");
        }
        Command::Shards { name, shards } => {
            let shards = counter.increase_shards(&name, shards).await?;
            println!("{name}: {shards} shards");
        }
    }

    Ok(())
}
