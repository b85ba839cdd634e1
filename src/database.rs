use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::migrate::Migrator;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::StorageError;

static MIGRATOR: Migrator = sqlx::migrate!();

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the store and applies pending migrations.
///
/// The pool holds a single connection: all writes go through one writer, and
/// `sqlite::memory:` databases stay alive for the lifetime of the pool.
pub async fn setup_database(database_url: &str) -> Result<SqlitePool, StorageError> {
  let options = SqliteConnectOptions::from_str(database_url)?
    .create_if_missing(true)
    .journal_mode(SqliteJournalMode::Wal)
    .synchronous(SqliteSynchronous::Normal)
    .foreign_keys(true)
    .busy_timeout(BUSY_TIMEOUT);

  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .acquire_timeout(ACQUIRE_TIMEOUT)
    .idle_timeout(None)
    .max_lifetime(None)
    .connect_with(options)
    .await?;

  MIGRATOR.run(&pool).await?;
  info!(database_url, "Database migrations complete");
  Ok(pool)
}

/// In-memory store with the schema applied.
pub async fn memory_database() -> Result<SqlitePool, StorageError> {
  setup_database("sqlite::memory:").await
}
