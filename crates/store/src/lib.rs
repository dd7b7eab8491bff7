//! SQLite persistence for the relay engine.
//!
//! [`SqliteIdentityMap`] and [`SqliteOutcomeLog`] share one pool. Call
//! [`run_migrations`] once at startup before using either.

pub mod error;
pub mod identity;
pub mod outcome;

use std::path::Path;

use {
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    },
    tracing::info,
};

pub use {
    error::{Error, Result},
    identity::SqliteIdentityMap,
    outcome::SqliteOutcomeLog,
};

/// Run database migrations for the relay store.
///
/// Creates the `message_records` and `delivery_outcomes` tables.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

/// Open (creating if needed) the database file at `path` and migrate it.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    info!(path = %path.display(), "relay database ready");
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
#[doc(hidden)]
pub async fn open_in_memory() -> Result<SqlitePool> {
    // One connection: every `:memory:` connection is a separate database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_file_and_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("threadrelay.db");
        let pool = open(&path).await.unwrap();
        assert!(path.exists());
        // Migrations are idempotent.
        run_migrations(&pool).await.unwrap();
    }
}
