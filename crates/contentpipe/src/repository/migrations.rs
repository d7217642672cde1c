//! Database migrations using diesel_migrations.
//!
//! Embeds migrations at compile time and runs them via blocking tasks to
//! work with async connections.

use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use super::pool::DieselError;
use super::StoreError;

// Embed SQLite migrations (uses the diesel_migrations harness)
pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

/// Run pending migrations for a database URL.
pub async fn run_migrations(database_url: &str) -> Result<(), StoreError> {
    if super::util::is_postgres_url(database_url) {
        #[cfg(feature = "postgres")]
        {
            run_postgres_migrations(database_url).await
        }
        #[cfg(not(feature = "postgres"))]
        {
            Err(StoreError::Database(DieselError::QueryBuilderError(
                "PostgreSQL support not compiled. Use --features postgres".into(),
            )))
        }
    } else {
        run_sqlite_migrations(database_url).await
    }
}

/// Run SQLite migrations in a blocking task.
async fn run_sqlite_migrations(database_url: &str) -> Result<(), StoreError> {
    // diesel expects just the file path
    let url = database_url
        .strip_prefix("sqlite:")
        .unwrap_or(database_url)
        .to_string();

    tokio::task::spawn_blocking(move || {
        let mut conn = diesel::SqliteConnection::establish(&url).map_err(|e| {
            DieselError::DatabaseError(
                diesel::result::DatabaseErrorKind::Unknown,
                Box::new(e.to_string()),
            )
        })?;

        let applied = conn
            .run_pending_migrations(SQLITE_MIGRATIONS)
            .map_err(DieselError::QueryBuilderError)?;

        for migration in &applied {
            info!("applied migration: {migration}");
        }
        if applied.is_empty() {
            info!("no pending migrations");
        }

        Ok::<(), DieselError>(())
    })
    .await
    .map_err(|e| StoreError::Database(DieselError::QueryBuilderError(Box::new(e))))??;

    Ok(())
}

/// PostgreSQL migration scripts (embedded at compile time).
#[cfg(feature = "postgres")]
static POSTGRES_MIGRATION_FILES: &[(&str, &str)] = &[(
    "2025-06-01-000000_intent_store",
    include_str!("../../migrations/postgres/2025-06-01-000000_intent_store/up.sql"),
)];

/// Run PostgreSQL migrations via tokio-postgres, tracking applied versions in
/// a `__migrations` table.
#[cfg(feature = "postgres")]
async fn run_postgres_migrations(database_url: &str) -> Result<(), StoreError> {
    use super::util::to_diesel_error;
    use tokio_postgres::NoTls;

    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(to_diesel_error)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("postgres connection error during migration: {e}");
        }
    });

    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS __migrations (
                version TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .await
        .map_err(to_diesel_error)?;

    for (version, sql) in POSTGRES_MIGRATION_FILES {
        let applied = client
            .query_opt("SELECT 1 FROM __migrations WHERE version = $1", &[version])
            .await
            .map_err(to_diesel_error)?;
        if applied.is_some() {
            continue;
        }

        client.batch_execute(sql).await.map_err(to_diesel_error)?;
        client
            .execute("INSERT INTO __migrations (version) VALUES ($1)", &[version])
            .await
            .map_err(to_diesel_error)?;
        info!("applied migration: {version}");
    }

    Ok(())
}
