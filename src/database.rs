use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::Result;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

// Applied in version order; each script runs at most once per database.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_core_tables",
        sql: include_str!("../migrations/001_create_core_tables.sql"),
    },
    Migration {
        version: 2,
        name: "create_indexes",
        sql: include_str!("../migrations/002_create_indexes.sql"),
    },
];

// Fixed advisory-lock key serializing schema bootstrap across processes.
const MIGRATION_LOCK_KEY: i64 = 0x70675f6275735f31;

pub(crate) async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    Ok(pool)
}

/// Idempotent schema bootstrap. The whole run happens inside one
/// transaction holding a transaction-scoped advisory lock, so concurrent
/// processes serialize and a late arrival commits a no-op.
pub(crate) async fn ensure_schema(db: &PgPool) -> Result<()> {
    let mut tx = db.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    for migration in MIGRATIONS {
        let applied = sqlx::query_as::<_, (i32,)>("SELECT version FROM migrations WHERE version = $1")
            .bind(migration.version)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if applied {
            continue;
        }

        info!("applying migration {}: {}", migration.version, migration.name);
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO migrations (version, name, applied_at) VALUES ($1, $2, $3)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
