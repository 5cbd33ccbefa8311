//! Own-store schema and additive migrations.

use rusqlite::Connection;

use super::StoreError;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 2;

pub fn user_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the database up to [`SCHEMA_VERSION`]. Never drops tables or rows.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let from = user_version(conn)?;
    if from > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "database schema version {} is newer than supported {}",
            from, SCHEMA_VERSION
        )));
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS job_registry (
            job_id TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_cache (
            job_id TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        );",
    )?;

    // v2: row modification time on both stores.
    for table in ["job_registry", "execution_cache"] {
        if !has_column(conn, table, "updated_at")? {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN updated_at TEXT", table),
                [],
            )?;
        }
    }

    if from != SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        tracing::info!(from, to = SCHEMA_VERSION, "migrated own store schema");
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
