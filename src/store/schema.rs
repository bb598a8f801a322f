//! Versioned schema for the conversation store.
//!
//! The on-disk layout is three logical tables (sessions, messages, facts)
//! plus `schema_meta`, a key/value marker table carrying `schema_version`.
//! Migrations are plain SQL scripts applied in order inside one transaction;
//! the engine snapshots the file before upgrading a non-empty database.

use deadpool_sqlite::rusqlite::{self, params, Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA_META_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);";

/// v1: base tables as the first release shipped them.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        position BIGINT NOT NULL,
        created_at BIGINT NOT NULL,
        UNIQUE(session_id, position)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session_position
        ON messages(session_id, position);

    CREATE TABLE IF NOT EXISTS facts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        category TEXT NOT NULL,
        value TEXT NOT NULL,
        created_at BIGINT NOT NULL
    );
";

/// v2: fact provenance, confidence, and the single-valued-category invariant.
const MIGRATION_V2: &str = "
    ALTER TABLE facts ADD COLUMN session_id INTEGER;
    ALTER TABLE facts ADD COLUMN message_id INTEGER;
    ALTER TABLE facts ADD COLUMN confidence REAL;
    ALTER TABLE facts ADD COLUMN updated_at BIGINT NOT NULL DEFAULT 0;
    UPDATE facts SET updated_at = created_at WHERE updated_at = 0;

    CREATE UNIQUE INDEX IF NOT EXISTS facts_single_valued
        ON facts(category) WHERE category IN ('name', 'location', 'age');
";

const MIGRATIONS: [&str; SCHEMA_VERSION as usize] = [MIGRATION_V1, MIGRATION_V2];

/// Per-connection tuning. `foreign_keys` is connection-scoped in SQLite, so
/// every pooled connection runs this before doing work.
pub fn tune_connection(conn: &Connection, busy_timeout_ms: u32) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {busy_timeout_ms}; PRAGMA foreign_keys = ON;"
    ))
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.execute_batch(SCHEMA_META_SQL)?;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|raw| raw.parse().ok()).unwrap_or(0))
}

/// Applies all migrations past `from` in a single transaction and stamps the
/// new version. Returns the version the database now carries.
pub fn apply_migrations(conn: &mut Connection, from: i64) -> rusqlite::Result<i64> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    for (index, step) in MIGRATIONS.iter().enumerate() {
        let target = index as i64 + 1;
        if target <= from {
            continue;
        }
        tx.execute_batch(step)?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    Ok(SCHEMA_VERSION)
}
