//! SQLite schema and migrations for the fact store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL lets the L1 and L2 handles read while a batch writes
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = get_schema_version(conn).unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }
    if current_version < 2 {
        apply_v2_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // One row per (fact, tier): a promoted fact lives in both L1 and L2
    conn.execute(
        "CREATE TABLE IF NOT EXISTS facts (
            id TEXT NOT NULL,
            tier INTEGER NOT NULL,
            scope TEXT NOT NULL,
            text TEXT NOT NULL,
            subject TEXT,
            predicate TEXT,
            object TEXT,
            certainty REAL NOT NULL,
            impact REAL NOT NULL,
            criticality REAL NOT NULL,
            ciar_score REAL,
            created_at TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            superseded_by TEXT,
            source_ref TEXT,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            promoted_at TEXT,
            PRIMARY KEY (id, tier)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_facts_scope ON facts(tier, scope)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_facts_valid_from ON facts(valid_from)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at, id)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Apply version 2 schema: when promotion last scored a fact.
fn apply_v2_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute("ALTER TABLE facts ADD COLUMN scored_at TEXT", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='facts'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
