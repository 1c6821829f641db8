//! `SQLite` schema definitions for viewcounter.

/// SQL statement to create the counters table.
///
/// `count` can only move through the atomic upsert in
/// [`INCREMENT_COUNTER`], so the check constraint is the last line of
/// defence against a negative tally.
pub const CREATE_COUNTERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS counters (
    page_id TEXT PRIMARY KEY NOT NULL,
    count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
    created_at TEXT NOT NULL,
    updated_at TEXT
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[CREATE_COUNTERS_TABLE, CREATE_METADATA_TABLE];

/// Create a counter unless one already exists for the page.
pub const INSERT_COUNTER_IF_ABSENT: &str = r"
INSERT INTO counters (page_id, count, created_at, updated_at)
VALUES (?1, ?2, ?3, ?3)
ON CONFLICT(page_id) DO NOTHING
";

/// Add one to a counter in a single statement, creating it at one if absent.
pub const INCREMENT_COUNTER: &str = r"
INSERT INTO counters (page_id, count, created_at, updated_at)
VALUES (?1, 1, ?2, ?2)
ON CONFLICT(page_id) DO UPDATE SET
    count = count + 1,
    updated_at = excluded.updated_at
RETURNING page_id, count, updated_at
";

/// Read one counter.
pub const SELECT_COUNTER: &str = r"
SELECT page_id, count, updated_at FROM counters WHERE page_id = ?1
";

/// Read every counter.
pub const SELECT_ALL_COUNTERS: &str = r"
SELECT page_id, count, updated_at FROM counters ORDER BY page_id
";
