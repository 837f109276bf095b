//! SQLite schema definition.

/// Complete database schema for casesync.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Case Reports (Append-Only - status is the only mutable column)
-- ============================================================================

CREATE TABLE IF NOT EXISTS case_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,        -- never reused, monotonic
    idempotency_key TEXT NOT NULL UNIQUE,        -- UUID sent with every delivery
    facility_id INTEGER NOT NULL CHECK (facility_id > 0),
    date TEXT NOT NULL,                          -- YYYY-MM-DD
    syndrome TEXT NOT NULL,
    count INTEGER NOT NULL CHECK (count > 0),
    age_group TEXT NOT NULL,
    zone TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'synced')),
    created_at TEXT NOT NULL,
    synced_at TEXT
);

-- Status-ordered index: listing pending rows walks it in insertion order
CREATE INDEX IF NOT EXISTS idx_case_reports_status ON case_reports(status, id);

-- Synced is terminal
CREATE TRIGGER IF NOT EXISTS case_reports_status_terminal BEFORE UPDATE OF status ON case_reports
WHEN old.status = 'synced' AND new.status <> 'synced'
BEGIN
    SELECT RAISE(ABORT, 'Synced reports cannot return to pending');
END;

-- Captured content is immutable
CREATE TRIGGER IF NOT EXISTS case_reports_content_immutable BEFORE UPDATE ON case_reports
WHEN new.id IS NOT old.id
    OR new.idempotency_key IS NOT old.idempotency_key
    OR new.facility_id IS NOT old.facility_id
    OR new.date IS NOT old.date
    OR new.syndrome IS NOT old.syndrome
    OR new.count IS NOT old.count
    OR new.age_group IS NOT old.age_group
    OR new.zone IS NOT old.zone
    OR new.created_at IS NOT old.created_at
BEGIN
    SELECT RAISE(ABORT, 'Case report content is immutable');
END;

-- Retention is handled outside this store
CREATE TRIGGER IF NOT EXISTS case_reports_no_delete BEFORE DELETE ON case_reports
BEGIN
    SELECT RAISE(ABORT, 'Case reports are never deleted');
END;

-- ============================================================================
-- Sync State
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Track last successful sync timestamp
INSERT OR IGNORE INTO sync_state (key, value) VALUES ('last_sync_at', '');
"#;
