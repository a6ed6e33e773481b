//! SQLite schema definition

/// SQL schema for the watch database
pub const SCHEMA_SQL: &str = r#"
-- Targets: tracked sounds and hashtags with their dedup state
CREATE TABLE IF NOT EXISTS targets (
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    title TEXT,
    last_ts INTEGER NOT NULL DEFAULT 0,
    last_ids TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (target_type, target_id)
);

-- Subscriptions: chat <-> target associations
CREATE TABLE IF NOT EXISTS subscriptions (
    chat_id INTEGER NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (chat_id, target_type, target_id)
);

-- Poll runs: per-cycle history per target
CREATE TABLE IF NOT EXISTS poll_runs (
    id TEXT PRIMARY KEY,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    items_fetched INTEGER NOT NULL DEFAULT 0,
    new_items INTEGER NOT NULL DEFAULT 0,
    deliveries_ok INTEGER NOT NULL DEFAULT 0,
    deliveries_failed INTEGER NOT NULL DEFAULT 0,
    error TEXT
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_subscriptions_target ON subscriptions(target_type, target_id);
CREATE INDEX IF NOT EXISTS idx_poll_runs_target ON poll_runs(target_type, target_id);
"#;
