//! SQL migrations for the run ledger.
//!
//! Applied in order on database open. Each migration has a version number
//! and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: runs, stage_events, diagnostics",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per pipeline run; record_json is the full run.json snapshot
CREATE TABLE IF NOT EXISTS runs (
    run_id       TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    status       TEXT NOT NULL,
    failed_stage TEXT,
    record_json  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

-- Stage transitions
CREATE TABLE IF NOT EXISTS stage_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id        TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    stage         TEXT NOT NULL,
    event         TEXT NOT NULL,
    input_count   INTEGER,
    output_count  INTEGER,
    dropped_count INTEGER,
    filtered_count INTEGER,
    artifact_path TEXT,
    message       TEXT,
    recorded_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stage_events_run ON stage_events(run_id);

-- Per-item and per-entity diagnostics
CREATE TABLE IF NOT EXISTS diagnostics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    stage       TEXT NOT NULL,
    source_ref  TEXT,
    entity      TEXT,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_diagnostics_run ON diagnostics(run_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Transform cache keyed by stage, prompt hash, and model",
            sql: r#"
CREATE TABLE IF NOT EXISTS transform_cache (
    id          TEXT PRIMARY KEY,
    stage       TEXT NOT NULL,
    prompt_hash TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE(stage, prompt_hash, model_id)
);

CREATE INDEX IF NOT EXISTS idx_transform_cache_stage ON transform_cache(stage);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
