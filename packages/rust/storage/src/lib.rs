//! libSQL run ledger (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database holding run history,
//! stage transitions, diagnostics, and the transform cache. Stage artifacts
//! themselves live on disk; the ledger only points at them.
//!
//! **Access rules:**
//! - `newsfeed run`: read-write via [`Storage::open`]
//! - `newsfeed status`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use newsfeed_shared::{Diagnostic, NewsfeedError, PipelineRun, Result, StageName, StageStats};

/// Kind of stage transition recorded in `stage_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEventKind {
    Started,
    Committed,
    Failed,
}

impl StageEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

/// A `stage_events` row.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEventRecord {
    pub stage: String,
    pub event: String,
    pub stats: Option<StageStats>,
    pub artifact_path: Option<String>,
    pub message: Option<String>,
    pub recorded_at: String,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> NewsfeedError {
    NewsfeedError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| NewsfeedError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(NewsfeedError::Storage(format!(
                "ledger not found at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        NewsfeedError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(NewsfeedError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Insert or replace the snapshot of a run.
    pub async fn upsert_run(&self, run: &PipelineRun) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(run).map_err(storage_err)?;
        let failed_stage = match &run.status {
            newsfeed_shared::RunStatus::Failed { stage, .. } => Some(stage.as_str()),
            _ => None,
        };
        self.conn
            .execute(
                "INSERT INTO runs (run_id, started_at, updated_at, status, failed_stage, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id) DO UPDATE SET
                   updated_at = excluded.updated_at,
                   status = excluded.status,
                   failed_stage = excluded.failed_stage,
                   record_json = excluded.record_json",
                params![
                    run.run_id.to_string(),
                    run.started_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                    status_label(run),
                    failed_stage,
                    record_json,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Load a run snapshot by id.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM runs WHERE run_id = ?1",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// The most recently started run, if any.
    pub async fn latest_run(&self) -> Result<Option<PipelineRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM runs ORDER BY started_at DESC, run_id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List recent runs. Returns `Vec<(run_id, status, started_at)>`, newest first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<(String, String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, status, started_at FROM runs
                 ORDER BY started_at DESC, run_id DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
                row.get::<String>(2).map_err(storage_err)?,
            ));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Stage events
    // -----------------------------------------------------------------------

    /// Record a stage transition.
    pub async fn insert_stage_event(
        &self,
        run_id: &str,
        stage: StageName,
        event: StageEventKind,
        stats: Option<&StageStats>,
        artifact_path: Option<&Path>,
        message: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let artifact = artifact_path.map(|p| p.display().to_string());
        self.conn
            .execute(
                "INSERT INTO stage_events
                   (run_id, stage, event, input_count, output_count, dropped_count,
                    filtered_count, artifact_path, message, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    stage.as_str(),
                    event.as_str(),
                    stats.map(|s| s.input as i64),
                    stats.map(|s| s.output as i64),
                    stats.map(|s| s.dropped as i64),
                    stats.map(|s| s.filtered as i64),
                    artifact,
                    message,
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Stage transitions for a run, in insertion order.
    pub async fn list_stage_events(&self, run_id: &str) -> Result<Vec<StageEventRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage, event, input_count, output_count, dropped_count, filtered_count,
                        artifact_path, message, recorded_at
                 FROM stage_events WHERE run_id = ?1 ORDER BY id",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let counts = (
                row.get::<i64>(2).ok(),
                row.get::<i64>(3).ok(),
                row.get::<i64>(4).ok(),
                row.get::<i64>(5).ok(),
            );
            let stats = match counts {
                (Some(input), Some(output), Some(dropped), Some(filtered)) => Some(StageStats {
                    input: input as usize,
                    output: output as usize,
                    dropped: dropped as usize,
                    filtered: filtered as usize,
                }),
                _ => None,
            };
            results.push(StageEventRecord {
                stage: row.get::<String>(0).map_err(storage_err)?,
                event: row.get::<String>(1).map_err(storage_err)?,
                stats,
                artifact_path: row.get::<String>(6).ok(),
                message: row.get::<String>(7).ok(),
                recorded_at: row.get::<String>(8).map_err(storage_err)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Append diagnostics for a run.
    pub async fn insert_diagnostics(&self, run_id: &str, diagnostics: &[Diagnostic]) -> Result<()> {
        self.check_writable()?;
        for d in diagnostics {
            self.conn
                .execute(
                    "INSERT INTO diagnostics (run_id, stage, source_ref, entity, kind, message, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        run_id,
                        d.stage.as_str(),
                        d.source_ref.as_deref(),
                        d.entity.as_deref(),
                        d.kind.as_str(),
                        d.message.as_str(),
                        d.recorded_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Diagnostics for a run, in insertion order.
    pub async fn list_diagnostics(&self, run_id: &str) -> Result<Vec<Diagnostic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage, source_ref, entity, kind, message, recorded_at
                 FROM diagnostics WHERE run_id = ?1 ORDER BY id",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let stage: String = row.get(0).map_err(storage_err)?;
            let recorded_at: String = row.get(5).map_err(storage_err)?;
            results.push(Diagnostic {
                stage: stage.parse::<StageName>().map_err(storage_err)?,
                source_ref: row.get::<String>(1).ok(),
                entity: row.get::<String>(2).ok(),
                kind: row.get::<String>(3).map_err(storage_err)?,
                message: row.get::<String>(4).map_err(storage_err)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(storage_err)?
                    .with_timezone(&Utc),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Transform cache
    // -----------------------------------------------------------------------

    /// Get a cached transform result.
    pub async fn get_transform_cache(
        &self,
        stage: &str,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM transform_cache
                 WHERE stage = ?1 AND prompt_hash = ?2 AND model_id = ?3",
                params![stage, prompt_hash, model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let result: String = row.get(0).map_err(storage_err)?;
                Ok(Some(result))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store a transform result in the cache (upserts).
    pub async fn set_transform_cache(
        &self,
        stage: &str,
        prompt_hash: &str,
        model_id: &str,
        result_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO transform_cache (id, stage, prompt_hash, model_id, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(stage, prompt_hash, model_id) DO UPDATE SET
                   result_json = excluded.result_json,
                   created_at = excluded.created_at",
                params![id.as_str(), stage, prompt_hash, model_id, result_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drop every cached result for a stage; returns how many went.
    pub async fn invalidate_transform_cache(&self, stage: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM transform_cache WHERE stage = ?1",
                params![stage],
            )
            .await
            .map_err(storage_err)
    }
}

fn status_label(run: &PipelineRun) -> &'static str {
    match run.status {
        newsfeed_shared::RunStatus::NotStarted => "not_started",
        newsfeed_shared::RunStatus::Running { .. } => "running",
        newsfeed_shared::RunStatus::Completed => "completed",
        newsfeed_shared::RunStatus::Failed { .. } => "failed",
    }
}

fn row_to_run(row: &libsql::Row) -> Result<PipelineRun> {
    let json: String = row.get(0).map_err(storage_err)?;
    serde_json::from_str(&json).map_err(storage_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("newsfeed_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("newsfeed_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.unwrap();
        drop(_s1);
        let s2 = Storage::open(&tmp).await.unwrap();
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn run_snapshot_roundtrip() {
        let storage = test_storage().await;
        assert!(storage.latest_run().await.unwrap().is_none());

        let mut run = PipelineRun::new();
        run.begin(StageName::Search).unwrap();
        storage.upsert_run(&run).await.unwrap();

        run.commit(
            StageName::Search,
            PathBuf::from("output/search_results.json"),
            StageStats {
                input: 3,
                output: 3,
                dropped: 0,
                filtered: 0,
            },
        );
        run.fail(StageName::Filter, "no items survived");
        storage.upsert_run(&run).await.unwrap();

        let latest = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(latest.run_id, run.run_id);
        assert_eq!(latest.status, run.status);
        assert_eq!(latest.stages_completed, vec![StageName::Search]);

        let runs = storage.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1, "failed");

        let by_id = storage.get_run(&run.run_id.to_string()).await.unwrap();
        assert!(by_id.is_some());
        assert!(storage.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stage_events_and_diagnostics() {
        let storage = test_storage().await;
        let run = PipelineRun::new();
        let run_id = run.run_id.to_string();
        storage.upsert_run(&run).await.unwrap();

        storage
            .insert_stage_event(&run_id, StageName::Filter, StageEventKind::Started, None, None, None)
            .await
            .unwrap();
        let stats = StageStats {
            input: 5,
            output: 2,
            dropped: 1,
            filtered: 2,
        };
        storage
            .insert_stage_event(
                &run_id,
                StageName::Filter,
                StageEventKind::Committed,
                Some(&stats),
                Some(Path::new("output/filtered_items.json")),
                None,
            )
            .await
            .unwrap();

        let events = storage.list_stage_events(&run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "started");
        assert!(events[0].stats.is_none());
        assert_eq!(events[1].stats, Some(stats));
        assert_eq!(
            events[1].artifact_path.as_deref(),
            Some("output/filtered_items.json")
        );

        let diags = vec![
            Diagnostic::new(StageName::Filter, "validation_error", "score 42 out of range")
                .for_source("abcd1234abcd1234", "Anna Keller"),
            Diagnostic::new(StageName::Search, "provider_error", "503").for_entity("Luca Bianchi"),
        ];
        storage.insert_diagnostics(&run_id, &diags).await.unwrap();
        let loaded = storage.list_diagnostics(&run_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].source_ref.as_deref(), Some("abcd1234abcd1234"));
        assert_eq!(loaded[1].stage, StageName::Search);
        assert_eq!(loaded[1].entity.as_deref(), Some("Luca Bianchi"));
    }

    #[tokio::test]
    async fn transform_cache() {
        let storage = test_storage().await;

        let miss = storage
            .get_transform_cache("filter", "hash1", "gpt-4o-mini")
            .await
            .unwrap();
        assert!(miss.is_none());

        storage
            .set_transform_cache("filter", "hash1", "gpt-4o-mini", r#"{"score": 7}"#)
            .await
            .unwrap();
        storage
            .set_transform_cache("filter", "hash1", "gpt-4o-mini", r#"{"score": 8}"#)
            .await
            .unwrap();

        let hit = storage
            .get_transform_cache("filter", "hash1", "gpt-4o-mini")
            .await
            .unwrap();
        assert_eq!(hit.as_deref(), Some(r#"{"score": 8}"#));

        // Different model is a different key
        assert!(storage
            .get_transform_cache("filter", "hash1", "other-model")
            .await
            .unwrap()
            .is_none());

        storage
            .set_transform_cache("enrich", "hash1", "gpt-4o-mini", r#"{"theme": "x"}"#)
            .await
            .unwrap();
        assert_eq!(storage.invalidate_transform_cache("filter").await.unwrap(), 1);
        assert!(storage
            .get_transform_cache("enrich", "hash1", "gpt-4o-mini")
            .await
            .unwrap()
            .is_some());
        assert!(storage
            .get_transform_cache("filter", "hash1", "gpt-4o-mini")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("newsfeed_test_{}.db", Uuid::now_v7()));
        {
            let _rw = Storage::open(&tmp).await.unwrap();
        }
        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.upsert_run(&PipelineRun::new()).await;
        assert!(result.is_err());
        assert!(ro.latest_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readonly_missing_ledger_is_error() {
        let tmp = std::env::temp_dir().join(format!("newsfeed_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
