//! Stage artifacts on disk.
//!
//! Every stage writes one JSON document at a well-known path under the
//! output directory. Writes go to a hidden temp file first and are renamed
//! into place, so readers only ever see a complete artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use newsfeed_shared::{NewsfeedError, PipelineRun, Result, RunId, StageName};

/// Bumped when an artifact layout changes incompatibly.
pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;

/// Latest run record, rewritten after every stage transition.
pub const RUN_RECORD_FILE: &str = "run.json";

/// Rendered report alongside the JSON summary.
pub const REPORT_MARKDOWN_FILE: &str = "summary_report.md";

/// On-disk wrapper around a stage's records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEnvelope<T> {
    pub schema_version: u32,
    pub stage: StageName,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub records: T,
}

/// Reads and writes stage artifacts under one output directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stage: StageName) -> PathBuf {
        self.dir.join(stage.artifact_file())
    }

    pub fn exists(&self, stage: StageName) -> bool {
        self.path_for(stage).is_file()
    }

    /// Atomically replace `stage`'s artifact with `records`.
    #[instrument(skip_all, fields(stage = %stage))]
    pub fn write<T: Serialize>(&self, stage: StageName, run_id: &RunId, records: &T) -> Result<PathBuf> {
        let envelope = ArtifactEnvelope {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            stage,
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            records,
        };
        let json = serde_json::to_string_pretty(&envelope).map_err(|e| {
            NewsfeedError::validation(format!("JSON serialization failed: {e}"))
        })?;

        let path = self.path_for(stage);
        write_atomic(&path, json.as_bytes())?;
        debug!(path = %path.display(), size = json.len(), "wrote artifact");
        Ok(path)
    }

    /// Load `stage`'s artifact. Absent, unparsable, or mismatched files
    /// surface as `ArtifactMissing`.
    pub fn load<T: DeserializeOwned>(&self, stage: StageName) -> Result<ArtifactEnvelope<T>> {
        let path = self.path_for(stage);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NewsfeedError::artifact_missing(stage, &path, "file not found"));
            }
            Err(e) => {
                return Err(NewsfeedError::artifact_missing(stage, &path, e.to_string()));
            }
        };

        let envelope: ArtifactEnvelope<T> = serde_json::from_str(&content).map_err(|e| {
            NewsfeedError::artifact_missing(stage, &path, format!("unparsable: {e}"))
        })?;

        if envelope.stage != stage {
            return Err(NewsfeedError::artifact_missing(
                stage,
                &path,
                format!("file belongs to stage {}", envelope.stage),
            ));
        }
        if envelope.schema_version != ARTIFACT_SCHEMA_VERSION {
            return Err(NewsfeedError::artifact_missing(
                stage,
                &path,
                format!(
                    "schema version {} (expected {ARTIFACT_SCHEMA_VERSION})",
                    envelope.schema_version
                ),
            ));
        }
        Ok(envelope)
    }

    /// Atomically write a free-form text file (e.g. the Markdown report).
    pub fn write_text(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.join(file_name);
        write_atomic(&path, content.as_bytes())?;
        debug!(path = %path.display(), "wrote text artifact");
        Ok(path)
    }

    /// Atomically rewrite `run.json`.
    pub fn write_run(&self, run: &PipelineRun) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(run).map_err(|e| {
            NewsfeedError::validation(format!("JSON serialization failed: {e}"))
        })?;
        let path = self.dir.join(RUN_RECORD_FILE);
        write_atomic(&path, json.as_bytes())?;
        Ok(path)
    }

    /// The last run recorded in this output directory, if any.
    pub fn load_run(&self) -> Result<Option<PipelineRun>> {
        let path = self.dir.join(RUN_RECORD_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| NewsfeedError::io(&path, e))?;
        let run = serde_json::from_str(&content)
            .map_err(|e| NewsfeedError::validation(format!("invalid {RUN_RECORD_FILE}: {e}")))?;
        Ok(Some(run))
    }
}

/// Write to `.{name}.tmp` beside `path`, then rename over it.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| NewsfeedError::io(dir, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NewsfeedError::validation(format!("invalid artifact path {path:?}")))?;
    let temp = dir.join(format!(".{file_name}.tmp"));

    std::fs::write(&temp, bytes).map_err(|e| NewsfeedError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| NewsfeedError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsfeed_shared::{ArticleRef, Entity, SearchResult, StageStats};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "newsfeed-artifacts-test-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_results() -> Vec<SearchResult> {
        vec![SearchResult::succeeded(
            Entity::new("Anna Keller").with_attribute("country", "Germany"),
            vec![ArticleRef {
                url: "https://news.example.com/a".into(),
                title: "Budget vote".into(),
                snippet: "".into(),
                published_at: None,
                source_rank: Some(1),
            }],
        )]
    }

    #[test]
    fn write_then_load() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp);
        let run_id = RunId::new();

        let path = store
            .write(StageName::Search, &run_id, &sample_results())
            .unwrap();
        assert_eq!(path, tmp.join("search_results.json"));
        assert!(store.exists(StageName::Search));
        assert!(!tmp.join(".search_results.json.tmp").exists());

        let loaded: ArtifactEnvelope<Vec<SearchResult>> = store.load(StageName::Search).unwrap();
        assert_eq!(loaded.run_id, run_id.to_string());
        assert_eq!(loaded.records, sample_results());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_artifact_is_reported() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp);

        let err = store
            .load::<Vec<SearchResult>>(StageName::Search)
            .unwrap_err();
        assert_eq!(err.kind(), "artifact_missing");
        assert!(err.to_string().contains("file not found"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn truncated_artifact_is_missing() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp);
        std::fs::write(tmp.join("filtered_items.json"), "{\"schema_version\": 1, \"sta").unwrap();

        let err = store
            .load::<Vec<serde_json::Value>>(StageName::Filter)
            .unwrap_err();
        assert_eq!(err.kind(), "artifact_missing");
        assert!(err.to_string().contains("unparsable"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn wrong_stage_is_rejected() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp);
        store
            .write(StageName::Search, &RunId::new(), &sample_results())
            .unwrap();
        std::fs::copy(tmp.join("search_results.json"), tmp.join("filtered_items.json")).unwrap();

        let err = store
            .load::<Vec<serde_json::Value>>(StageName::Filter)
            .unwrap_err();
        assert!(err.to_string().contains("belongs to stage search"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn overwrite_replaces_whole_artifact() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp);
        let run_id = RunId::new();

        store.write(StageName::Search, &run_id, &sample_results()).unwrap();
        store
            .write(StageName::Search, &run_id, &Vec::<SearchResult>::new())
            .unwrap();

        let loaded: ArtifactEnvelope<Vec<SearchResult>> = store.load(StageName::Search).unwrap();
        assert!(loaded.records.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn run_record_roundtrip() {
        let tmp = temp_dir();
        let store = ArtifactStore::new(&tmp);
        assert!(store.load_run().unwrap().is_none());

        let mut run = PipelineRun::new();
        run.begin(StageName::Search).unwrap();
        run.commit(
            StageName::Search,
            store.path_for(StageName::Search),
            StageStats::default(),
        );
        store.write_run(&run).unwrap();

        let loaded = store.load_run().unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.stages_completed, vec![StageName::Search]);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
