//! Core domain types flowing through the pipeline.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{NewsfeedError, Result};

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// One phase of the linear pipeline. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Search,
    Filter,
    Enrich,
    Summarize,
    Deliver,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [StageName; 5] = [
        StageName::Search,
        StageName::Filter,
        StageName::Enrich,
        StageName::Summarize,
        StageName::Deliver,
    ];

    /// Stages backed by the transformation service.
    pub const TRANSFORMS: [StageName; 3] =
        [StageName::Filter, StageName::Enrich, StageName::Summarize];

    pub fn is_transform(&self) -> bool {
        Self::TRANSFORMS.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Filter => "filter",
            Self::Enrich => "enrich",
            Self::Summarize => "summarize",
            Self::Deliver => "deliver",
        }
    }

    /// The stage whose artifact this stage consumes. `Search` reads the
    /// entity list instead.
    pub fn predecessor(&self) -> Option<StageName> {
        match self {
            Self::Search => None,
            Self::Filter => Some(Self::Search),
            Self::Enrich => Some(Self::Filter),
            Self::Summarize => Some(Self::Enrich),
            Self::Deliver => Some(Self::Summarize),
        }
    }

    /// Well-known artifact file name inside the output directory.
    pub fn artifact_file(&self) -> &'static str {
        match self {
            Self::Search => "search_results.json",
            Self::Filter => "filtered_items.json",
            Self::Enrich => "enriched_items.json",
            Self::Summarize => "summary_report.json",
            Self::Deliver => "delivery_receipt.json",
        }
    }

    /// This stage and every stage after it, in order.
    pub fn through_end(self) -> Vec<StageName> {
        Self::ALL.into_iter().filter(|s| *s >= self).collect()
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = NewsfeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "filter" => Ok(Self::Filter),
            "enrich" => Ok(Self::Enrich),
            "summarize" | "summary" => Ok(Self::Summarize),
            "deliver" | "delivery" | "email" => Ok(Self::Deliver),
            other => Err(NewsfeedError::config(format!(
                "unknown stage '{other}': expected search, filter, enrich, summarize, or deliver"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A tracked subject. Identity is `name` (case-sensitive).
///
/// Serialized flat: `{"name": "Jane Doe", "country": "Germany"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attribute lookup; `name` resolves to the entity name.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        if key == "name" {
            return Some(&self.name);
        }
        self.attributes.get(key).map(String::as_str)
    }
}

/// Reject empty lists, blank names, and duplicate names.
pub fn validate_entities(entities: &[Entity]) -> Result<()> {
    if entities.is_empty() {
        return Err(NewsfeedError::config("entity list is empty"));
    }
    let mut seen = HashSet::new();
    for (i, entity) in entities.iter().enumerate() {
        if entity.name.trim().is_empty() {
            return Err(NewsfeedError::config(format!(
                "entity #{i} has an empty name"
            )));
        }
        if !seen.insert(entity.name.as_str()) {
            return Err(NewsfeedError::config(format!(
                "duplicate entity name '{}'",
                entity.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Search output
// ---------------------------------------------------------------------------

/// A single article returned by the search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRef {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rank: Option<u32>,
}

/// A captured per-entity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&NewsfeedError> for ErrorInfo {
    fn from(err: &NewsfeedError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of searching one entity. Without `error`, `items` is
/// authoritative (possibly empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub entity: Entity,
    #[serde(default)]
    pub items: Vec<ArticleRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl SearchResult {
    pub fn succeeded(entity: Entity, items: Vec<ArticleRef>) -> Self {
        Self {
            entity,
            items,
            error: None,
        }
    }

    pub fn failed(entity: Entity, error: &NewsfeedError) -> Self {
        Self {
            entity,
            items: Vec::new(),
            error: Some(ErrorInfo::from(error)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// StageItem
// ---------------------------------------------------------------------------

/// Provenance of a stage item: the originating entity and article.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// Opaque id, SHA-256 over entity name and article URL (16 hex chars).
    pub id: String,
    pub entity: String,
    pub url: String,
}

impl SourceRef {
    pub fn new(entity: &str, url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entity.as_bytes());
        hasher.update([0u8]);
        hasher.update(url.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self {
            id: digest[..16].to_string(),
            entity: entity.to_string(),
            url: url.to_string(),
        }
    }

    /// Stable key the summary uses to cite this source.
    pub fn citation_key(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// Envelope threading provenance through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageItem<T> {
    pub source_ref: SourceRef,
    pub payload: T,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_metadata: BTreeMap<String, serde_json::Value>,
}

impl<T> StageItem<T> {
    pub fn new(source_ref: SourceRef, payload: T) -> Self {
        Self {
            source_ref,
            payload,
            stage_metadata: BTreeMap::new(),
        }
    }

    /// Emit the next stage's item from this one. Provenance and metadata
    /// carry over unchanged.
    pub fn derive<U>(&self, payload: U) -> StageItem<U> {
        StageItem {
            source_ref: self.source_ref.clone(),
            payload,
            stage_metadata: self.stage_metadata.clone(),
        }
    }
}

/// Every item in a collection must come from a distinct source.
pub fn ensure_unique_sources<T>(items: &[StageItem<T>]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item.source_ref.id.as_str()) {
            return Err(NewsfeedError::validation(format!(
                "duplicate source_ref {} ({})",
                item.source_ref.id, item.source_ref.url
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// Relevance score in `[0, 10]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self> {
        if value > Self::MAX {
            return Err(NewsfeedError::validation(format!(
                "score {value} out of range 0..=10"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn passes(&self, threshold: u8) -> bool {
        self.0 >= threshold
    }
}

impl TryFrom<i64> for Score {
    type Error = NewsfeedError;

    fn try_from(value: i64) -> Result<Self> {
        let v = u8::try_from(value).map_err(|_| {
            NewsfeedError::validation(format!("score {value} out of range 0..=10"))
        })?;
        Self::new(v)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> u8 {
        score.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stage payloads
// ---------------------------------------------------------------------------

/// Filter input: one article attributed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleItem {
    pub entity: String,
    #[serde(flatten)]
    pub article: ArticleRef,
}

/// Filter output: the article plus its relevance verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredArticle {
    #[serde(flatten)]
    pub article: ArticleItem,
    pub score: Score,
    pub inclusion_reason: String,
}

/// Background gathered by the enrich stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsContext {
    pub theme: String,
    pub background: String,
    pub significance: String,
    pub collaboration_angles: String,
}

/// Enrich output: the scored article plus context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedArticle {
    #[serde(flatten)]
    pub scored: ScoredArticle,
    pub context: NewsContext,
}

impl EnrichedArticle {
    pub fn entity(&self) -> &str {
        &self.scored.article.entity
    }

    pub fn article(&self) -> &ArticleRef {
        &self.scored.article.article
    }
}

// ---------------------------------------------------------------------------
// Summary and delivery documents
// ---------------------------------------------------------------------------

/// One cited source in the summary report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub key: String,
    pub entity: String,
    pub title: String,
    pub url: String,
}

/// Per-entity section of the summary report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    pub entity: String,
    pub headline: String,
    pub body: String,
    #[serde(default)]
    pub citations: Vec<String>,
}

/// The composed, many-to-one output of the summarize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub date_range: String,
    pub title: String,
    pub overview: String,
    pub sections: Vec<ReportSection>,
    pub citations: Vec<Citation>,
}

impl SummaryReport {
    /// Entities the report actually cites, in citation-table order.
    pub fn cited_entities(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for c in &self.citations {
            if !out.contains(&c.entity.as_str()) {
                out.push(&c.entity);
            }
        }
        out
    }
}

/// Proof that the delivery provider accepted the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub delivered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_and_predecessors() {
        assert!(StageName::Search < StageName::Filter);
        assert!(StageName::Summarize < StageName::Deliver);
        assert_eq!(StageName::Enrich.predecessor(), Some(StageName::Filter));
        assert_eq!(StageName::Search.predecessor(), None);
        assert_eq!(
            StageName::Enrich.through_end(),
            vec![StageName::Enrich, StageName::Summarize, StageName::Deliver]
        );
    }

    #[test]
    fn stage_name_parses_aliases() {
        assert_eq!("Email".parse::<StageName>().unwrap(), StageName::Deliver);
        assert_eq!("summary".parse::<StageName>().unwrap(), StageName::Summarize);
        assert!("analyze".parse::<StageName>().is_err());
    }

    #[test]
    fn entity_serializes_flat() {
        let entity = Entity::new("Jane Doe").with_attribute("country", "Germany");
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["name"], "Jane Doe");
        assert_eq!(json["country"], "Germany");

        let parsed: Entity =
            serde_json::from_str(r#"{"name": "Jan Novak", "country": "Czechia"}"#).unwrap();
        assert_eq!(parsed.attribute("country"), Some("Czechia"));
        assert_eq!(parsed.attribute("name"), Some("Jan Novak"));
    }

    #[test]
    fn entity_validation_rejects_duplicates_and_blanks() {
        let ok = vec![Entity::new("A"), Entity::new("a")];
        assert!(validate_entities(&ok).is_ok());

        let dup = vec![Entity::new("A"), Entity::new("A")];
        assert!(validate_entities(&dup)
            .unwrap_err()
            .to_string()
            .contains("duplicate"));

        assert!(validate_entities(&[Entity::new("  ")]).is_err());
        assert!(validate_entities(&[]).is_err());
    }

    #[test]
    fn score_bounds() {
        assert!(Score::new(10).is_ok());
        assert!(Score::new(11).is_err());
        assert!(serde_json::from_str::<Score>("-1").is_err());
        assert!(serde_json::from_str::<Score>("12").is_err());
        let s: Score = serde_json::from_str("6").unwrap();
        assert!(s.passes(6));
        assert!(!s.passes(7));
        assert_eq!(serde_json::to_string(&s).unwrap(), "6");
    }

    #[test]
    fn source_ref_is_stable() {
        let a = SourceRef::new("Jane Doe", "https://news.example.com/a");
        let b = SourceRef::new("Jane Doe", "https://news.example.com/a");
        let c = SourceRef::new("John Roe", "https://news.example.com/a");
        assert_eq!(a, b);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 16);
        assert_eq!(a.citation_key().len(), 8);
        assert!(a.id.starts_with(a.citation_key()));
    }

    #[test]
    fn derive_threads_provenance() {
        let mut item = StageItem::new(SourceRef::new("E", "https://x.test/1"), 1u32);
        item.stage_metadata
            .insert("filter_model".into(), serde_json::json!("m"));
        let next = item.derive("one".to_string());
        assert_eq!(next.source_ref, item.source_ref);
        assert_eq!(next.stage_metadata, item.stage_metadata);
    }

    #[test]
    fn duplicate_sources_rejected() {
        let r = SourceRef::new("E", "https://x.test/1");
        let items = vec![StageItem::new(r.clone(), 1), StageItem::new(r, 2)];
        assert!(ensure_unique_sources(&items).is_err());
    }

    #[test]
    fn enriched_article_roundtrips_flattened() {
        let item = EnrichedArticle {
            scored: ScoredArticle {
                article: ArticleItem {
                    entity: "Jane Doe".into(),
                    article: ArticleRef {
                        url: "https://news.example.com/a".into(),
                        title: "Vote on budget".into(),
                        snippet: "".into(),
                        published_at: None,
                        source_rank: Some(1),
                    },
                },
                score: Score::new(8).unwrap(),
                inclusion_reason: "policy".into(),
            },
            context: NewsContext {
                theme: "budget".into(),
                background: "b".into(),
                significance: "s".into(),
                collaboration_angles: "c".into(),
            },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["entity"], "Jane Doe");
        assert_eq!(json["score"], 8);
        assert_eq!(json["url"], "https://news.example.com/a");
        let back: EnrichedArticle = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn flattened_score_still_validated() {
        let json = serde_json::json!({
            "entity": "E", "url": "https://x.test", "title": "t",
            "score": 42, "inclusion_reason": "r"
        });
        assert!(serde_json::from_value::<ScoredArticle>(json).is_err());
    }
}
