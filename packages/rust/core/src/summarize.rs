//! Many-to-one summary: the whole enriched collection in, one cited
//! report out.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use newsfeed_shared::{
    Citation, EnrichedArticle, NewsfeedError, ReportSection, Result, RunId, StageItem, StageName,
    SummaryReport,
};

use crate::context::RunContext;
use crate::stage::{StageProcessor, Validate, require_text};
use crate::transform::TransformRequest;

/// What the service returns: the report minus everything we can fill in
/// ourselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryDraft {
    pub title: String,
    pub overview: String,
    pub sections: Vec<ReportSection>,
}

impl Validate for SummaryDraft {
    fn validate(&self) -> Result<()> {
        require_text("title", &self.title)?;
        require_text("overview", &self.overview)?;
        if self.sections.is_empty() {
            return Err(NewsfeedError::validation("summary has no sections"));
        }
        for (i, section) in self.sections.iter().enumerate() {
            require_text(&format!("sections[{i}].entity"), &section.entity)?;
            require_text(&format!("sections[{i}].headline"), &section.headline)?;
            require_text(&format!("sections[{i}].body"), &section.body)?;
        }
        Ok(())
    }
}

pub struct Summarizer {
    pub context: RunContext,
}

impl Summarizer {
    pub fn new(context: RunContext) -> Self {
        Self { context }
    }

    pub fn instructions(&self) -> String {
        format!(
            "You write a news digest for a policy team covering {range}. \
             Focus areas: {focus}.\n\
             The user message lists enriched articles, each with a citation key. \
             Write one section per entity that has noteworthy coverage. Cite \
             articles only by the keys given; do not invent keys or entities.\n\
             Respond with a JSON object only: \
             {{\"title\": \"...\", \"overview\": \"<2-3 sentences>\", \
             \"sections\": [{{\"entity\": \"<entity name>\", \"headline\": \"...\", \
             \"body\": \"<one paragraph>\", \"citations\": [\"<key>\"]}}]}}",
            range = self.context.date_range(),
            focus = self.context.focus_areas,
        )
    }

    pub fn payload(&self, items: &[StageItem<EnrichedArticle>]) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                let enriched = &item.payload;
                serde_json::json!({
                    "key": item.source_ref.citation_key(),
                    "entity": enriched.entity(),
                    "title": enriched.article().title,
                    "snippet": enriched.article().snippet,
                    "score": enriched.scored.score,
                    "context": enriched.context,
                })
            })
            .collect();
        serde_json::json!({
            "date_range": self.context.date_range(),
            "items": entries,
        })
    }

    /// One transform call over the whole collection. Any failure here
    /// fails the stage; there is no per-item fallback for a single document.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn summarize(
        &self,
        processor: &StageProcessor,
        run_id: &RunId,
        items: &[StageItem<EnrichedArticle>],
    ) -> Result<SummaryReport> {
        if items.is_empty() {
            return Err(NewsfeedError::validation("nothing to summarize"));
        }

        citation_index(items)?;

        let request = TransformRequest {
            stage: StageName::Summarize,
            instructions: self.instructions(),
            payload: self.payload(items),
        };
        let draft: SummaryDraft = processor.request(&request).await?;
        let report = build_report(draft, items, run_id, &self.context.date_range())?;

        info!(
            sections = report.sections.len(),
            citations = report.citations.len(),
            "summary composed"
        );
        Ok(report)
    }
}

/// Input items by citation key. Two items sharing a key could not be told
/// apart in the report, so that is rejected.
fn citation_index(
    items: &[StageItem<EnrichedArticle>],
) -> Result<HashMap<&str, &StageItem<EnrichedArticle>>> {
    let mut by_key = HashMap::with_capacity(items.len());
    for item in items {
        let key = item.source_ref.citation_key();
        if let Some(other) = by_key.insert(key, item) {
            return Err(NewsfeedError::validation(format!(
                "citation key '{key}' shared by {} and {}",
                other.source_ref.url, item.source_ref.url
            )));
        }
    }
    Ok(by_key)
}

/// Check the draft against its input and attach the citation table, in
/// first-reference order.
pub fn build_report(
    draft: SummaryDraft,
    items: &[StageItem<EnrichedArticle>],
    run_id: &RunId,
    date_range: &str,
) -> Result<SummaryReport> {
    let by_key = citation_index(items)?;
    let entities: BTreeSet<&str> = items.iter().map(|i| i.payload.entity()).collect();

    let mut citations: Vec<Citation> = Vec::new();
    let mut sections = Vec::with_capacity(draft.sections.len());

    for mut section in draft.sections {
        if !entities.contains(section.entity.as_str()) {
            return Err(NewsfeedError::validation(format!(
                "summary section names unknown entity '{}'",
                section.entity
            )));
        }

        let mut keys: Vec<String> = Vec::new();
        for key in section.citations {
            let Some(item) = by_key.get(key.as_str()) else {
                return Err(NewsfeedError::validation(format!(
                    "summary cites unknown key '{key}'"
                )));
            };
            if keys.contains(&key) {
                continue;
            }
            if !citations.iter().any(|c| c.key == key) {
                citations.push(Citation {
                    key: key.clone(),
                    entity: item.payload.entity().to_string(),
                    title: item.payload.article().title.clone(),
                    url: item.source_ref.url.clone(),
                });
            }
            keys.push(key);
        }
        section.citations = keys;
        sections.push(section);
    }

    Ok(SummaryReport {
        run_id: run_id.to_string(),
        generated_at: Utc::now(),
        date_range: date_range.to_string(),
        title: draft.title,
        overview: draft.overview,
        sections,
        citations,
    })
}

/// Markdown rendering of a report. Same report in, same text out.
pub fn render_markdown(report: &SummaryReport) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# {}\n", report.title.trim());
    let _ = writeln!(md, "_{}_\n", report.date_range);
    let _ = writeln!(md, "{}\n", report.overview.trim());

    let urls: HashMap<&str, &str> = report
        .citations
        .iter()
        .map(|c| (c.key.as_str(), c.url.as_str()))
        .collect();

    for section in &report.sections {
        let _ = writeln!(md, "## {}\n", section.entity);
        let _ = writeln!(md, "**{}**\n", section.headline.trim());
        let _ = writeln!(md, "{}\n", section.body.trim());
        if !section.citations.is_empty() {
            let refs: Vec<String> = section
                .citations
                .iter()
                .map(|k| format!("[{k}]({})", urls.get(k.as_str()).copied().unwrap_or_default()))
                .collect();
            let _ = writeln!(md, "Sources: {}\n", refs.join(", "));
        }
    }

    if !report.citations.is_empty() {
        md.push_str("## Sources\n\n");
        for (i, c) in report.citations.iter().enumerate() {
            let _ = writeln!(
                md,
                "{}. `{}` {} ({}): <{}>",
                i + 1,
                c.key,
                c.title,
                c.entity,
                c.url
            );
        }
        md.push('\n');
    }

    let _ = writeln!(
        md,
        "---\nRun `{}`, generated {}",
        report.run_id,
        report.generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    md
}
