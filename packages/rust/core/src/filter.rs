//! Relevance filter: score each article 0-10 and keep those at or above
//! the threshold.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use newsfeed_shared::{
    ArticleItem, Result, Score, ScoredArticle, SearchResult, SourceRef, StageItem, StageName,
};

use crate::context::RunContext;
use crate::stage::{StageSpec, Validate, require_text};

/// What the service returns for one article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub score: Score,
    pub reason: String,
}

impl Validate for FilterVerdict {
    fn validate(&self) -> Result<()> {
        require_text("reason", &self.reason)
    }
}

pub struct FilterSpec {
    pub threshold: u8,
    pub context: RunContext,
}

impl StageSpec for FilterSpec {
    type In = ArticleItem;
    type Verdict = FilterVerdict;
    type Out = ScoredArticle;

    fn stage(&self) -> StageName {
        StageName::Filter
    }

    fn instructions(&self) -> String {
        format!(
            "You screen news coverage of tracked public figures. Today is {today}; \
             the coverage window is the last {months} months ({range}). \
             Focus areas: {focus}.\n\
             Rate how relevant the article in the user message is to the named \
             entity and the focus areas, from 0 (unrelated, or a different \
             person with the same name) to 10 (substantive, recent coverage of \
             their work). Penalize articles outside the coverage window.\n\
             Respond with a JSON object only: \
             {{\"score\": <integer 0-10>, \"reason\": \"<one sentence>\"}}",
            today = self.context.today,
            months = self.context.timeframe_months,
            range = self.context.date_range(),
            focus = self.context.focus_areas,
        )
    }

    fn merge(&self, item: &StageItem<ArticleItem>, verdict: FilterVerdict) -> ScoredArticle {
        ScoredArticle {
            article: item.payload.clone(),
            score: verdict.score,
            inclusion_reason: verdict.reason,
        }
    }

    fn keep(&self, out: &ScoredArticle) -> bool {
        out.score.passes(self.threshold)
    }
}

/// Flatten successful search results into filter input, in entity-list
/// order. Failed entities contribute nothing; repeated sources are skipped.
pub fn items_from_search(results: &[SearchResult]) -> Vec<StageItem<ArticleItem>> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for result in results.iter().filter(|r| r.is_ok()) {
        for article in &result.items {
            let source_ref = SourceRef::new(&result.entity.name, &article.url);
            if !seen.insert(source_ref.id.clone()) {
                debug!(url = %article.url, "duplicate source skipped");
                continue;
            }
            items.push(StageItem::new(
                source_ref,
                ArticleItem {
                    entity: result.entity.name.clone(),
                    article: article.clone(),
                },
            ));
        }
    }
    items
}
