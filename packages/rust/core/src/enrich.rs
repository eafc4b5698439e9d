//! Enrichment: attach theme, background, significance, and collaboration
//! angles to each scored article. Items are only lost to service or
//! validation failures, never for content.

use newsfeed_shared::{EnrichedArticle, NewsContext, Result, ScoredArticle, StageItem, StageName};

use crate::context::RunContext;
use crate::stage::{StageSpec, Validate, require_text};

impl Validate for NewsContext {
    fn validate(&self) -> Result<()> {
        require_text("theme", &self.theme)?;
        require_text("background", &self.background)?;
        require_text("significance", &self.significance)?;
        require_text("collaboration_angles", &self.collaboration_angles)
    }
}

pub struct EnrichSpec {
    pub context: RunContext,
}

impl StageSpec for EnrichSpec {
    type In = ScoredArticle;
    type Verdict = NewsContext;
    type Out = EnrichedArticle;

    fn stage(&self) -> StageName {
        StageName::Enrich
    }

    fn instructions(&self) -> String {
        format!(
            "You brief a policy team on news about tracked public figures. \
             Today is {today}. Focus areas: {focus}.\n\
             For the article in the user message, explain its context.\n\
             Respond with a JSON object only, every field a non-empty string: \
             {{\"theme\": \"<main theme, a few words>\", \
             \"background\": \"<2-3 sentences of background>\", \
             \"significance\": \"<why it matters politically>\", \
             \"collaboration_angles\": \"<where the team could engage>\"}}",
            today = self.context.today,
            focus = self.context.focus_areas,
        )
    }

    fn merge(&self, item: &StageItem<ScoredArticle>, verdict: NewsContext) -> EnrichedArticle {
        EnrichedArticle {
            scored: item.payload.clone(),
            context: verdict,
        }
    }
}
