//! One entity's search, captured as a `SearchResult` whatever happens.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, instrument, warn};
use url::Url;

use newsfeed_shared::{ArticleRef, Entity, NewsfeedError, Result, SearchConfig, SearchResult};

use crate::client::RateLimitedClient;
use crate::provider::{SearchProvider, SearchQuery};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("static regex"));

// ---------------------------------------------------------------------------
// QueryTemplate
// ---------------------------------------------------------------------------

/// Query text with `{attribute}` placeholders filled from the entity.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    template: String,
}

impl QueryTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(NewsfeedError::config("search.query_template is empty"));
        }
        Ok(Self { template })
    }

    /// Fill every placeholder; attributes the entity lacks expand to
    /// nothing and runs of whitespace collapse.
    pub fn render(&self, entity: &Entity) -> String {
        let rendered = PLACEHOLDER_RE.replace_all(&self.template, |caps: &regex::Captures| {
            entity.attribute(&caps[1]).unwrap_or_default().to_string()
        });
        rendered.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

// ---------------------------------------------------------------------------
// EntityTaskRunner
// ---------------------------------------------------------------------------

/// Builds the provider query for an entity and runs it through the
/// shared rate-limited client.
pub struct EntityTaskRunner {
    provider: Arc<dyn SearchProvider>,
    client: RateLimitedClient,
    template: QueryTemplate,
    results_per_entity: u32,
    recency_months: u32,
}

impl EntityTaskRunner {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        client: RateLimitedClient,
        template: QueryTemplate,
        results_per_entity: u32,
        recency_months: u32,
    ) -> Self {
        Self {
            provider,
            client,
            template,
            results_per_entity,
            recency_months,
        }
    }

    pub fn from_config(
        provider: Arc<dyn SearchProvider>,
        client: RateLimitedClient,
        config: &SearchConfig,
        recency_months: u32,
    ) -> Result<Self> {
        Ok(Self::new(
            provider,
            client,
            QueryTemplate::new(config.query_template.clone())?,
            config.results_per_entity,
            recency_months,
        ))
    }

    pub fn query_for(&self, entity: &Entity) -> SearchQuery {
        SearchQuery {
            text: self.template.render(entity),
            num: self.results_per_entity,
            recency_months: self.recency_months,
        }
    }

    /// Never fails: provider and client errors land in `SearchResult.error`.
    #[instrument(skip_all, fields(entity = %entity.name, provider = self.provider.name()))]
    pub async fn run(&self, entity: &Entity) -> SearchResult {
        match self.try_run(entity).await {
            Ok(items) => {
                debug!(items = items.len(), "entity search complete");
                SearchResult::succeeded(entity.clone(), items)
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "entity search failed");
                SearchResult::failed(entity.clone(), &e)
            }
        }
    }

    async fn try_run(&self, entity: &Entity) -> Result<Vec<ArticleRef>> {
        let query = self.query_for(entity);
        let raw = self
            .client
            .call("search", || self.provider.search(&query))
            .await?;
        Ok(clean_articles(raw))
    }
}

/// Drop entries without a usable http(s) URL or title, and repeated URLs.
/// Provider order is kept.
fn clean_articles(raw: Vec<ArticleRef>) -> Vec<ArticleRef> {
    let total = raw.len();
    let mut seen = HashSet::new();
    let kept: Vec<ArticleRef> = raw
        .into_iter()
        .filter(|a| !a.title.trim().is_empty())
        .filter(|a| {
            Url::parse(&a.url)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false)
        })
        .filter(|a| seen.insert(a.url.clone()))
        .collect();

    if kept.len() < total {
        debug!(total, kept = kept.len(), "discarded unusable search results");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RateLimiter;
    use async_trait::async_trait;
    use newsfeed_shared::{RateLimitMode, RetryPolicy};
    use std::sync::Mutex;
    use std::time::Duration;

    fn article(url: &str, title: &str) -> ArticleRef {
        ArticleRef {
            url: url.into(),
            title: title.into(),
            snippet: String::new(),
            published_at: None,
            source_rank: None,
        }
    }

    struct Scripted {
        queries: Mutex<Vec<SearchQuery>>,
        response: Result<Vec<ArticleRef>>,
    }

    #[async_trait]
    impl SearchProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn search(&self, query: &SearchQuery) -> Result<Vec<ArticleRef>> {
            self.queries.lock().unwrap().push(query.clone());
            match &self.response {
                Ok(items) => Ok(items.clone()),
                Err(e) => Err(NewsfeedError::provider_fatal(e.to_string())),
            }
        }
    }

    fn runner(provider: Arc<Scripted>) -> EntityTaskRunner {
        let limiter = Arc::new(RateLimiter::new(
            10,
            Duration::from_secs(60),
            RateLimitMode::Wait,
        ));
        let client = RateLimitedClient::new(limiter, RetryPolicy::immediate(1, Duration::from_secs(5)));
        EntityTaskRunner::new(
            provider,
            client,
            QueryTemplate::new("\"{name}\" {country} news").unwrap(),
            10,
            8,
        )
    }

    #[test]
    fn template_renders_attributes() {
        let t = QueryTemplate::new("\"{name}\" {country} news").unwrap();
        let e = Entity::new("Anna Keller").with_attribute("country", "Germany");
        assert_eq!(t.render(&e), "\"Anna Keller\" Germany news");
    }

    #[test]
    fn template_missing_attribute_expands_empty() {
        let t = QueryTemplate::new("\"{name}\" {country} news").unwrap();
        assert_eq!(t.render(&Entity::new("Anna Keller")), "\"Anna Keller\" news");
        assert!(QueryTemplate::new("   ").is_err());
    }

    #[tokio::test]
    async fn run_builds_query_and_cleans_results() {
        let provider = Arc::new(Scripted {
            queries: Mutex::new(Vec::new()),
            response: Ok(vec![
                article("https://news.example.com/a", "First"),
                article("https://news.example.com/a", "First again"),
                article("not a url", "Broken"),
                article("https://news.example.com/b", "  "),
                article("https://news.example.com/c", "Third"),
            ]),
        });
        let entity = Entity::new("Anna Keller").with_attribute("country", "Germany");

        let result = runner(provider.clone()).run(&entity).await;
        assert!(result.is_ok());
        let urls: Vec<&str> = result.items.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://news.example.com/a", "https://news.example.com/c"]
        );

        let queries = provider.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].text, "\"Anna Keller\" Germany news");
        assert_eq!(queries[0].recency_months, 8);
    }

    #[tokio::test]
    async fn provider_error_is_captured() {
        let provider = Arc::new(Scripted {
            queries: Mutex::new(Vec::new()),
            response: Err(NewsfeedError::provider_fatal("401 unauthorized")),
        });
        let entity = Entity::new("Luca Bianchi").with_attribute("country", "Italy");

        let result = runner(provider).run(&entity).await;
        assert!(!result.is_ok());
        assert!(result.items.is_empty());
        let error = result.error.unwrap();
        assert_eq!(error.kind, "provider_error");
        assert!(error.message.contains("401"));
    }
}
