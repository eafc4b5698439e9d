//! In-process stand-ins for the external services, shared by unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use newsfeed_search::{RateLimitedClient, RateLimiter, SearchProvider, SearchQuery};
use newsfeed_shared::{
    ArticleItem, ArticleRef, DeliveryReceipt, NewsfeedError, RateLimitMode, Result, RetryPolicy,
    Score, ScoredArticle, SourceRef, StageItem, StageName,
};

use crate::context::RunContext;
use crate::deliver::{DeliveryService, OutgoingEmail};
use crate::transform::{TransformRequest, TransformService};

type Responder = dyn Fn(&TransformRequest) -> Result<String> + Send + Sync;

/// Transform service answering from a closure.
pub struct FakeTransform {
    respond: Box<Responder>,
    calls: AtomicUsize,
}

impl FakeTransform {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&TransformRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformService for FakeTransform {
    fn model_id(&self) -> &str {
        "fake-model"
    }

    async fn transform(&self, request: &TransformRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }
}

/// A generous budget and a single attempt, so tests never sleep.
pub fn test_client() -> RateLimitedClient {
    RateLimitedClient::new(
        Arc::new(RateLimiter::new(
            1000,
            Duration::from_secs(60),
            RateLimitMode::Wait,
        )),
        RetryPolicy::immediate(1, Duration::from_secs(5)),
    )
}

pub fn test_context() -> RunContext {
    RunContext::new(
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
        8,
        "european politics",
    )
}

pub fn article(url: &str, title: &str) -> ArticleRef {
    ArticleRef {
        url: url.to_string(),
        title: title.to_string(),
        snippet: format!("{title} snippet"),
        published_at: Some(Utc::now()),
        source_rank: Some(1),
    }
}

pub fn scored_item(entity: &str, url: &str, title: &str, score: u8) -> StageItem<ScoredArticle> {
    StageItem::new(
        SourceRef::new(entity, url),
        ScoredArticle {
            article: ArticleItem {
                entity: entity.to_string(),
                article: article(url, title),
            },
            score: Score::new(score).unwrap(),
            inclusion_reason: "relevant".into(),
        },
    )
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Two articles per query, failing for queries naming a listed entity.
#[derive(Default)]
pub struct FakeSearch {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl FakeSearch {
    pub fn failing_for(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ArticleRef>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|name| query.text.contains(name.as_str())) {
            return Err(NewsfeedError::provider_fatal("HTTP 403: quota"));
        }
        let slug = query.text.to_lowercase().replace(|c: char| !c.is_alphanumeric(), "-");
        Ok(vec![
            article(&format!("https://news.example.com/{slug}/1"), "Committee vote"),
            article(&format!("https://news.example.com/{slug}/2"), "Plenary speech"),
        ])
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Records outgoing mail; optionally refuses or never answers.
#[derive(Default)]
pub struct FakeDelivery {
    fail: bool,
    hang: bool,
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl FakeDelivery {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn hung() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryService for FakeDelivery {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail {
            return Err(NewsfeedError::delivery("HTTP 401: key not found", false));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(DeliveryReceipt {
            message_id: Some("<fake@relay>".into()),
            recipients: email.recipients.clone(),
            subject: email.subject.clone(),
            delivered_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Whole-pipeline responder
// ---------------------------------------------------------------------------

/// Answers every transform stage with valid output: filter scores 8,
/// enrich fills every field, and summarize writes one section per entity
/// citing all of that entity's items.
pub fn pipeline_transform() -> Arc<FakeTransform> {
    Arc::new(FakeTransform::new(|req| {
        let body = match req.stage {
            StageName::Filter => serde_json::json!({ "score": 8, "reason": "on topic" }),
            StageName::Enrich => serde_json::json!({
                "theme": "Budget",
                "background": "Ongoing negotiations.",
                "significance": "Affects the plenary vote.",
                "collaboration_angles": "Shared committee work."
            }),
            StageName::Summarize => summarize_response(&req.payload),
            other => {
                return Err(NewsfeedError::service_fatal(format!(
                    "no transform for stage {other}"
                )));
            }
        };
        Ok(body.to_string())
    }))
}

fn summarize_response(payload: &serde_json::Value) -> serde_json::Value {
    let mut sections: Vec<serde_json::Value> = Vec::new();
    let items = payload["items"].as_array().cloned().unwrap_or_default();
    for item in &items {
        let entity = item["entity"].as_str().unwrap_or_default();
        let key = item["key"].clone();
        match sections.iter_mut().find(|s| s["entity"] == entity) {
            Some(section) => {
                if let Some(cites) = section["citations"].as_array_mut() {
                    cites.push(key);
                }
            }
            None => sections.push(serde_json::json!({
                "entity": entity,
                "headline": format!("{entity} in the news"),
                "body": format!("Coverage of {entity}."),
                "citations": [key],
            })),
        }
    }
    serde_json::json!({
        "title": "Weekly digest",
        "overview": "Highlights from the tracked members.",
        "sections": sections,
    })
}
