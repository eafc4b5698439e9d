//! Generic schema-validated transform stage.
//!
//! A [`StageSpec`] says what to ask the service for each item and how to
//! fold the answer back in. [`StageProcessor`] runs that over a collection
//! with bounded concurrency, drops items whose call or validation fails
//! (recording a diagnostic for each), and keeps input order.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use newsfeed_search::RateLimitedClient;
use newsfeed_shared::{
    Boundary, Diagnostic, NewsfeedError, Result, StageItem, StageName, StageStats,
};
use newsfeed_storage::Storage;

use crate::progress::ProgressReporter;
use crate::transform::{TransformRequest, TransformService, extract_json};

/// Semantic checks beyond what deserialization enforces.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reject blank strings with a field name in the message.
pub(crate) fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(NewsfeedError::validation(format!("{field} is empty")));
    }
    Ok(())
}

/// One per-item transform stage.
pub trait StageSpec: Send + Sync {
    type In: Serialize + Send + Sync;
    /// What the service must return for one item.
    type Verdict: DeserializeOwned + Serialize + Validate + Send;
    type Out: Send;

    fn stage(&self) -> StageName;

    fn instructions(&self) -> String;

    fn payload(&self, item: &StageItem<Self::In>) -> Result<serde_json::Value> {
        serde_json::to_value(&item.payload)
            .map_err(|e| NewsfeedError::validation(format!("payload serialization: {e}")))
    }

    fn merge(&self, item: &StageItem<Self::In>, verdict: Self::Verdict) -> Self::Out;

    /// Projection applied after merge. Items failing it are filtered,
    /// not dropped.
    fn keep(&self, _out: &Self::Out) -> bool {
        true
    }
}

/// Surviving items plus what happened to the rest.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub items: Vec<StageItem<T>>,
    pub stats: StageStats,
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs [`StageSpec`]s against a [`TransformService`].
pub struct StageProcessor {
    service: Arc<dyn TransformService>,
    client: RateLimitedClient,
    ledger: Option<Arc<Storage>>,
    concurrency: usize,
    max_drop_ratio: Option<f64>,
}

impl StageProcessor {
    pub fn new(service: Arc<dyn TransformService>, client: RateLimitedClient) -> Self {
        Self {
            service,
            client: client.for_boundary(Boundary::Transform),
            ledger: None,
            concurrency: 1,
            max_drop_ratio: None,
        }
    }

    /// Reuse validated results from the ledger's transform cache.
    pub fn with_cache(mut self, ledger: Arc<Storage>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_drop_ratio(mut self, ratio: Option<f64>) -> Self {
        self.max_drop_ratio = ratio;
        self
    }

    pub fn model_id(&self) -> &str {
        self.service.model_id()
    }

    /// Transform every item. Fails only when the drop ratio is exceeded;
    /// an empty outcome is the caller's call.
    #[instrument(skip_all, fields(stage = %spec.stage(), items = items.len()))]
    pub async fn process<S: StageSpec>(
        &self,
        spec: &S,
        items: &[StageItem<S::In>],
        progress: &dyn ProgressReporter,
    ) -> Result<StageOutcome<S::Out>> {
        let stage = spec.stage();
        let instructions = spec.instructions();
        let total = items.len();

        let mut verdicts = futures::stream::iter(items)
            .map(|item| self.verdict_for(spec, &instructions, item))
            .buffered(self.concurrency);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = verdicts.next().await {
            results.push(result);
            progress.item_processed(stage, results.len(), total);
        }

        let mut outcome = StageOutcome {
            items: Vec::with_capacity(total),
            stats: StageStats {
                input: total,
                ..StageStats::default()
            },
            diagnostics: Vec::new(),
        };

        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(verdict) => {
                    let merged = spec.merge(item, verdict);
                    if spec.keep(&merged) {
                        outcome.items.push(item.derive(merged));
                    } else {
                        outcome.stats.filtered += 1;
                        debug!(source_ref = %item.source_ref.id, "item filtered out");
                    }
                }
                Err(e) => {
                    outcome.stats.dropped += 1;
                    warn!(
                        source_ref = %item.source_ref.id,
                        entity = %item.source_ref.entity,
                        kind = e.kind(),
                        error = %e,
                        "item dropped"
                    );
                    outcome.diagnostics.push(
                        Diagnostic::from_error(stage, &e)
                            .for_source(&item.source_ref.id, &item.source_ref.entity),
                    );
                }
            }
        }
        outcome.stats.output = outcome.items.len();

        if let Some(max) = self.max_drop_ratio {
            let ratio = if total == 0 {
                0.0
            } else {
                outcome.stats.dropped as f64 / total as f64
            };
            if ratio > max {
                return Err(NewsfeedError::validation(format!(
                    "{} of {total} items failed in stage {stage}, above the allowed ratio {max}",
                    outcome.stats.dropped
                )));
            }
        }

        info!(
            input = outcome.stats.input,
            output = outcome.stats.output,
            dropped = outcome.stats.dropped,
            filtered = outcome.stats.filtered,
            "stage items processed"
        );
        Ok(outcome)
    }

    async fn verdict_for<S: StageSpec>(
        &self,
        spec: &S,
        instructions: &str,
        item: &StageItem<S::In>,
    ) -> Result<S::Verdict> {
        let request = TransformRequest {
            stage: spec.stage(),
            instructions: instructions.to_string(),
            payload: spec.payload(item)?,
        };
        self.request(&request).await
    }

    /// One validated transform, served from the cache when possible.
    pub async fn request<V>(&self, request: &TransformRequest) -> Result<V>
    where
        V: DeserializeOwned + Serialize + Validate,
    {
        let stage = request.stage.as_str();
        let hash = request.prompt_hash();

        if let Some(ledger) = &self.ledger {
            match ledger.get_transform_cache(stage, &hash, self.model_id()).await {
                Ok(Some(json)) => match parse_verdict::<V>(&json) {
                    Ok(verdict) => {
                        debug!(stage, "transform cache hit");
                        return Ok(verdict);
                    }
                    Err(e) => debug!(stage, error = %e, "stale cache entry ignored"),
                },
                Ok(None) => {}
                Err(e) => warn!(stage, error = %e, "transform cache lookup failed"),
            }
        }

        let raw = self
            .client
            .call(stage, || self.service.transform(request))
            .await?;
        let verdict = parse_verdict::<V>(&raw)?;

        if let Some(ledger) = &self.ledger {
            let stored = serde_json::to_string(&verdict).map_err(|e| {
                NewsfeedError::validation(format!("JSON serialization failed: {e}"))
            })?;
            if let Err(e) = ledger
                .set_transform_cache(stage, &hash, self.model_id(), &stored)
                .await
            {
                warn!(stage, error = %e, "transform cache write failed");
            }
        }
        Ok(verdict)
    }
}

/// Extract, deserialize, and validate one verdict.
pub fn parse_verdict<V: DeserializeOwned + Validate>(raw: &str) -> Result<V> {
    let value = extract_json(raw)?;
    let verdict: V = serde_json::from_value(value)
        .map_err(|e| NewsfeedError::validation(format!("output does not match schema: {e}")))?;
    verdict.validate()?;
    Ok(verdict)
}
