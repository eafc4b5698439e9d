//! The run coordinator: search → filter → enrich → summarize → deliver.
//!
//! Each stage loads its predecessor's artifact from the output directory
//! rather than holding results in memory, so a run may start at any stage
//! as long as the artifact it needs is on disk. A stage that fails marks
//! the run `Failed(stage)`, stops everything downstream, and leaves every
//! earlier artifact in place.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use newsfeed_search::{
    ConcurrentDispatcher, EntityTaskRunner, RateLimitedClient, RateLimiter, SearchProvider,
};
use newsfeed_shared::{
    AppConfig, Boundary, Diagnostic, EnrichedArticle, Entity, NewsfeedError, PipelineRun, RateLimitMode,
    Result, RetryPolicy, RunId, ScoredArticle, SearchResult, StageItem, StageName, StageStats,
    SummaryReport, ensure_unique_sources, validate_entities,
};
use newsfeed_storage::{StageEventKind, Storage};

use crate::artifacts::{ArtifactEnvelope, ArtifactStore, REPORT_MARKDOWN_FILE};
use crate::context::RunContext;
use crate::deliver::{DeliveryService, compose_email};
use crate::enrich::EnrichSpec;
use crate::filter::{FilterSpec, items_from_search};
use crate::progress::ProgressReporter;
use crate::stage::{StageProcessor, StageSpec};
use crate::summarize::{Summarizer, render_markdown};
use crate::transform::TransformService;

/// Delivery calls are rare; this only bounds a retry storm.
const DELIVERY_BUDGET_PER_MINUTE: u32 = 10;

// ---------------------------------------------------------------------------
// RunPlan
// ---------------------------------------------------------------------------

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPlan {
    Full,
    /// The given stage through delivery.
    From(StageName),
    Only(StageName),
    /// Inclusive stage range.
    Range(StageName, StageName),
}

impl RunPlan {
    pub fn stages(&self) -> Vec<StageName> {
        match *self {
            Self::Full => StageName::ALL.to_vec(),
            Self::From(stage) => stage.through_end(),
            Self::Only(stage) => vec![stage],
            Self::Range(first, last) => StageName::ALL
                .into_iter()
                .filter(|s| *s >= first && *s <= last)
                .collect(),
        }
    }

    pub fn includes(&self, stage: StageName) -> bool {
        self.stages().contains(&stage)
    }
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::From(stage) => write!(f, "from {stage}"),
            Self::Only(stage) => write!(f, "only {stage}"),
            Self::Range(first, last) => write!(f, "{first}..{last}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// External collaborators. Only the ones a plan needs must be present.
#[derive(Clone, Default)]
pub struct Services {
    pub search: Option<Arc<dyn SearchProvider>>,
    pub transform: Option<Arc<dyn TransformService>>,
    pub delivery: Option<Arc<dyn DeliveryService>>,
    /// Run history and transform cache.
    pub ledger: Option<Arc<Storage>>,
}

struct Transition<'a> {
    stage: StageName,
    kind: StageEventKind,
    stats: Option<&'a StageStats>,
    artifact: Option<&'a Path>,
    message: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// PipelineCoordinator
// ---------------------------------------------------------------------------

pub struct PipelineCoordinator {
    config: AppConfig,
    services: Services,
    store: ArtifactStore,
    entities: Vec<Entity>,
    context: RunContext,
}

impl PipelineCoordinator {
    pub fn new(config: AppConfig, services: Services) -> Self {
        let store = ArtifactStore::new(&config.run.output_dir);
        let context = RunContext::from_config(&config.run);
        Self {
            config,
            services,
            store,
            entities: Vec::new(),
            context,
        }
    }

    /// Entity list for the search stage.
    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Everything a plan needs that can be checked before any stage runs.
    pub fn preflight(&self, plan: RunPlan) -> Result<()> {
        self.config.validate()?;

        if plan.includes(StageName::Search) {
            if self.services.search.is_none() {
                return Err(NewsfeedError::config("search stage needs a search provider"));
            }
            validate_entities(&self.entities)?;
        }
        let needs_transform = StageName::TRANSFORMS.iter().any(|s| plan.includes(*s));
        if needs_transform && self.services.transform.is_none() {
            return Err(NewsfeedError::config(
                "transform stages need a transformation service",
            ));
        }
        if plan.includes(StageName::Deliver) {
            if self.services.delivery.is_none() {
                return Err(NewsfeedError::config("deliver stage needs a delivery service"));
            }
            if self.config.delivery.recipients.is_empty() {
                return Err(NewsfeedError::config("delivery.recipients is empty"));
            }
        }
        Ok(())
    }

    /// Execute `plan`. Stage failures come back as a `Failed` run, not as
    /// `Err`; `Err` means the run could not start or its record could not
    /// be written.
    #[instrument(skip_all, fields(plan = %plan))]
    pub async fn run(&self, plan: RunPlan, progress: &dyn ProgressReporter) -> Result<PipelineRun> {
        self.preflight(plan)?;

        let mut run = PipelineRun::new();
        // One transform budget per run, shared by every transform stage.
        let transform_limiter =
            Arc::new(RateLimiter::from_config(&self.config.transform.rate_limit));

        info!(
            run_id = %run.run_id,
            output_dir = %self.store.dir().display(),
            "starting pipeline run"
        );

        for stage in plan.stages() {
            progress.phase(stage);
            run.begin(stage)?;
            self.persist(
                &run,
                Some(Transition {
                    stage,
                    kind: StageEventKind::Started,
                    stats: None,
                    artifact: None,
                    message: None,
                }),
                &[],
            )
            .await?;

            let started = Instant::now();
            let mut diagnostics = Vec::new();
            let result = self
                .execute(stage, &run.run_id, &transform_limiter, &mut diagnostics, progress)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok((artifact, stats)) => {
                    info!(
                        %stage,
                        input = stats.input,
                        output = stats.output,
                        dropped = stats.dropped,
                        filtered = stats.filtered,
                        elapsed_ms,
                        "stage committed"
                    );
                    run.record_all(diagnostics.iter().cloned());
                    run.commit(stage, artifact.clone(), stats.clone());
                    self.persist(
                        &run,
                        Some(Transition {
                            stage,
                            kind: StageEventKind::Committed,
                            stats: Some(&stats),
                            artifact: Some(&artifact),
                            message: None,
                        }),
                        &diagnostics,
                    )
                    .await?;
                }
                Err(e) => {
                    error!(%stage, kind = e.kind(), error = %e, elapsed_ms, "stage failed");
                    let reason = e.to_string();
                    diagnostics.push(Diagnostic::from_error(stage, &e));
                    run.record_all(diagnostics.iter().cloned());
                    run.fail(stage, reason.clone());
                    self.persist(
                        &run,
                        Some(Transition {
                            stage,
                            kind: StageEventKind::Failed,
                            stats: None,
                            artifact: None,
                            message: Some(&reason),
                        }),
                        &diagnostics,
                    )
                    .await?;
                    progress.done(&run);
                    return Ok(run);
                }
            }
        }

        run.complete();
        self.persist(&run, None, &[]).await?;
        info!(
            run_id = %run.run_id,
            stages = run.stages_completed.len(),
            diagnostics = run.diagnostics.len(),
            "pipeline run completed"
        );
        progress.done(&run);
        Ok(run)
    }

    async fn execute(
        &self,
        stage: StageName,
        run_id: &RunId,
        transform_limiter: &Arc<RateLimiter>,
        diagnostics: &mut Vec<Diagnostic>,
        progress: &dyn ProgressReporter,
    ) -> Result<(PathBuf, StageStats)> {
        match stage {
            StageName::Search => self.search(run_id, diagnostics, progress).await,
            StageName::Filter => {
                let envelope: ArtifactEnvelope<Vec<SearchResult>> =
                    self.store.load(StageName::Search)?;
                let items = items_from_search(&envelope.records);
                let spec = FilterSpec {
                    threshold: self.config.filter.threshold,
                    context: self.context.clone(),
                };
                let processor = self.processor(transform_limiter)?;
                self.transform_stage(&spec, &items, &processor, run_id, diagnostics, progress)
                    .await
            }
            StageName::Enrich => {
                let envelope: ArtifactEnvelope<Vec<StageItem<ScoredArticle>>> =
                    self.store.load(StageName::Filter)?;
                ensure_unique_sources(&envelope.records)?;
                let spec = EnrichSpec {
                    context: self.context.clone(),
                };
                let processor = self.processor(transform_limiter)?;
                self.transform_stage(&spec, &envelope.records, &processor, run_id, diagnostics, progress)
                    .await
            }
            StageName::Summarize => {
                let envelope: ArtifactEnvelope<Vec<StageItem<EnrichedArticle>>> =
                    self.store.load(StageName::Enrich)?;
                ensure_unique_sources(&envelope.records)?;
                let processor = self.processor(transform_limiter)?;
                self.summarize(&envelope.records, &processor, run_id, progress)
                    .await
            }
            StageName::Deliver => self.deliver(run_id).await,
        }
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn search(
        &self,
        run_id: &RunId,
        diagnostics: &mut Vec<Diagnostic>,
        progress: &dyn ProgressReporter,
    ) -> Result<(PathBuf, StageStats)> {
        let provider = self
            .services
            .search
            .clone()
            .ok_or_else(|| NewsfeedError::config("search stage needs a search provider"))?;

        // Fresh limiter per run; nothing carries over between runs.
        let limiter = Arc::new(RateLimiter::from_config(&self.config.search.rate_limit));
        let client = RateLimitedClient::new(limiter, RetryPolicy::from(&self.config.retry));
        let runner = EntityTaskRunner::from_config(
            provider,
            client,
            &self.config.search,
            self.context.timeframe_months,
        )?;
        let dispatcher = ConcurrentDispatcher::new(Arc::new(runner));

        let results = dispatcher
            .dispatch_with(
                &self.entities,
                self.config.search.concurrency as usize,
                |result, done, total| {
                    progress.entity_searched(&result.entity.name, result.is_ok(), done, total)
                },
            )
            .await;

        for result in &results {
            if let Some(err) = &result.error {
                diagnostics.push(
                    Diagnostic::new(StageName::Search, err.kind.clone(), err.message.clone())
                        .for_entity(&result.entity.name),
                );
            }
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        let stats = StageStats {
            input: results.len(),
            output: results.len() - failed,
            dropped: failed,
            filtered: 0,
        };
        if stats.output == 0 {
            return Err(NewsfeedError::validation(format!(
                "all {} entity searches failed",
                results.len()
            )));
        }

        let path = self.store.write(StageName::Search, run_id, &results)?;
        Ok((path, stats))
    }

    async fn transform_stage<S>(
        &self,
        spec: &S,
        items: &[StageItem<S::In>],
        processor: &StageProcessor,
        run_id: &RunId,
        diagnostics: &mut Vec<Diagnostic>,
        progress: &dyn ProgressReporter,
    ) -> Result<(PathBuf, StageStats)>
    where
        S: StageSpec,
        S::Out: Serialize,
    {
        let stage = spec.stage();
        if items.is_empty() {
            return Err(NewsfeedError::validation(format!(
                "no input items for stage {stage}"
            )));
        }

        let outcome = processor.process(spec, items, progress).await?;
        diagnostics.extend(outcome.diagnostics);
        if outcome.items.is_empty() {
            return Err(NewsfeedError::validation(format!(
                "no items survived stage {stage} ({} dropped, {} filtered)",
                outcome.stats.dropped, outcome.stats.filtered
            )));
        }
        ensure_unique_sources(&outcome.items)?;

        let path = self.store.write(stage, run_id, &outcome.items)?;
        Ok((path, outcome.stats))
    }

    async fn summarize(
        &self,
        items: &[StageItem<EnrichedArticle>],
        processor: &StageProcessor,
        run_id: &RunId,
        progress: &dyn ProgressReporter,
    ) -> Result<(PathBuf, StageStats)> {
        let report = Summarizer::new(self.context.clone())
            .summarize(processor, run_id, items)
            .await?;
        progress.item_processed(StageName::Summarize, 1, 1);

        // Markdown is a view only; Deliver renders from the JSON written last.
        self.store
            .write_text(REPORT_MARKDOWN_FILE, &render_markdown(&report))?;
        let path = self.store.write(StageName::Summarize, run_id, &report)?;

        let cited = report.citations.len();
        Ok((
            path,
            StageStats {
                input: items.len(),
                output: cited,
                dropped: 0,
                filtered: items.len().saturating_sub(cited),
            },
        ))
    }

    async fn deliver(&self, run_id: &RunId) -> Result<(PathBuf, StageStats)> {
        let delivery = self
            .services
            .delivery
            .clone()
            .ok_or_else(|| NewsfeedError::config("deliver stage needs a delivery service"))?;

        let envelope: ArtifactEnvelope<SummaryReport> = self.store.load(StageName::Summarize)?;
        let report = envelope.records;
        let markdown = render_markdown(&report);
        let email = compose_email(&report, &markdown, &self.config.delivery)?;

        let client = RateLimitedClient::new(
            Arc::new(RateLimiter::new(
                DELIVERY_BUDGET_PER_MINUTE,
                Duration::from_secs(60),
                RateLimitMode::Wait,
            )),
            RetryPolicy::from(&self.config.retry),
        )
        .for_boundary(Boundary::Delivery);
        let receipt = client
            .call("deliver", || delivery.deliver(&email))
            .await?;

        let path = self.store.write(StageName::Deliver, run_id, &receipt)?;
        Ok((
            path,
            StageStats {
                input: 1,
                output: 1,
                dropped: 0,
                filtered: 0,
            },
        ))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn processor(&self, limiter: &Arc<RateLimiter>) -> Result<StageProcessor> {
        let service = self
            .services
            .transform
            .clone()
            .ok_or_else(|| NewsfeedError::config("transform stages need a transformation service"))?;
        let client = RateLimitedClient::new(limiter.clone(), RetryPolicy::from(&self.config.retry));

        let mut processor = StageProcessor::new(service, client)
            .with_concurrency(self.config.transform.concurrency as usize)
            .with_max_drop_ratio(self.config.transform.max_drop_ratio);
        if let Some(ledger) = &self.services.ledger {
            processor = processor.with_cache(ledger.clone());
        }
        Ok(processor)
    }

    /// Rewrite `run.json`, then mirror the transition into the ledger.
    /// Ledger problems are logged and never fail the run.
    async fn persist(
        &self,
        run: &PipelineRun,
        transition: Option<Transition<'_>>,
        diagnostics: &[Diagnostic],
    ) -> Result<()> {
        self.store.write_run(run)?;

        let Some(ledger) = &self.services.ledger else {
            return Ok(());
        };
        let run_id = run.run_id.to_string();

        if let Err(e) = ledger.upsert_run(run).await {
            warn!(error = %e, "ledger run update failed");
        }
        if let Some(t) = transition {
            if let Err(e) = ledger
                .insert_stage_event(&run_id, t.stage, t.kind, t.stats, t.artifact, t.message)
                .await
            {
                warn!(stage = %t.stage, error = %e, "ledger stage event failed");
            }
        }
        if !diagnostics.is_empty() {
            if let Err(e) = ledger.insert_diagnostics(&run_id, diagnostics).await {
                warn!(error = %e, "ledger diagnostics insert failed");
            }
        }
        Ok(())
    }
}
