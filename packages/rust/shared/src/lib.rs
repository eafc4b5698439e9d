//! Shared types, error model, and configuration for the news feed pipeline.
//!
//! This crate is the foundation depended on by all other newsfeed crates.
//! It provides:
//! - [`NewsfeedError`], the unified error type
//! - Domain types ([`Entity`], [`SearchResult`], [`StageItem`], [`SummaryReport`])
//! - The run record ([`PipelineRun`], [`RunStatus`], [`Diagnostic`])
//! - Configuration ([`AppConfig`], config and entity loading)

pub mod config;
pub mod error;
pub mod retry;
pub mod run;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DeliveryConfig, FilterConfig, RateLimitConfig, RateLimitMode, RetryConfig,
    RunConfig, SearchConfig, TransformConfig, config_dir, config_file_path, init_config,
    is_email, load_config, load_config_from, load_entities, parse_config, require_api_key,
};
pub use error::{Boundary, NewsfeedError, Result};
pub use retry::RetryPolicy;
pub use run::{Diagnostic, PipelineRun, RunId, RunStatus, StageStats};
pub use types::{
    ArticleItem, ArticleRef, Citation, DeliveryReceipt, EnrichedArticle, Entity, ErrorInfo,
    NewsContext, ReportSection, Score, ScoredArticle, SearchResult, SourceRef, StageItem,
    StageName, SummaryReport, ensure_unique_sources, validate_entities,
};
