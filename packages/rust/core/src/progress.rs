//! Progress callbacks for the CLI spinner and headless runs.

use newsfeed_shared::{PipelineRun, StageName};

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage starts.
    fn phase(&self, stage: StageName);
    /// Called as each entity search finishes.
    fn entity_searched(&self, entity: &str, ok: bool, current: usize, total: usize);
    /// Called as each item of a transform stage finishes.
    fn item_processed(&self, stage: StageName, current: usize, total: usize);
    /// Called when the run reaches a terminal state.
    fn done(&self, run: &PipelineRun);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _stage: StageName) {}
    fn entity_searched(&self, _entity: &str, _ok: bool, _current: usize, _total: usize) {}
    fn item_processed(&self, _stage: StageName, _current: usize, _total: usize) {}
    fn done(&self, _run: &PipelineRun) {}
}
