//! Bounded worker pool fanning entity searches out and back in.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, instrument};

use newsfeed_shared::{Entity, NewsfeedError, SearchResult};

use crate::runner::EntityTaskRunner;

/// Runs one [`EntityTaskRunner`] per entity with at most `concurrency`
/// searches in flight. Results come back in entity-list order.
pub struct ConcurrentDispatcher {
    runner: Arc<EntityTaskRunner>,
}

impl ConcurrentDispatcher {
    pub fn new(runner: Arc<EntityTaskRunner>) -> Self {
        Self { runner }
    }

    /// Search every entity and wait for all of them. Output length and
    /// order match `entities`; each slot holds either items or an error.
    pub async fn dispatch_all(&self, entities: &[Entity], concurrency: usize) -> Vec<SearchResult> {
        self.dispatch_with(entities, concurrency, |_, _, _| {}).await
    }

    /// Like [`dispatch_all`](Self::dispatch_all), calling `on_result` with
    /// `(result, completed, total)` as each entity finishes.
    #[instrument(skip_all, fields(entities = entities.len(), concurrency = concurrency))]
    pub async fn dispatch_with<F>(
        &self,
        entities: &[Entity],
        concurrency: usize,
        mut on_result: F,
    ) -> Vec<SearchResult>
    where
        F: FnMut(&SearchResult, usize, usize),
    {
        let total = entities.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = concurrency.clamp(1, total);

        let queue: Arc<Mutex<VecDeque<(usize, Entity)>>> =
            Arc::new(Mutex::new(entities.iter().cloned().enumerate().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, SearchResult)>();

        info!(workers, "dispatching entity searches");

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = queue.clone();
            let tx = tx.clone();
            let runner = self.runner.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, entity)) = next else {
                        break;
                    };
                    let result = runner.run(&entity).await;
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        // Fan-in: the channel closes once every worker has exited.
        let mut slots: Vec<Option<SearchResult>> = vec![None; total];
        let mut completed = 0;
        while let Some((index, result)) = rx.recv().await {
            completed += 1;
            on_result(&result, completed, total);
            slots[index] = Some(result);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "search worker aborted");
            }
        }

        let results: Vec<SearchResult> = slots
            .into_iter()
            .zip(entities)
            .map(|(slot, entity)| {
                slot.unwrap_or_else(|| {
                    let err = NewsfeedError::provider_fatal("search task ended without a result");
                    SearchResult::failed(entity.clone(), &err)
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            succeeded = total - failed,
            failed,
            "entity searches complete"
        );
        results
    }
}
