//! Metadata stage: enrich an item from the external movie database.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::metadata::{FetchError, LookupResult, Metadata, MetadataFetcher};
use crate::queue::{Item, MetadataState, Queue, Trouble};
use crate::workers::{StageTask, WorkerKey};

use super::RetryPolicy;

/// Worker task for the metadata stage.
///
/// Transport failures retry with exponential backoff; once the attempt
/// budget is spent the item parks in `NeedsAttention`. Ambiguous lookups
/// park in `NeedsResolving` carrying the candidate stubs; an external
/// resolution pins the chosen stub id, which the next pass looks up
/// directly.
pub struct MetadataTask {
    queue: Arc<Queue>,
    fetcher: Arc<dyn MetadataFetcher>,
    retry: RetryPolicy,
}

impl MetadataTask {
    pub fn new(queue: Arc<Queue>, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self::with_retry(queue, fetcher, RetryPolicy::default())
    }

    pub fn with_retry(
        queue: Arc<Queue>,
        fetcher: Arc<dyn MetadataFetcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            fetcher,
            retry,
        }
    }

    async fn with_backoff<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T, Trouble>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    match self.retry.delay_after_attempt(attempt) {
                        Some(delay) => {
                            warn!(attempt, error = %e, "metadata lookup failed; retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(attempt, error = %e, "metadata provider unreachable; parking item");
                            return Err(Trouble::MetadataUnavailable { attempts: attempt });
                        }
                    }
                }
                Err(FetchError::NotFound(_)) => return Err(Trouble::MetadataMiss),
                Err(e) => {
                    warn!(error = %e, "metadata lookup failed");
                    return Err(Trouble::MetadataUnavailable { attempts: attempt });
                }
            }
        }
    }

    fn record_hit(&self, item: &Item, metadata: Metadata) {
        debug!(item = %item.id, title = %metadata.title, "metadata resolved");
        let _ = self
            .queue
            .set_metadata(item.id, MetadataState::Known(metadata));
    }
}

#[async_trait]
impl StageTask for MetadataTask {
    fn key(&self) -> WorkerKey {
        WorkerKey::MetadataLookup
    }

    async fn run(&self, item: &Item) -> Result<(), Trouble> {
        let Some(title) = item.title.info().cloned() else {
            return Err(Trouble::UnparsableTitle);
        };

        // A previously resolved ambiguity pins the lookup to one stub.
        if let MetadataState::Resolved { stub_id } = &item.metadata {
            let stub_id = stub_id.clone();
            let metadata = self
                .with_backoff(|| self.fetcher.lookup_by_id(&stub_id))
                .await?;
            self.record_hit(item, metadata);
            return Ok(());
        }

        let result = self.with_backoff(|| self.fetcher.lookup(&title)).await?;

        match result {
            LookupResult::Hit(metadata) => {
                self.record_hit(item, metadata);
                Ok(())
            }
            LookupResult::Ambiguous(stubs) => {
                let _ = self.queue.set_metadata(
                    item.id,
                    MetadataState::Ambiguous {
                        stubs: stubs.clone(),
                    },
                );
                Err(Trouble::MetadataAmbiguous { stubs })
            }
            LookupResult::Miss => Err(Trouble::MetadataMiss),
        }
    }
}
