//! Persist stage: write the item's media graph to the store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::queue::{Item, Queue, TitleInfo, Trouble};
use crate::store::{MediaStore, NewEpisode, NewMovie, StoreError, Watchable};
use crate::workers::{StageTask, WorkerKey};

use super::RetryPolicy;

/// Worker task for the persist stage.
///
/// Converts the item into the persisted graph (movie, or episode with its
/// season and series) in a single store transaction. Transient and
/// foreign-key failures retry with backoff; unique-key violations park the
/// item for attention. Usually run single-threaded to serialize writes.
pub struct PersistTask {
    queue: Arc<Queue>,
    store: Arc<dyn MediaStore>,
    retry: RetryPolicy,
}

impl PersistTask {
    pub fn new(queue: Arc<Queue>, store: Arc<dyn MediaStore>) -> Self {
        Self::with_retry(queue, store, RetryPolicy::default())
    }

    pub fn with_retry(
        queue: Arc<Queue>,
        store: Arc<dyn MediaStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            store,
            retry,
        }
    }

    async fn save(&self, item: &Item) -> Result<uuid::Uuid, StoreError> {
        let metadata = item
            .metadata
            .known()
            .ok_or_else(|| StoreError::NotFound("item metadata".to_string()))?;
        let title = item
            .title
            .info()
            .ok_or_else(|| StoreError::NotFound("item title".to_string()))?;

        let watchable = Watchable {
            source_path: item.path.clone(),
            width: None,
            height: None,
        };

        match title {
            TitleInfo::Episode {
                season, episode, ..
            } => {
                let record = NewEpisode {
                    series_title: metadata.title.clone(),
                    series_tmdb_id: metadata.remote_id.clone(),
                    series_description: metadata.description.clone(),
                    series_poster_url: metadata.poster_url.clone(),
                    season_number: *season,
                    episode_number: *episode,
                    episode_title: format!(
                        "{} S{:02}E{:02}",
                        metadata.title, season, episode
                    ),
                    episode_tmdb_id: format!(
                        "{}/s{:02}e{:02}",
                        metadata.remote_id, season, episode
                    ),
                    genres: metadata.genres.clone(),
                    watchable,
                };
                self.store.save_episode(&record).await
            }
            TitleInfo::Movie { .. } => {
                let record = NewMovie {
                    title: metadata.title.clone(),
                    tmdb_id: metadata.remote_id.clone(),
                    description: metadata.description.clone(),
                    runtime_mins: metadata.runtime_mins,
                    release_year: metadata.release_year,
                    poster_url: metadata.poster_url.clone(),
                    genres: metadata.genres.clone(),
                    watchable,
                };
                self.store.save_movie(&record).await
            }
        }
    }
}

#[async_trait]
impl StageTask for PersistTask {
    fn key(&self) -> WorkerKey {
        WorkerKey::Persister
    }

    async fn run(&self, item: &Item) -> Result<(), Trouble> {
        if item.metadata.known().is_none() {
            return Err(Trouble::MetadataMiss);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.save(item).await {
                Ok(media_id) => {
                    debug!(item = %item.id, %media_id, "media graph persisted");
                    let _ = self.queue.set_media_id(item.id, media_id);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => match self.retry.delay_after_attempt(attempt) {
                    Some(delay) => {
                        warn!(item = %item.id, attempt, error = %e, "persist failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(Trouble::PersistFailed {
                            detail: format!("store unavailable after {attempt} attempts: {e}"),
                        });
                    }
                },
                Err(e) => {
                    warn!(item = %item.id, error = %e, "persist failed");
                    return Err(Trouble::PersistFailed {
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}
