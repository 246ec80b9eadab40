//! In-memory media store.

use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::{
    MediaStore, Model, Movie, NewEpisode, NewMovie, OutputRecord, Series, StoreError,
};
use crate::workflow::{Target, Workflow};

/// A saved movie with its assigned identity.
#[derive(Debug, Clone)]
pub struct SavedMovie {
    pub id: Uuid,
    pub record: NewMovie,
}

/// A saved episode with its assigned identity.
#[derive(Debug, Clone)]
pub struct SavedEpisode {
    pub id: Uuid,
    pub record: NewEpisode,
}

/// In-memory implementation of [`MediaStore`] with error injection.
#[derive(Default)]
pub struct MockStore {
    movies: Mutex<Vec<SavedMovie>>,
    episodes: Mutex<Vec<SavedEpisode>>,
    outputs: Mutex<Vec<(Uuid, OutputRecord)>>,
    targets: Mutex<Vec<Target>>,
    workflows: Mutex<Vec<Workflow>>,
    next_error: Mutex<Option<StoreError>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next store call with this error.
    pub fn set_next_error(&self, error: StoreError) {
        *self.next_error.lock().unwrap() = Some(error);
    }

    fn take_error(&self) -> Option<StoreError> {
        self.next_error.lock().unwrap().take()
    }

    pub fn saved_movies(&self) -> Vec<SavedMovie> {
        self.movies.lock().unwrap().clone()
    }

    pub fn saved_episodes(&self) -> Vec<SavedEpisode> {
        self.episodes.lock().unwrap().clone()
    }

    pub fn recorded_outputs(&self) -> Vec<(Uuid, OutputRecord)> {
        self.outputs.lock().unwrap().clone()
    }

    /// Seed a target the orchestrator will load at startup.
    pub fn seed_target(&self, target: Target) {
        self.targets.lock().unwrap().push(target);
    }

    /// Seed a workflow the orchestrator will load at startup.
    pub fn seed_workflow(&self, workflow: Workflow) {
        self.workflows.lock().unwrap().push(workflow);
    }
}

#[async_trait]
impl MediaStore for MockStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        match self.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn save_movie(&self, movie: &NewMovie) -> Result<Uuid, StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        let mut movies = self.movies.lock().unwrap();
        // Saving the same tmdb id again keeps the original identity.
        if let Some(existing) = movies.iter_mut().find(|m| m.record.tmdb_id == movie.tmdb_id) {
            existing.record = movie.clone();
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        movies.push(SavedMovie {
            id,
            record: movie.clone(),
        });
        Ok(id)
    }

    async fn save_episode(&self, episode: &NewEpisode) -> Result<Uuid, StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        let mut episodes = self.episodes.lock().unwrap();
        if let Some(existing) = episodes
            .iter_mut()
            .find(|e| e.record.episode_tmdb_id == episode.episode_tmdb_id)
        {
            existing.record = episode.clone();
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        episodes.push(SavedEpisode {
            id,
            record: episode.clone(),
        });
        Ok(id)
    }

    async fn record_outputs(
        &self,
        media_id: Uuid,
        outputs: &[OutputRecord],
    ) -> Result<(), StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        let mut recorded = self.outputs.lock().unwrap();
        for output in outputs {
            recorded.push((media_id, output.clone()));
        }
        Ok(())
    }

    async fn get_movie(&self, tmdb_id: &str) -> Result<Option<Movie>, StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        Ok(self
            .movies
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.record.tmdb_id == tmdb_id)
            .map(|m| Movie {
                model: Model {
                    uuid: m.id,
                    title: m.record.title.clone(),
                    tmdb_id: m.record.tmdb_id.clone(),
                },
                watchable: m.record.watchable.clone(),
                description: m.record.description.clone(),
                runtime_mins: m.record.runtime_mins,
                release_year: m.record.release_year,
                poster_url: m.record.poster_url.clone(),
                genres: m.record.genres.clone(),
            }))
    }

    async fn get_series(&self, tmdb_id: &str) -> Result<Option<Series>, StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        Ok(self
            .episodes
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.record.series_tmdb_id == tmdb_id)
            .map(|e| Series {
                model: Model {
                    uuid: Uuid::new_v4(),
                    title: e.record.series_title.clone(),
                    tmdb_id: e.record.series_tmdb_id.clone(),
                },
                description: e.record.series_description.clone(),
                poster_url: e.record.series_poster_url.clone(),
            }))
    }

    async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        match self.take_error() {
            Some(e) => Err(e),
            None => Ok(self.targets.lock().unwrap().clone()),
        }
    }

    async fn save_target(&self, target: &Target) -> Result<(), StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        let mut targets = self.targets.lock().unwrap();
        targets.retain(|t| t.id != target.id);
        targets.push(target.clone());
        Ok(())
    }

    async fn delete_target(&self, id: Uuid) -> Result<(), StoreError> {
        let mut targets = self.targets.lock().unwrap();
        let before = targets.len();
        targets.retain(|t| t.id != id);
        if targets.len() == before {
            return Err(StoreError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        match self.take_error() {
            Some(e) => Err(e),
            None => Ok(self.workflows.lock().unwrap().clone()),
        }
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        if let Some(e) = self.take_error() {
            return Err(e);
        }
        let mut workflows = self.workflows.lock().unwrap();
        workflows.retain(|w| w.id != workflow.id);
        workflows.push(workflow.clone());
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let mut workflows = self.workflows.lock().unwrap();
        let before = workflows.len();
        workflows.retain(|w| w.id != id);
        if workflows.len() == before {
            return Err(StoreError::NotFound(format!("workflow {id}")));
        }
        Ok(())
    }
}
