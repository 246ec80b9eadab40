//! Persisted media graph.
//!
//! The pipeline consumes the [`MediaStore`] trait; a Postgres-backed
//! implementation lives in [`postgres`]. Multi-entity writes (episode +
//! season + series + genres) happen inside a single transaction in the
//! implementation.

mod postgres;

pub use postgres::PostgresMediaStore;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::{Target, Workflow};

/// Shared identity embedded in every persisted media entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Local identity, generated on first save.
    pub uuid: Uuid,
    pub title: String,
    /// External database identity; unique across the store.
    pub tmdb_id: String,
}

/// Source-file attributes shared by watchable entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watchable {
    pub source_path: PathBuf,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A persisted movie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub model: Model,
    pub watchable: Watchable,
    pub description: String,
    pub runtime_mins: Option<u32>,
    pub release_year: Option<u32>,
    pub poster_url: Option<String>,
    pub genres: Vec<String>,
}

/// A persisted series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub model: Model,
    pub description: String,
    pub poster_url: Option<String>,
}

/// A persisted season, referencing its series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub uuid: Uuid,
    pub series_uuid: Uuid,
    pub number: u32,
}

/// A persisted episode, referencing its season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub model: Model,
    pub watchable: Watchable,
    pub season_uuid: Uuid,
    pub number: u32,
}

/// A standalone movie to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMovie {
    pub title: String,
    pub tmdb_id: String,
    pub description: String,
    pub runtime_mins: Option<u32>,
    pub release_year: Option<u32>,
    pub poster_url: Option<String>,
    pub genres: Vec<String>,
    pub watchable: Watchable,
}

/// An episode to persist, together with its series/season linkage. The
/// series and season are created on first reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEpisode {
    pub series_title: String,
    pub series_tmdb_id: String,
    pub series_description: String,
    pub series_poster_url: Option<String>,
    pub season_number: u32,
    pub episode_number: u32,
    pub episode_title: String,
    pub episode_tmdb_id: String,
    pub genres: Vec<String>,
    pub watchable: Watchable,
}

/// One transcode output produced for a persisted media entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub target_label: String,
    pub output_path: PathBuf,
}

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique key (e.g. tmdb_id) was violated.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// A foreign key was violated; carries the offending table.
    #[error("foreign key violation on table {table}")]
    FkViolation { table: String },

    /// Transient failure (connection, deadlock); retryable.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Any other database failure.
    #[error("store error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether the persist stage should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transient(_) | StoreError::FkViolation { .. }
        )
    }
}

/// CRUD surface over the persisted media graph.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Create tables if they do not exist.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Persist a movie and its genres in one transaction, returning the
    /// movie's local identity. Saving the same `tmdb_id` twice updates in
    /// place and keeps the original uuid.
    async fn save_movie(&self, movie: &NewMovie) -> Result<Uuid, StoreError>;

    /// Persist an episode, creating its season and series as needed, all in
    /// one transaction. Returns the episode's local identity.
    async fn save_episode(&self, episode: &NewEpisode) -> Result<Uuid, StoreError>;

    /// Record transcode outputs against a persisted media entity.
    async fn record_outputs(
        &self,
        media_id: Uuid,
        outputs: &[OutputRecord],
    ) -> Result<(), StoreError>;

    /// Fetch a movie by its external identity.
    async fn get_movie(&self, tmdb_id: &str) -> Result<Option<Movie>, StoreError>;

    /// Fetch a series by its external identity.
    async fn get_series(&self, tmdb_id: &str) -> Result<Option<Series>, StoreError>;

    async fn list_targets(&self) -> Result<Vec<Target>, StoreError>;
    async fn save_target(&self, target: &Target) -> Result<(), StoreError>;
    async fn delete_target(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Transient("connection reset".into()).is_retryable());
        assert!(StoreError::FkViolation {
            table: "seasons".into()
        }
        .is_retryable());
        assert!(!StoreError::UniqueViolation {
            constraint: "movies_tmdb_id_key".into()
        }
        .is_retryable());
        assert!(!StoreError::NotFound("movie".into()).is_retryable());
    }
}
