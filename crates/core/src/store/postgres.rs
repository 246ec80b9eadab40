//! PostgreSQL-backed `MediaStore` implementation.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use std::path::PathBuf;

use crate::workflow::{FfmpegOptions, Target, Workflow};

use super::{
    MediaStore, Model, Movie, NewEpisode, NewMovie, OutputRecord, Series, StoreError, Watchable,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS series (
    uuid UUID PRIMARY KEY,
    title TEXT NOT NULL,
    tmdb_id TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    poster_url TEXT
);

CREATE TABLE IF NOT EXISTS seasons (
    uuid UUID PRIMARY KEY,
    series_uuid UUID NOT NULL REFERENCES series(uuid) ON DELETE CASCADE,
    number INTEGER NOT NULL,
    UNIQUE (series_uuid, number)
);

CREATE TABLE IF NOT EXISTS episodes (
    uuid UUID PRIMARY KEY,
    season_uuid UUID NOT NULL REFERENCES seasons(uuid) ON DELETE CASCADE,
    title TEXT NOT NULL,
    tmdb_id TEXT NOT NULL UNIQUE,
    number INTEGER NOT NULL,
    source_path TEXT NOT NULL,
    width INTEGER,
    height INTEGER
);

CREATE TABLE IF NOT EXISTS movies (
    uuid UUID PRIMARY KEY,
    title TEXT NOT NULL,
    tmdb_id TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    runtime_mins INTEGER,
    release_year INTEGER,
    poster_url TEXT,
    source_path TEXT NOT NULL,
    width INTEGER,
    height INTEGER
);

CREATE TABLE IF NOT EXISTS genres (
    uuid UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS media_genres (
    media_uuid UUID NOT NULL,
    genre_uuid UUID NOT NULL REFERENCES genres(uuid) ON DELETE CASCADE,
    UNIQUE (media_uuid, genre_uuid)
);

CREATE TABLE IF NOT EXISTS transcode_outputs (
    uuid UUID PRIMARY KEY,
    media_uuid UUID NOT NULL,
    target_label TEXT NOT NULL,
    output_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS targets (
    uuid UUID PRIMARY KEY,
    label TEXT NOT NULL UNIQUE,
    options TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflows (
    uuid UUID PRIMARY KEY,
    label TEXT NOT NULL UNIQUE,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    criteria TEXT NOT NULL,
    target_ids TEXT NOT NULL
);
"#;

/// Media store backed by a Postgres connection pool.
pub struct PostgresMediaStore {
    pool: PgPool,
}

impl PostgresMediaStore {
    /// Connect to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(map_err)?;
        info!("connected to media database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests with their own fixtures).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_genres(
        tx: &mut Transaction<'_, Postgres>,
        media_uuid: Uuid,
        genres: &[String],
    ) -> Result<(), StoreError> {
        for name in genres {
            // Insert-if-missing, then link.
            sqlx::query(
                "INSERT INTO genres (uuid, name) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .execute(&mut **tx)
            .await
            .map_err(map_err)?;

            let genre_uuid: Uuid = sqlx::query("SELECT uuid FROM genres WHERE name = $1")
                .bind(name)
                .fetch_one(&mut **tx)
                .await
                .map_err(map_err)?
                .try_get("uuid")
                .map_err(map_err)?;

            sqlx::query(
                "INSERT INTO media_genres (media_uuid, genre_uuid) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(media_uuid)
            .bind(genre_uuid)
            .execute(&mut **tx)
            .await
            .map_err(map_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStore for PostgresMediaStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn save_movie(&self, movie: &NewMovie) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let uuid: Uuid = sqlx::query(
            "INSERT INTO movies \
                 (uuid, title, tmdb_id, description, runtime_mins, release_year, poster_url, \
                  source_path, width, height) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (tmdb_id) DO UPDATE SET \
                 title = EXCLUDED.title, description = EXCLUDED.description, \
                 runtime_mins = EXCLUDED.runtime_mins, release_year = EXCLUDED.release_year, \
                 poster_url = EXCLUDED.poster_url, source_path = EXCLUDED.source_path \
             RETURNING uuid",
        )
        .bind(Uuid::new_v4())
        .bind(&movie.title)
        .bind(&movie.tmdb_id)
        .bind(&movie.description)
        .bind(movie.runtime_mins.map(|r| r as i32))
        .bind(movie.release_year.map(|y| y as i32))
        .bind(&movie.poster_url)
        .bind(movie.watchable.source_path.to_string_lossy().to_string())
        .bind(movie.watchable.width.map(|w| w as i32))
        .bind(movie.watchable.height.map(|h| h as i32))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?
        .try_get("uuid")
        .map_err(map_err)?;

        Self::upsert_genres(&mut tx, uuid, &movie.genres).await?;

        tx.commit().await.map_err(map_err)?;
        info!(title = %movie.title, %uuid, "persisted movie");
        Ok(uuid)
    }

    async fn save_episode(&self, episode: &NewEpisode) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let series_uuid: Uuid = sqlx::query(
            "INSERT INTO series (uuid, title, tmdb_id, description, poster_url) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tmdb_id) DO UPDATE SET \
                 title = EXCLUDED.title, description = EXCLUDED.description, \
                 poster_url = EXCLUDED.poster_url \
             RETURNING uuid",
        )
        .bind(Uuid::new_v4())
        .bind(&episode.series_title)
        .bind(&episode.series_tmdb_id)
        .bind(&episode.series_description)
        .bind(&episode.series_poster_url)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?
        .try_get("uuid")
        .map_err(map_err)?;

        let season_uuid: Uuid = sqlx::query(
            "INSERT INTO seasons (uuid, series_uuid, number) VALUES ($1, $2, $3) \
             ON CONFLICT (series_uuid, number) DO UPDATE SET number = EXCLUDED.number \
             RETURNING uuid",
        )
        .bind(Uuid::new_v4())
        .bind(series_uuid)
        .bind(episode.season_number as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?
        .try_get("uuid")
        .map_err(map_err)?;

        let episode_uuid: Uuid = sqlx::query(
            "INSERT INTO episodes \
                 (uuid, season_uuid, title, tmdb_id, number, source_path, width, height) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (tmdb_id) DO UPDATE SET \
                 title = EXCLUDED.title, source_path = EXCLUDED.source_path \
             RETURNING uuid",
        )
        .bind(Uuid::new_v4())
        .bind(season_uuid)
        .bind(&episode.episode_title)
        .bind(&episode.episode_tmdb_id)
        .bind(episode.episode_number as i32)
        .bind(episode.watchable.source_path.to_string_lossy().to_string())
        .bind(episode.watchable.width.map(|w| w as i32))
        .bind(episode.watchable.height.map(|h| h as i32))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?
        .try_get("uuid")
        .map_err(map_err)?;

        Self::upsert_genres(&mut tx, episode_uuid, &episode.genres).await?;

        tx.commit().await.map_err(map_err)?;
        info!(title = %episode.episode_title, %episode_uuid, "persisted episode");
        Ok(episode_uuid)
    }

    async fn record_outputs(
        &self,
        media_id: Uuid,
        outputs: &[OutputRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        for output in outputs {
            sqlx::query(
                "INSERT INTO transcode_outputs (uuid, media_uuid, target_label, output_path) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(media_id)
            .bind(&output.target_label)
            .bind(output.output_path.to_string_lossy().to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn get_movie(&self, tmdb_id: &str) -> Result<Option<Movie>, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, title, tmdb_id, description, runtime_mins, release_year, \
                    poster_url, source_path, width, height \
             FROM movies WHERE tmdb_id = $1",
        )
        .bind(tmdb_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let uuid: Uuid = row.try_get("uuid").map_err(map_err)?;

        let genre_rows = sqlx::query(
            "SELECT g.name FROM genres g \
             JOIN media_genres mg ON mg.genre_uuid = g.uuid \
             WHERE mg.media_uuid = $1 ORDER BY g.name",
        )
        .bind(uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        let genres = genre_rows
            .into_iter()
            .map(|r| r.try_get("name").map_err(map_err))
            .collect::<Result<Vec<String>, StoreError>>()?;

        let source_path: String = row.try_get("source_path").map_err(map_err)?;
        Ok(Some(Movie {
            model: Model {
                uuid,
                title: row.try_get("title").map_err(map_err)?,
                tmdb_id: row.try_get("tmdb_id").map_err(map_err)?,
            },
            watchable: Watchable {
                source_path: PathBuf::from(source_path),
                width: row
                    .try_get::<Option<i32>, _>("width")
                    .map_err(map_err)?
                    .map(|w| w as u32),
                height: row
                    .try_get::<Option<i32>, _>("height")
                    .map_err(map_err)?
                    .map(|h| h as u32),
            },
            description: row.try_get("description").map_err(map_err)?,
            runtime_mins: row
                .try_get::<Option<i32>, _>("runtime_mins")
                .map_err(map_err)?
                .map(|r| r as u32),
            release_year: row
                .try_get::<Option<i32>, _>("release_year")
                .map_err(map_err)?
                .map(|y| y as u32),
            poster_url: row.try_get("poster_url").map_err(map_err)?,
            genres,
        }))
    }

    async fn get_series(&self, tmdb_id: &str) -> Result<Option<Series>, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, title, tmdb_id, description, poster_url FROM series \
             WHERE tmdb_id = $1",
        )
        .bind(tmdb_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(match row {
            Some(row) => Some(Series {
                model: Model {
                    uuid: row.try_get("uuid").map_err(map_err)?,
                    title: row.try_get("title").map_err(map_err)?,
                    tmdb_id: row.try_get("tmdb_id").map_err(map_err)?,
                },
                description: row.try_get("description").map_err(map_err)?,
                poster_url: row.try_get("poster_url").map_err(map_err)?,
            }),
            None => None,
        })
    }

    async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        let rows = sqlx::query("SELECT uuid, label, options FROM targets ORDER BY label")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;

        rows.into_iter()
            .map(|row| {
                let options_json: String = row.try_get("options").map_err(map_err)?;
                let options: FfmpegOptions = serde_json::from_str(&options_json)
                    .map_err(|e| StoreError::Database(format!("corrupt target options: {e}")))?;
                Ok(Target {
                    id: row.try_get("uuid").map_err(map_err)?,
                    label: row.try_get("label").map_err(map_err)?,
                    options,
                })
            })
            .collect()
    }

    async fn save_target(&self, target: &Target) -> Result<(), StoreError> {
        let options = serde_json::to_string(&target.options)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query(
            "INSERT INTO targets (uuid, label, options) VALUES ($1, $2, $3) \
             ON CONFLICT (uuid) DO UPDATE SET label = EXCLUDED.label, \
             options = EXCLUDED.options",
        )
        .bind(target.id)
        .bind(&target.label)
        .bind(options)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn delete_target(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM targets WHERE uuid = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows =
            sqlx::query("SELECT uuid, label, enabled, criteria, target_ids FROM workflows")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        rows.into_iter()
            .map(|row| {
                let criteria_json: String = row.try_get("criteria").map_err(map_err)?;
                let targets_json: String = row.try_get("target_ids").map_err(map_err)?;
                Ok(Workflow {
                    id: row.try_get("uuid").map_err(map_err)?,
                    label: row.try_get("label").map_err(map_err)?,
                    enabled: row.try_get("enabled").map_err(map_err)?,
                    criteria: serde_json::from_str(&criteria_json)
                        .map_err(|e| StoreError::Database(format!("corrupt criteria: {e}")))?,
                    target_ids: serde_json::from_str(&targets_json)
                        .map_err(|e| StoreError::Database(format!("corrupt target ids: {e}")))?,
                })
            })
            .collect()
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        // Malformed criteria never reach the database.
        workflow
            .validate()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let criteria = serde_json::to_string(&workflow.criteria)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let target_ids = serde_json::to_string(&workflow.target_ids)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO workflows (uuid, label, enabled, criteria, target_ids) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (uuid) DO UPDATE SET label = EXCLUDED.label, \
             enabled = EXCLUDED.enabled, criteria = EXCLUDED.criteria, \
             target_ids = EXCLUDED.target_ids",
        )
        .bind(workflow.id)
        .bind(&workflow.label)
        .bind(workflow.enabled)
        .bind(criteria)
        .bind(target_ids)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM workflows WHERE uuid = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("workflow {id}")));
        }
        Ok(())
    }
}

/// Map sqlx failures onto the store taxonomy.
fn map_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            Some("23503") => StoreError::FkViolation {
                table: db.table().unwrap_or("unknown").to_string(),
            },
            // Serialization failure / deadlock detected.
            Some("40001") | Some("40P01") => StoreError::Transient(db.to_string()),
            _ => StoreError::Database(db.to_string()),
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(e.to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        _ => StoreError::Database(e.to_string()),
    }
}
