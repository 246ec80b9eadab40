//! OMDb API client.
//!
//! OMDb requires an API key. Searches use the `s=` endpoint; detail
//! lookups use `i=` (by IMDb id) with full plot.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{FetchError, LookupResult, Metadata, MetadataStub};
use super::MetadataFetcher;
use crate::queue::TitleInfo;

/// OMDb client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmdbConfig {
    /// OMDb API key (required).
    pub api_key: String,
    /// Base URL (default: https://www.omdbapi.com).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// OMDb-backed metadata fetcher.
pub struct OmdbFetcher {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OmdbFetcher {
    /// Create a new OMDb fetcher.
    pub fn new(config: OmdbConfig) -> Result<Self, FetchError> {
        if config.api_key.is_empty() {
            return Err(FetchError::NotConfigured(
                "OMDb API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let base_url = config
            .base_url
            .unwrap_or_else(|| "https://www.omdbapi.com".to_string());

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("apikey", self.api_key.as_str())])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if status == 401 {
            return Err(FetchError::NotConfigured("invalid OMDb API key".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }

    fn media_type(title: &TitleInfo) -> &'static str {
        if title.is_episodic() {
            "series"
        } else {
            "movie"
        }
    }
}

#[async_trait]
impl MetadataFetcher for OmdbFetcher {
    fn name(&self) -> &str {
        "omdb"
    }

    async fn lookup(&self, title: &TitleInfo) -> Result<LookupResult, FetchError> {
        let query = title.title().replace('.', " ");
        debug!(query = %query, episodic = title.is_episodic(), "OMDb search");

        let mut params = vec![
            ("s", query.clone()),
            ("type", Self::media_type(title).to_string()),
        ];
        if let Some(year) = title.year() {
            params.push(("y", year.to_string()));
        }

        let search: OmdbSearchResponse = self.get(&params).await?;

        if search.response == "False" {
            // OMDb reports "Movie not found!" as a soft failure.
            return Ok(LookupResult::Miss);
        }

        let mut results = search.search.unwrap_or_default();
        match results.len() {
            0 => Ok(LookupResult::Miss),
            1 => {
                let only = results.remove(0);
                let metadata = self.lookup_by_id(&only.imdb_id).await?;
                Ok(LookupResult::Hit(metadata))
            }
            _ => Ok(LookupResult::Ambiguous(
                results.into_iter().map(MetadataStub::from).collect(),
            )),
        }
    }

    async fn lookup_by_id(&self, remote_id: &str) -> Result<Metadata, FetchError> {
        debug!(id = %remote_id, "OMDb detail lookup");

        let detail: OmdbDetailResponse = self
            .get(&[("i", remote_id.to_string()), ("plot", "full".to_string())])
            .await?;

        if detail.response == "False" {
            return Err(FetchError::NotFound(remote_id.to_string()));
        }

        Ok(detail.into())
    }
}

#[derive(Debug, Deserialize)]
struct OmdbSearchResponse {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Search")]
    search: Option<Vec<OmdbSearchResult>>,
}

#[derive(Debug, Deserialize)]
struct OmdbSearchResult {
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "Year")]
    year: String,
    #[serde(rename = "imdbID")]
    imdb_id: String,
    #[serde(rename = "Poster")]
    poster: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OmdbDetailResponse {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Title", default)]
    title: String,
    #[serde(rename = "Plot", default)]
    plot: String,
    #[serde(rename = "Runtime", default)]
    runtime: String,
    #[serde(rename = "Year", default)]
    year: String,
    #[serde(rename = "Genre", default)]
    genre: String,
    #[serde(rename = "Poster")]
    poster: Option<String>,
    #[serde(rename = "imdbID", default)]
    imdb_id: String,
}

/// Parse OMDb's "123 min" runtime format.
fn parse_runtime(raw: &str) -> Option<u32> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Parse OMDb's year, which may be a range like "2008-2013" for series.
fn parse_year(raw: &str) -> Option<u32> {
    raw.split(['-', '–']).next()?.trim().parse().ok()
}

fn parse_poster(poster: Option<String>) -> Option<String> {
    poster.filter(|p| !p.is_empty() && p != "N/A")
}

impl From<OmdbSearchResult> for MetadataStub {
    fn from(r: OmdbSearchResult) -> Self {
        MetadataStub {
            id: r.imdb_id,
            title: r.title,
            year: parse_year(&r.year),
            poster_url: parse_poster(r.poster),
        }
    }
}

impl From<OmdbDetailResponse> for Metadata {
    fn from(r: OmdbDetailResponse) -> Self {
        let genres = r
            .genre
            .split(',')
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty() && g != "N/A")
            .collect();

        Metadata {
            remote_id: r.imdb_id,
            title: r.title,
            description: if r.plot == "N/A" { String::new() } else { r.plot },
            runtime_mins: parse_runtime(&r.runtime),
            release_year: parse_year(&r.year),
            genres,
            poster_url: parse_poster(r.poster),
        }
    }
}
