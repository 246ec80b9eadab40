//! Metadata domain types and fetcher errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Full metadata for a piece of media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identity in the remote database.
    pub remote_id: String,
    pub title: String,
    pub description: String,
    /// Runtime in minutes, when the provider reports one.
    pub runtime_mins: Option<u32>,
    pub release_year: Option<u32>,
    pub genres: Vec<String>,
    pub poster_url: Option<String>,
}

/// A candidate offered by an ambiguous lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataStub {
    /// Remote id to pass back for resolution.
    pub id: String,
    pub title: String,
    pub year: Option<u32>,
    pub poster_url: Option<String>,
}

/// Outcome of a successful fetcher round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    /// Exactly one confident match.
    Hit(Metadata),
    /// Several plausible matches; an external choice is required.
    Ambiguous(Vec<MetadataStub>),
    /// The provider knows nothing for this title.
    Miss,
}

/// Errors from a metadata fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure; retryable with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider rejected the request.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The provider is missing required configuration (e.g. API key).
    #[error("fetcher not configured: {0}")]
    NotConfigured(String),

    /// The provider's response could not be decoded.
    #[error("failed to parse provider response: {0}")]
    Parse(String),

    /// The requested remote id does not exist.
    #[error("remote id not found: {0}")]
    NotFound(String),
}

impl FetchError {
    /// Whether the metadata stage should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transport(e.to_string())
    }
}
