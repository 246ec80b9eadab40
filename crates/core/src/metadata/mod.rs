//! Metadata lookup for queued items.
//!
//! The pipeline consumes the [`MetadataFetcher`] trait; the bundled
//! implementation talks to the OMDb HTTP API.

mod omdb;
mod types;

pub use omdb::{OmdbConfig, OmdbFetcher};
pub use types::{FetchError, LookupResult, Metadata, MetadataStub};

use async_trait::async_trait;

use crate::queue::TitleInfo;

/// Looks up media details for a parsed title.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Name of this fetcher implementation.
    fn name(&self) -> &str;

    /// Search for metadata matching a parsed title.
    async fn lookup(&self, title: &TitleInfo) -> Result<LookupResult, FetchError>;

    /// Fetch metadata for a specific remote id (used when an ambiguous
    /// lookup has been resolved externally).
    async fn lookup_by_id(&self, remote_id: &str) -> Result<Metadata, FetchError>;
}
