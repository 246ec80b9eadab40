//! Mock metadata fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::metadata::{FetchError, LookupResult, Metadata, MetadataFetcher};
use crate::queue::TitleInfo;

/// Scriptable fetcher: responses keyed by title, id lookups keyed by
/// remote id, and a counter of transport failures to inject first.
#[derive(Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, LookupResult>>,
    by_id: Mutex<HashMap<String, Metadata>>,
    lookups: Mutex<Vec<String>>,
    /// Number of upcoming calls that fail with a transport error.
    transport_failures: AtomicU32,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the response for a title.
    pub fn set_response(&self, title: impl Into<String>, result: LookupResult) {
        self.responses.lock().unwrap().insert(title.into(), result);
    }

    /// Script an id-based lookup (used after ambiguity resolution).
    pub fn set_by_id(&self, id: impl Into<String>, metadata: Metadata) {
        self.by_id.lock().unwrap().insert(id.into(), metadata);
    }

    /// Fail the next `count` calls with a transport error.
    pub fn fail_transport(&self, count: u32) {
        self.transport_failures.store(count, Ordering::SeqCst);
    }

    /// Titles and ids looked up so far.
    pub fn recorded_lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }

    fn take_transport_failure(&self) -> bool {
        self.transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// A convenient fully-populated metadata record.
    pub fn sample_metadata(remote_id: &str, title: &str) -> Metadata {
        Metadata {
            remote_id: remote_id.to_string(),
            title: title.to_string(),
            description: format!("{title} description"),
            runtime_mins: Some(45),
            release_year: Some(2010),
            genres: vec!["Drama".to_string()],
            poster_url: None,
        }
    }
}

#[async_trait]
impl MetadataFetcher for MockFetcher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn lookup(&self, title: &TitleInfo) -> Result<LookupResult, FetchError> {
        self.lookups.lock().unwrap().push(title.title().to_string());
        if self.take_transport_failure() {
            return Err(FetchError::Transport("connection refused".to_string()));
        }
        match self.responses.lock().unwrap().get(title.title()) {
            Some(result) => Ok(result.clone()),
            None => Ok(LookupResult::Miss),
        }
    }

    async fn lookup_by_id(&self, remote_id: &str) -> Result<Metadata, FetchError> {
        self.lookups.lock().unwrap().push(remote_id.to_string());
        if self.take_transport_failure() {
            return Err(FetchError::Transport("connection refused".to_string()));
        }
        self.by_id
            .lock()
            .unwrap()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(remote_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title() -> TitleInfo {
        TitleInfo::Movie {
            title: "Inception".into(),
            year: 2010,
        }
    }

    #[tokio::test]
    async fn test_scripted_hit() {
        let fetcher = MockFetcher::new();
        let metadata = MockFetcher::sample_metadata("tt1375666", "Inception");
        fetcher.set_response("Inception", LookupResult::Hit(metadata.clone()));

        let result = fetcher.lookup(&title()).await.unwrap();
        assert_eq!(result, LookupResult::Hit(metadata));
        assert_eq!(fetcher.recorded_lookups(), vec!["Inception"]);
    }

    #[tokio::test]
    async fn test_unscripted_title_is_miss() {
        let fetcher = MockFetcher::new();
        assert_eq!(fetcher.lookup(&title()).await.unwrap(), LookupResult::Miss);
    }

    #[tokio::test]
    async fn test_transport_failures_then_recovery() {
        let fetcher = MockFetcher::new();
        fetcher.set_response(
            "Inception",
            LookupResult::Hit(MockFetcher::sample_metadata("tt1", "Inception")),
        );
        fetcher.fail_transport(2);

        assert!(fetcher.lookup(&title()).await.is_err());
        assert!(fetcher.lookup(&title()).await.is_err());
        assert!(fetcher.lookup(&title()).await.is_ok());
    }
}
