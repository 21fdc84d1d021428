//! Search API polling source.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{AnnotationFetcher, AnnotationStream, FetchError};
use crate::api::{AnnotationApi, SearchParams};
use crate::models::Annotation;

/// Number of newest annotations requested per poll.
pub const DEFAULT_PAGE_SIZE: usize = 200;
/// Search attempts per poll before giving up on the cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Polls the newest page of the search API.
///
/// The search API cannot filter by date, so the watermark is ignored and
/// each poll re-reads the newest page; already-indexed annotations are
/// skipped downstream by their markers.
pub struct PollingFetcher {
    api: Arc<dyn AnnotationApi>,
    page_size: usize,
    max_attempts: u32,
}

impl PollingFetcher {
    pub fn new(api: Arc<dyn AnnotationApi>) -> Self {
        Self {
            api,
            page_size: DEFAULT_PAGE_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fetch the newest page, oldest first. Failures yield an empty page.
    async fn poll(&self) -> Vec<Annotation> {
        let params = SearchParams::newest_first(0, self.page_size);

        let mut rows = None;
        for attempt in 1..=self.max_attempts {
            match self.api.search(&params).await {
                Ok(page) => {
                    rows = Some(page.rows);
                    break;
                }
                Err(e) => warn!("Search failed (attempt {}/{}): {}", attempt, self.max_attempts, e),
            }
        }

        let Some(rows) = rows else {
            warn!(
                "Giving up on search after {} attempts, skipping this cycle",
                self.max_attempts
            );
            return Vec::new();
        };

        let mut annotations: Vec<Annotation> = rows
            .iter()
            .filter_map(|row| match Annotation::from_api_row(row) {
                Ok(ann) => Some(ann),
                Err(e) => {
                    warn!("Skipping undecodable search row: {}", e);
                    None
                }
            })
            .collect();
        annotations.sort_by(|a, b| a.created.cmp(&b.created));

        debug!("Polled {} annotations from search API", annotations.len());
        annotations
    }
}

impl AnnotationFetcher for PollingFetcher {
    fn name(&self) -> &'static str {
        "search-api"
    }

    fn added_since<'a>(&'a self, _watermark: Option<&'a str>) -> AnnotationStream<'a> {
        stream::once(self.poll())
            .flat_map(|annotations| {
                stream::iter(annotations.into_iter().map(Ok::<_, FetchError>))
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::TryStreamExt;
    use serde_json::{json, Value};

    use crate::api::{ApiError, SearchResponse};
    use crate::models::{Group, Profile};

    /// Replays scripted search outcomes, failing once the script runs out.
    struct ScriptedApi {
        outcomes: Mutex<VecDeque<Result<SearchResponse, ApiError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn new(outcomes: Vec<Result<SearchResponse, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl AnnotationApi for ScriptedApi {
        async fn search(&self, _params: &SearchParams) -> Result<SearchResponse, ApiError> {
            *self.calls.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::MissingRoute("search".into())))
        }

        async fn profile(&self, _auth: Option<&str>) -> Result<Profile, ApiError> {
            Ok(Profile::default())
        }

        async fn groups(&self, _auth: Option<&str>) -> Result<Vec<Group>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn row(id: &str, created: &str) -> Value {
        json!({
            "id": id,
            "user": "acct:alice@x.test",
            "group": "__world__",
            "created": created,
            "target": [{"source": "https://x.test/p"}],
            "permissions": {"read": ["group:__world__"]}
        })
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            method: "GET",
            url: "http://h.test/api/search".into(),
            status: 503,
        }
    }

    #[tokio::test]
    async fn yields_oldest_first() {
        let api = ScriptedApi::new(vec![Ok(SearchResponse {
            rows: vec![row("c", "2018-01-03"), row("b", "2018-01-02"), row("a", "2018-01-01")],
            total: 3,
        })]);
        let fetcher = PollingFetcher::new(api.clone());

        let anns: Vec<Annotation> = fetcher.added_since(None).try_collect().await.unwrap();
        let ids: Vec<&str> = anns.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let api = ScriptedApi::new(vec![
            Err(unavailable()),
            Err(unavailable()),
            Ok(SearchResponse {
                rows: vec![row("a", "2018-01-01")],
                total: 1,
            }),
        ]);
        let fetcher = PollingFetcher::new(api.clone());

        let anns: Vec<Annotation> = fetcher.added_since(Some("ignored")).try_collect().await.unwrap();
        assert_eq!(anns.len(), 1);
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let api = ScriptedApi::new(vec![Err(unavailable()), Err(unavailable()), Err(unavailable())]);
        let fetcher = PollingFetcher::new(api.clone());

        let anns: Vec<Annotation> = fetcher.added_since(None).try_collect().await.unwrap();
        assert!(anns.is_empty());
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn skips_undecodable_rows() {
        let api = ScriptedApi::new(vec![Ok(SearchResponse {
            rows: vec![row("a", "2018-01-01"), json!({"id": "broken"})],
            total: 2,
        })]);
        let fetcher = PollingFetcher::new(api);

        let anns: Vec<Annotation> = fetcher.added_since(None).try_collect().await.unwrap();
        assert_eq!(anns.len(), 1);
    }

    #[tokio::test]
    async fn has_no_deletion_feed() {
        let fetcher = PollingFetcher::new(ScriptedApi::new(Vec::new()));
        let deleted: Vec<String> = fetcher.deleted_since(None).try_collect().await.unwrap();
        assert!(deleted.is_empty());
        assert!(!fetcher.supports_deletions());
    }
}
