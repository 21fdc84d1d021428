//! Incremental indexer.
//!
//! Converts the upstream change feed into counter mutations:
//!
//! - `ann|{id}` => scope key the annotation was counted under
//! - `count|{scope key}` => number of annotations in that scope
//! - `indexer|last_indexed_date` => creation time of the newest indexed annotation
//!
//! The marker makes indexing idempotent, so replaying part of the feed after
//! a crash or a retry never double counts.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::fetcher::{AnnotationFetcher, FetchError};
use crate::models::Annotation;
use crate::scope::{count_key, marker_key, scope_key_for_annotation, WATERMARK_KEY};
use crate::store::{CounterStore, StoreError};

/// Default pause between indexing cycles.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Store failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of indexing a batch of annotations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Annotations newly counted.
    pub indexed: usize,
    /// Annotations already indexed or without a resolvable scope.
    pub skipped: usize,
}

impl IndexOutcome {
    fn absorb(&mut self, other: IndexOutcome) {
        self.indexed += other.indexed;
        self.skipped += other.skipped;
    }
}

/// Summary of one indexing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
    /// Watermark after the cycle.
    pub watermark: Option<String>,
}

/// Maintains the counter index.
///
/// Holds the store for mutations; the fetcher is only needed for
/// [`run_cycle`](Self::run_cycle) and [`run`](Self::run).
#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn CounterStore>,
    fetcher: Option<Arc<dyn AnnotationFetcher>>,
}

impl Indexer {
    /// Indexer that only applies mutations handed to it.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            fetcher: None,
        }
    }

    /// Indexer that can also pull changes from `fetcher`.
    pub fn with_fetcher(store: Arc<dyn CounterStore>, fetcher: Arc<dyn AnnotationFetcher>) -> Self {
        Self {
            store,
            fetcher: Some(fetcher),
        }
    }

    /// Count each annotation not already indexed.
    ///
    /// Annotations whose scope cannot be resolved are logged and skipped.
    pub async fn index_annotations(&self, annotations: &[Annotation]) -> Result<IndexOutcome, StoreError> {
        let mut outcome = IndexOutcome::default();
        for ann in annotations {
            outcome.absorb(self.index_one(ann).await?);
        }
        Ok(outcome)
    }

    async fn index_one(&self, ann: &Annotation) -> Result<IndexOutcome, StoreError> {
        let marker = marker_key(&ann.id);
        if self.store.get(&marker).await?.is_some() {
            return Ok(IndexOutcome {
                indexed: 0,
                skipped: 1,
            });
        }

        let scope_key = match scope_key_for_annotation(ann) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot index annotation {}: {}", ann.id, e);
                return Ok(IndexOutcome {
                    indexed: 0,
                    skipped: 1,
                });
            }
        };

        match self
            .store
            .record_indexed(&marker, &count_key(&scope_key), &scope_key)
            .await?
        {
            Some(count) => {
                debug!("Incremented {} to {}", scope_key, count);
                Ok(IndexOutcome {
                    indexed: 1,
                    skipped: 0,
                })
            }
            None => Ok(IndexOutcome {
                indexed: 0,
                skipped: 1,
            }),
        }
    }

    /// Remove an annotation from the index.
    ///
    /// Returns `false` if it was never indexed or has already been removed.
    pub async fn remove_annotation(&self, id: &str) -> Result<bool, StoreError> {
        match self.store.remove_indexed(&marker_key(id)).await? {
            Some(removed) => {
                debug!("Decremented {} to {}", removed.scope_key, removed.count);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn watermark(&self) -> Result<Option<String>, StoreError> {
        self.store.get(WATERMARK_KEY).await
    }

    /// Pull one round of changes from the fetcher and apply them.
    ///
    /// The watermark is persisted after every annotation that advances it,
    /// so an interrupted cycle resumes where it stopped. A fetch or store
    /// error ends the cycle early; everything applied before it is kept.
    pub async fn run_cycle(&self) -> Result<CycleReport, IndexError> {
        let Some(fetcher) = &self.fetcher else {
            return Ok(CycleReport::default());
        };

        let mut watermark = self.watermark().await?;
        let mut report = CycleReport::default();

        let since = watermark.clone();
        let mut added = fetcher.added_since(since.as_deref());
        while let Some(item) = added.next().await {
            let ann = item?;
            let outcome = self.index_one(&ann).await?;
            report.indexed += outcome.indexed;
            report.skipped += outcome.skipped;

            if watermark.as_deref().map_or(true, |w| ann.created.as_str() > w) {
                self.store.put(WATERMARK_KEY, &ann.created).await?;
                watermark = Some(ann.created);
            }
        }
        drop(added);

        let mut deleted = fetcher.deleted_since(since.as_deref());
        while let Some(item) = deleted.next().await {
            if self.remove_annotation(&item?).await? {
                report.removed += 1;
            }
        }

        report.watermark = watermark;
        Ok(report)
    }

    /// Run indexing cycles until `shutdown` turns true.
    ///
    /// Cycle failures are logged and the loop carries on after the usual
    /// pause.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        match &self.fetcher {
            Some(fetcher) => {
                info!("Indexer started (source: {}, interval: {:?})", fetcher.name(), interval);
                if !fetcher.supports_deletions() {
                    warn!(
                        "Source {} has no deletion feed; deletions are only applied via POST /delete/:id",
                        fetcher.name()
                    );
                }
            }
            None => {
                warn!("Indexer has no fetcher configured, nothing to do");
                return;
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if report.indexed > 0 || report.removed > 0 => info!(
                    "Indexed {} annotations, removed {}, skipped {} (watermark: {})",
                    report.indexed,
                    report.removed,
                    report.skipped,
                    report.watermark.as_deref().unwrap_or("none")
                ),
                Ok(report) => debug!("No new annotations ({} skipped)", report.skipped),
                Err(e) => warn!("Indexing cycle failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Indexer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::stream::{self, StreamExt as _};

    use crate::fetcher::{AnnotationStream, DeletionStream};
    use crate::store::InMemoryCounterStore;

    fn ann(id: &str, shared: bool, created: &str) -> Annotation {
        Annotation {
            id: id.into(),
            uri: "https://x.test/p".into(),
            groupid: "g1".into(),
            userid: "acct:alice@x.test".into(),
            is_shared: shared,
            created: created.into(),
        }
    }

    /// Serves a fixed feed, optionally failing after the first `fail_after` items.
    struct FixedFetcher {
        added: Vec<Annotation>,
        deleted: Vec<String>,
        fail_after: Option<usize>,
        seen_watermarks: Mutex<Vec<Option<String>>>,
    }

    impl FixedFetcher {
        fn new(added: Vec<Annotation>) -> Self {
            Self {
                added,
                deleted: Vec::new(),
                fail_after: None,
                seen_watermarks: Mutex::new(Vec::new()),
            }
        }
    }

    impl AnnotationFetcher for FixedFetcher {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn supports_deletions(&self) -> bool {
            true
        }

        fn added_since<'a>(&'a self, watermark: Option<&'a str>) -> AnnotationStream<'a> {
            self.seen_watermarks
                .lock()
                .unwrap()
                .push(watermark.map(str::to_string));

            let mut items: Vec<Result<Annotation, FetchError>> = self
                .added
                .iter()
                .filter(|a| watermark.map_or(true, |w| a.created.as_str() > w))
                .cloned()
                .map(Ok)
                .collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(FetchError::Decode {
                    url: "fixed".into(),
                    message: "boom".into(),
                }));
            }
            stream::iter(items).boxed()
        }

        fn deleted_since<'a>(&'a self, _watermark: Option<&'a str>) -> DeletionStream<'a> {
            stream::iter(self.deleted.clone().into_iter().map(Ok)).boxed()
        }
    }

    fn memory_indexer() -> (Indexer, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        (Indexer::new(store.clone()), store)
    }

    async fn count(store: &InMemoryCounterStore, key: &str) -> i64 {
        store.sum(&[key.to_string()]).await.unwrap()
    }

    #[tokio::test]
    async fn indexes_private_annotation_under_owner() {
        let (indexer, store) = memory_indexer();
        let outcome = indexer
            .index_annotations(&[ann("a1", false, "t1")])
            .await
            .unwrap();

        assert_eq!(outcome, IndexOutcome { indexed: 1, skipped: 0 });
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 1);
        assert_eq!(
            store.get("ann|a1").await.unwrap().as_deref(),
            Some("https://x.test/p|u:alice")
        );
    }

    #[tokio::test]
    async fn shared_annotation_uses_separate_group_counter() {
        let (indexer, store) = memory_indexer();
        indexer
            .index_annotations(&[ann("a1", false, "t1"), ann("a2", true, "t2")])
            .await
            .unwrap();

        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 1);
        assert_eq!(count(&store, "count|https://x.test/p|g:g1").await, 1);
    }

    #[tokio::test]
    async fn indexing_twice_counts_once() {
        let (indexer, store) = memory_indexer();
        let a1 = ann("a1", false, "t1");

        indexer.index_annotations(&[a1.clone()]).await.unwrap();
        let again = indexer.index_annotations(&[a1]).await.unwrap();

        assert_eq!(again, IndexOutcome { indexed: 0, skipped: 1 });
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (indexer, store) = memory_indexer();
        indexer
            .index_annotations(&[ann("a1", false, "t1")])
            .await
            .unwrap();

        assert!(indexer.remove_annotation("a1").await.unwrap());
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 0);
        assert!(!indexer.remove_annotation("a1").await.unwrap());
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 0);
        assert!(!indexer.remove_annotation("never-indexed").await.unwrap());
    }

    #[tokio::test]
    async fn unresolvable_owner_is_skipped() {
        let (indexer, store) = memory_indexer();
        let mut bad = ann("a1", false, "t1");
        bad.userid = "alice".into();

        let outcome = indexer.index_annotations(&[bad]).await.unwrap();
        assert_eq!(outcome, IndexOutcome { indexed: 0, skipped: 1 });
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cycle_advances_watermark() {
        let store = Arc::new(InMemoryCounterStore::new());
        let fetcher = Arc::new(FixedFetcher::new(vec![
            ann("a1", false, "2018-01-01"),
            ann("a2", true, "2018-01-02"),
        ]));
        let indexer = Indexer::with_fetcher(store.clone(), fetcher.clone());

        let report = indexer.run_cycle().await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.watermark.as_deref(), Some("2018-01-02"));
        assert_eq!(
            store.get(WATERMARK_KEY).await.unwrap().as_deref(),
            Some("2018-01-02")
        );

        let second = indexer.run_cycle().await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(
            *fetcher.seen_watermarks.lock().unwrap(),
            vec![None, Some("2018-01-02".to_string())]
        );
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.put(WATERMARK_KEY, "2018-06-01").await.unwrap();

        // A source that ignores the watermark replays older items.
        struct Replaying(Vec<Annotation>);
        impl AnnotationFetcher for Replaying {
            fn name(&self) -> &'static str {
                "replaying"
            }
            fn added_since<'a>(&'a self, _w: Option<&'a str>) -> AnnotationStream<'a> {
                stream::iter(self.0.clone().into_iter().map(Ok)).boxed()
            }
        }

        let indexer = Indexer::with_fetcher(
            store.clone(),
            Arc::new(Replaying(vec![
                ann("old", false, "2018-01-01"),
                ann("new", false, "2018-07-01"),
                ann("mid", false, "2018-03-01"),
            ])),
        );

        let report = indexer.run_cycle().await.unwrap();
        assert_eq!(report.indexed, 3);
        assert_eq!(
            store.get(WATERMARK_KEY).await.unwrap().as_deref(),
            Some("2018-07-01")
        );
    }

    #[tokio::test]
    async fn fetch_failure_keeps_progress() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut fetcher = FixedFetcher::new(vec![
            ann("a1", false, "2018-01-01"),
            ann("a2", false, "2018-01-02"),
            ann("a3", false, "2018-01-03"),
        ]);
        fetcher.fail_after = Some(2);
        let indexer = Indexer::with_fetcher(store.clone(), Arc::new(fetcher));

        assert!(matches!(
            indexer.run_cycle().await,
            Err(IndexError::Fetch(_))
        ));
        assert_eq!(
            store.get(WATERMARK_KEY).await.unwrap().as_deref(),
            Some("2018-01-02")
        );
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 2);
    }

    #[tokio::test]
    async fn cycle_applies_deletions() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut fetcher = FixedFetcher::new(vec![ann("a1", false, "t1")]);
        fetcher.deleted = vec!["a1".into(), "unknown".into()];
        let indexer = Indexer::with_fetcher(store.clone(), Arc::new(fetcher));

        let report = indexer.run_cycle().await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(InMemoryCounterStore::new());
        let indexer = Indexer::with_fetcher(
            store.clone(),
            Arc::new(FixedFetcher::new(vec![ann("a1", false, "t1")])),
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            indexer.run(Duration::from_secs(3600), rx).await;
        });
        // Wait for the first cycle to land, then stop the loop mid-sleep.
        for _ in 0..100 {
            if store.get(WATERMARK_KEY).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("indexer did not stop")
            .unwrap();
        assert_eq!(count(&store, "count|https://x.test/p|u:alice").await, 1);
    }
}
