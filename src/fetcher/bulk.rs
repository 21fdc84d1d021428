//! Bulk search index source.
//!
//! Reads the annotation index directly, in ascending creation order, one
//! batch at a time. Used for initial backfill and high-volume sync.

use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{AnnotationFetcher, AnnotationStream, FetchError};
use crate::models::{Annotation, IndexRecord};

/// Settings for [`BulkIndexFetcher`].
#[derive(Debug, Clone)]
pub struct BulkIndexConfig {
    /// Root URL of the search server.
    pub url: String,
    /// Index holding annotations.
    pub index: String,
    /// Hits requested per batch.
    pub batch_size: usize,
    /// Pause between batches, to bound load on the search server.
    pub batch_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for BulkIndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "hypothesis".to_string(),
            batch_size: 1000,
            batch_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Position of an in-progress scan.
struct Cursor {
    /// Only hits created strictly after this are requested.
    after: Option<String>,
    first: bool,
    exhausted: bool,
}

/// One response from the index.
struct Batch {
    /// Raw hit count, decodable or not.
    hits: usize,
    /// Latest `created` over all raw hits.
    newest: Option<String>,
    records: Vec<IndexRecord>,
}

/// Pages through the search index by creation time.
///
/// Hits flagged `deleted` are skipped, not reported as deletions. Hits that
/// fail to decode are skipped too, but still advance the cursor. Errors are
/// not retried here: a failed request ends the stream with the error.
pub struct BulkIndexFetcher {
    client: Client,
    config: BulkIndexConfig,
}

impl BulkIndexFetcher {
    pub fn new(config: BulkIndexConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client, config })
    }

    fn search_url(&self) -> String {
        format!(
            "{}/{}/_search",
            self.config.url.trim_end_matches('/'),
            self.config.index
        )
    }

    /// Build the search body for the batch following `after`.
    fn batch_query(&self, after: Option<&str>) -> Value {
        let mut query = json!({
            "sort": [{"created": {"order": "asc"}}],
            "size": self.config.batch_size,
        });
        if let Some(after) = after {
            query["query"] = json!({"range": {"created": {"gt": after}}});
        }
        query
    }

    async fn fetch_batch(&self, after: Option<&str>) -> Result<Batch, FetchError> {
        let url = self.search_url();
        let query = self.batch_query(after);

        let response = self.client.post(&url).json(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
                details,
            });
        }

        let body: Value = response.json().await.map_err(|e| FetchError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let hits = body["hits"]["hits"]
            .as_array()
            .ok_or_else(|| FetchError::Decode {
                url: url.clone(),
                message: "response has no hits.hits array".to_string(),
            })?;

        // Taken over raw hits so undecodable ones still move the cursor.
        let newest = hits
            .iter()
            .filter_map(|hit| hit["_source"]["created"].as_str())
            .max()
            .map(str::to_string);

        let records = hits
            .iter()
            .filter_map(|hit| match Annotation::from_index_hit(hit) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable index hit: {}", e);
                    None
                }
            })
            .collect();

        Ok(Batch {
            hits: hits.len(),
            newest,
            records,
        })
    }

    /// Fetch the next batch and advance the cursor. `None` ends the scan.
    async fn next_batch(
        &self,
        mut cursor: Cursor,
    ) -> Result<Option<(Vec<Annotation>, Cursor)>, FetchError> {
        if cursor.exhausted {
            return Ok(None);
        }
        if !cursor.first && !self.config.batch_delay.is_zero() {
            tokio::time::sleep(self.config.batch_delay).await;
        }
        cursor.first = false;

        let batch = self.fetch_batch(cursor.after.as_deref()).await?;
        if batch.hits == 0 {
            return Ok(None);
        }
        let records = batch.records;

        match &cursor.after {
            Some(after) => info!(
                "Fetched {} annotations from index added since {}",
                records.len(),
                after
            ),
            None => info!("Fetched {} annotations from index", records.len()),
        }

        match batch.newest {
            // An index that ignores the range filter would loop forever.
            Some(newest) if cursor.after.as_deref().is_some_and(|after| newest.as_str() <= after) => {
                warn!("Index returned no hits newer than {}, stopping scan", newest);
                cursor.exhausted = true;
            }
            Some(newest) => cursor.after = Some(newest),
            None => {
                warn!("Batch of {} hits carried no creation times, stopping scan", batch.hits);
                cursor.exhausted = true;
            }
        }

        let live: Vec<Annotation> = records
            .into_iter()
            .filter_map(|record| match record {
                IndexRecord::Live(ann) => Some(ann),
                IndexRecord::Deleted { .. } => None,
            })
            .collect();
        debug!("{} live annotations in batch", live.len());

        Ok(Some((live, cursor)))
    }
}

impl AnnotationFetcher for BulkIndexFetcher {
    fn name(&self) -> &'static str {
        "search-index"
    }

    fn added_since<'a>(&'a self, watermark: Option<&'a str>) -> AnnotationStream<'a> {
        let cursor = Cursor {
            after: watermark.map(str::to_string),
            first: true,
            exhausted: false,
        };

        stream::try_unfold(cursor, move |cursor| self.next_batch(cursor))
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, FetchError>)))
            .try_flatten()
            .boxed()
    }
}
