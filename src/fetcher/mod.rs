//! Upstream change feeds for the indexer.
//!
//! An [`AnnotationFetcher`] produces the annotations created since a
//! watermark, oldest first, and the ids deleted since it. Two sources:
//!
//! - [`PollingFetcher`] polls the search API (low throughput, no date filter)
//! - [`BulkIndexFetcher`] pages through the search index in creation order
//!
//! Neither source exposes deletions, so [`AnnotationFetcher::deleted_since`]
//! is empty for both. Deletions reach the index only through the
//! `POST /delete/:id` endpoint.

mod bulk;
mod polling;

pub use bulk::{BulkIndexConfig, BulkIndexFetcher};
pub use polling::PollingFetcher;

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::api::ApiError;
use crate::models::Annotation;

/// Errors from fetching upstream changes.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("POST {url} failed: {status}, {details}")]
    Status {
        url: String,
        status: u16,
        details: String,
    },
    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Annotations added since a watermark, ascending by creation time.
pub type AnnotationStream<'a> = BoxStream<'a, Result<Annotation, FetchError>>;

/// Ids of annotations deleted since a watermark.
pub type DeletionStream<'a> = BoxStream<'a, Result<String, FetchError>>;

/// Source of upstream annotation changes.
///
/// Each call returns a fresh, finite stream that the caller drives to
/// completion. Streams are not resumable across calls; the watermark is
/// the only state carried between them.
pub trait AnnotationFetcher: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether [`deleted_since`](Self::deleted_since) reports real deletions.
    fn supports_deletions(&self) -> bool {
        false
    }

    /// Annotations created after `watermark` (or all, when `None`).
    fn added_since<'a>(&'a self, watermark: Option<&'a str>) -> AnnotationStream<'a>;

    /// Annotation ids deleted after `watermark`.
    fn deleted_since<'a>(&'a self, _watermark: Option<&'a str>) -> DeletionStream<'a> {
        stream::empty().boxed()
    }
}
