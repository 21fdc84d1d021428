//! Client for the annotation service's HTTP API.
//!
//! Provides the search endpoint used by the polling fetcher and the dump
//! tool, plus the profile and group lookups used to resolve a viewer.

mod client;

pub use client::{ApiClient, Routes};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Group, Profile};

/// Errors from the annotation service API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} failed: {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("API root does not advertise route '{0}'")]
    MissingRoute(String),
}

/// Query parameters for the search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchParams {
    pub offset: usize,
    pub limit: usize,
    pub sort: String,
    pub order: String,
}

impl SearchParams {
    /// Newest-first page starting at `offset`.
    pub fn newest_first(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            sort: "created".to_string(),
            order: "desc".to_string(),
        }
    }
}

/// One page of search results.
///
/// Rows are kept as raw JSON; decoding into annotations happens per row so
/// one malformed row does not discard the page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub total: u64,
}

/// Operations the indexer and aggregator need from the annotation service.
///
/// `auth` is the caller's `Authorization` header value, forwarded verbatim.
#[async_trait]
pub trait AnnotationApi: Send + Sync {
    async fn search(&self, params: &SearchParams) -> Result<SearchResponse, ApiError>;

    async fn profile(&self, auth: Option<&str>) -> Result<Profile, ApiError>;

    async fn groups(&self, auth: Option<&str>) -> Result<Vec<Group>, ApiError>;
}
