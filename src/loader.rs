//! Offline dump and load of search results.
//!
//! A dump file is a sequence of search API responses, each pretty-printed
//! as JSON and followed by a line holding only the [`SENTINEL`]. Loading a
//! dump feeds every row through the indexer, which backfills a fresh store
//! without touching the live search index.

use std::path::Path;

use futures::future::join_all;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::api::{AnnotationApi, ApiError, SearchParams, SearchResponse};
use crate::indexer::Indexer;
use crate::models::Annotation;
use crate::store::StoreError;

/// Line separating responses in a dump file.
pub const SENTINEL: &str = "\"\"\"\"";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Search failed {attempts} rounds in a row: {source}")]
    Search {
        attempts: u32,
        #[source]
        source: ApiError,
    },
}

/// Totals from loading a dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Response blocks parsed.
    pub blocks: usize,
    /// Blocks that were not valid search responses.
    pub bad_blocks: usize,
    /// Rows that did not decode as annotations.
    pub bad_rows: usize,
    pub indexed: usize,
    pub skipped: usize,
}

/// Load a dump file from disk.
pub async fn load_file(path: &Path, indexer: &Indexer) -> Result<LoadReport, LoadError> {
    let file = tokio::fs::File::open(path).await?;
    load_dump(BufReader::new(file), indexer).await
}

/// Index every response block read from `reader`.
///
/// Blocks that fail to parse and rows that fail to decode are logged and
/// skipped. A trailing block without a sentinel is still loaded.
pub async fn load_dump<R>(reader: R, indexer: &Indexer) -> Result<LoadReport, LoadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut report = LoadReport::default();
    let mut lines = reader.lines();
    let mut block = String::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim() == SENTINEL {
            load_block(&block, indexer, &mut report).await?;
            block.clear();
        } else {
            block.push_str(&line);
            block.push('\n');
        }
    }
    load_block(&block, indexer, &mut report).await?;

    info!(
        "Loaded {} blocks: {} indexed, {} already indexed or skipped, {} bad rows",
        report.blocks, report.indexed, report.skipped, report.bad_rows
    );
    Ok(report)
}

async fn load_block(block: &str, indexer: &Indexer, report: &mut LoadReport) -> Result<(), LoadError> {
    if block.trim().is_empty() {
        return Ok(());
    }

    let response: SearchResponse = match serde_json::from_str(block) {
        Ok(response) => response,
        Err(e) => {
            warn!("Skipping unparseable dump block: {}", e);
            report.bad_blocks += 1;
            return Ok(());
        }
    };
    report.blocks += 1;

    let mut annotations = Vec::with_capacity(response.rows.len());
    for row in &response.rows {
        match Annotation::from_api_row(row) {
            Ok(ann) => annotations.push(ann),
            Err(e) => {
                warn!("Skipping undecodable dump row: {}", e);
                report.bad_rows += 1;
            }
        }
    }

    let outcome = indexer.index_annotations(&annotations).await?;
    report.indexed += outcome.indexed;
    report.skipped += outcome.skipped;
    debug!("Block {}: {} indexed so far", report.blocks, report.indexed);
    Ok(())
}

/// Settings for [`dump_search`].
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Rows requested per page.
    pub page_size: usize,
    /// Pages requested concurrently per round.
    pub concurrency: usize,
    /// Consecutive failed rounds before giving up.
    pub max_failed_rounds: u32,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            page_size: 200,
            concurrency: 10,
            max_failed_rounds: 5,
        }
    }
}

/// Totals from a dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpReport {
    pub pages: usize,
    pub rows: usize,
}

/// Page through the search API, newest first, writing each response to `out`.
///
/// Each round requests `concurrency` consecutive pages at once. A round with
/// any failed request is retried whole; the dump stops at the first empty
/// page. Pages may overlap if annotations are created mid-dump, which the
/// loader tolerates since indexing is idempotent.
pub async fn dump_search<W>(
    api: &dyn AnnotationApi,
    out: &mut W,
    options: &DumpOptions,
) -> Result<DumpReport, LoadError>
where
    W: AsyncWrite + Unpin,
{
    let concurrency = options.concurrency.max(1);
    let mut report = DumpReport::default();
    let mut offset = 0usize;
    let mut failed_rounds = 0u32;

    loop {
        let requests: Vec<SearchParams> = (0..concurrency)
            .map(|i| SearchParams::newest_first(offset + i * options.page_size, options.page_size))
            .collect();
        let results = join_all(requests.iter().map(|params| api.search(params))).await;

        let pages = match results.into_iter().collect::<Result<Vec<_>, _>>() {
            Ok(pages) => {
                failed_rounds = 0;
                pages
            }
            Err(e) => {
                failed_rounds += 1;
                warn!("Search round at offset {} failed: {}", offset, e);
                if failed_rounds >= options.max_failed_rounds {
                    return Err(LoadError::Search {
                        attempts: failed_rounds,
                        source: e,
                    });
                }
                continue;
            }
        };

        for page in pages {
            let rows = page.rows.len();
            write_block(out, &page).await?;
            report.pages += 1;

            if rows == 0 {
                out.flush().await?;
                info!("Dumped {} rows in {} pages", report.rows, report.pages);
                return Ok(report);
            }

            offset += rows;
            report.rows += rows;
            info!("Fetched {} of {} entries", offset, page.total);
        }
    }
}

async fn write_block<W>(out: &mut W, page: &SearchResponse) -> Result<(), LoadError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string_pretty(page)?;
    out.write_all(json.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.write_all(SENTINEL.as_bytes()).await?;
    out.write_all(b"\n").await?;
    Ok(())
}
