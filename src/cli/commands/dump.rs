//! Search API dump command.

use std::path::Path;

use console::style;
use tokio::io::{AsyncWrite, BufWriter};

use crate::config::Settings;
use crate::loader::{dump_search, DumpOptions};

/// Dump every search result the anonymous caller can see.
pub async fn cmd_dump(
    settings: &Settings,
    output: Option<&Path>,
    concurrency: usize,
) -> anyhow::Result<()> {
    let api = settings.create_api().await?;
    let options = DumpOptions {
        concurrency,
        ..Default::default()
    };

    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(BufWriter::new(tokio::fs::File::create(path).await?)),
        None => Box::new(BufWriter::new(tokio::io::stdout())),
    };

    let report = dump_search(api.as_ref(), &mut out, &options).await?;

    // Progress goes to stderr so stdout stays a clean dump.
    eprintln!(
        "{} Dumped {} rows in {} pages",
        style("✓").green(),
        report.rows,
        report.pages
    );
    Ok(())
}
