//! Dump loading command.

use std::path::Path;

use console::style;

use crate::config::Settings;
use crate::indexer::Indexer;
use crate::loader::load_file;

/// Index every annotation in a dump file.
pub async fn cmd_load(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let store = settings.create_store().await?;
    let indexer = Indexer::new(store);

    println!("{} Loading {}", style("→").cyan(), path.display());
    let report = load_file(path, &indexer).await?;

    println!(
        "  {} {} annotations indexed from {} blocks ({} already indexed or skipped)",
        style("✓").green(),
        report.indexed,
        report.blocks,
        report.skipped
    );
    if report.bad_blocks > 0 || report.bad_rows > 0 {
        println!(
            "  {} {} unreadable blocks, {} undecodable rows",
            style("!").yellow(),
            report.bad_blocks,
            report.bad_rows
        );
    }
    Ok(())
}
