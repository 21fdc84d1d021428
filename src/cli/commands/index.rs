//! Indexer command.

use console::style;

use super::shutdown_signal;
use crate::config::Settings;
use crate::indexer::Indexer;

/// Run the indexer until interrupted, or for a single cycle with `once`.
pub async fn cmd_index(settings: &Settings, once: bool) -> anyhow::Result<()> {
    let store = settings.create_store().await?;
    let fetcher = settings.create_fetcher().await?;
    let source = fetcher.name();
    let indexer = Indexer::with_fetcher(store, fetcher);

    if once {
        println!("{} Running one indexing cycle from {}", style("→").cyan(), source);
        let report = indexer.run_cycle().await?;
        println!(
            "  {} {} indexed, {} skipped, {} removed",
            style("✓").green(),
            report.indexed,
            report.skipped,
            report.removed
        );
        if let Some(watermark) = report.watermark {
            println!("  Watermark: {}", style(watermark).dim());
        }
        return Ok(());
    }

    println!(
        "{} Indexing from {} every {:?}",
        style("→").cyan(),
        source,
        settings.index_interval
    );
    println!("  Press Ctrl+C to stop");
    indexer.run(settings.index_interval, shutdown_signal()).await;
    Ok(())
}
