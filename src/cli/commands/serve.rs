//! Count server command.

use console::style;
use tracing::warn;

use super::shutdown_signal;
use crate::aggregator::CountAggregator;
use crate::config::Settings;
use crate::indexer::Indexer;
use crate::server::AppState;

/// Port used when the bind address names only a host.
const DEFAULT_PORT: u16 = 8001;

/// Start the count server, optionally with the indexer alongside it.
pub async fn cmd_serve(settings: &Settings, with_indexer: bool) -> anyhow::Result<()> {
    let (host, port) = parse_bind_address(&settings.bind)?;

    println!("{} Connecting to counter store...", style("→").cyan());
    let store = settings.create_store().await?;
    println!("  {} Store ready", style("✓").green());

    let api = settings.create_api().await?;
    let aggregator =
        CountAggregator::new(store.clone(), api).with_profile_ttl(settings.profile_ttl);

    let shutdown = shutdown_signal();

    let indexer_task = if with_indexer {
        let fetcher = settings.create_fetcher().await?;
        let indexer = Indexer::with_fetcher(store.clone(), fetcher);
        let interval = settings.index_interval;
        let rx = shutdown.clone();
        println!("{} Starting indexer", style("→").cyan());
        Some(tokio::spawn(async move { indexer.run(interval, rx).await }))
    } else {
        None
    };

    println!(
        "{} Starting notecount server at http://{}:{}",
        style("→").cyan(),
        host,
        port
    );
    println!("  Press Ctrl+C to stop");

    let mut server_shutdown = shutdown.clone();
    let state = AppState::new(aggregator, Indexer::new(store));
    let served = crate::server::serve(state, &host, port, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .await;

    if let Some(task) = indexer_task {
        if let Err(e) = task.await {
            warn!("Indexer task ended abnormally: {}", e);
        }
    }

    served
}

/// Parse a bind address that can be:
/// - Just a port: "8001" -> 127.0.0.1:8001
/// - Just a host: "0.0.0.0" -> 0.0.0.0:8001
/// - Host and port: "0.0.0.0:8001" -> 0.0.0.0:8001
fn parse_bind_address(bind: &str) -> anyhow::Result<(String, u16)> {
    if let Ok(port) = bind.parse::<u16>() {
        return Ok(("127.0.0.1".to_string(), port));
    }

    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
        anyhow::bail!("Invalid port in bind address: {}", bind);
    }

    Ok((bind.to_string(), DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_forms() {
        assert_eq!(
            parse_bind_address("9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            parse_bind_address("0.0.0.0").unwrap(),
            ("0.0.0.0".to_string(), 8001)
        );
        assert_eq!(
            parse_bind_address("0.0.0.0:8080").unwrap(),
            ("0.0.0.0".to_string(), 8080)
        );
        assert!(parse_bind_address("localhost:http").is_err());
    }
}
