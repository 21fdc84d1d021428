//! HTTP service for annotation counts.
//!
//! Endpoints:
//! - `GET /count?url=<URL>` - annotations on a URL visible to the caller
//! - `POST /delete/:id` - remove an annotation from the index
//! - `GET /health` - liveness check

mod handlers;
mod routes;

pub use routes::create_router;

use std::future::Future;
use std::net::SocketAddr;

use crate::aggregator::CountAggregator;
use crate::indexer::Indexer;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: CountAggregator,
    pub indexer: Indexer,
}

impl AppState {
    pub fn new(aggregator: CountAggregator, indexer: Indexer) -> Self {
        Self {
            aggregator,
            indexer,
        }
    }
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, host: &str, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
