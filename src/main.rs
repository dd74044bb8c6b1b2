use axum::routing::{delete, get, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use rag_agent::api;
use rag_agent::config::Config;
use rag_agent::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    tracing::info!(
        "Correction loop: {} variant(s), {} retr(y/ies), rerank top {}",
        config.pipeline.num_query_variations,
        config.pipeline.max_retries,
        config.pipeline.top_k_rerank
    );

    let state = AppState::new(config.clone())?;
    tracing::info!(
        "Loaded {} document(s), {} chunk(s)",
        state.documents.read().len(),
        state.corpus.num_chunks()
    );

    let app = Router::new()
        .route("/api/query", post(api::query::query))
        .route("/api/query-stream", post(api::query::query_stream))
        .route("/api/documents", get(api::documents::list_documents))
        .route("/api/documents", post(api::documents::add_document))
        .route("/api/documents/{id}", delete(api::documents::delete_document))
        .route("/api/metrics", get(api::metrics::get_metrics))
        .route("/api/metrics/reset", post(api::metrics::reset_metrics))
        .route("/api/health", get(api::metrics::health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
