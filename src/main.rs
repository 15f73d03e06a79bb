use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use pagesmith::chat::ChatService;
use pagesmith::config::Settings;
use pagesmith::provider::ModelClient;
use pagesmith::server::{self, AppState};
use pagesmith::stores::{SqliteStore, VectorBackend};
use pagesmith::training::TrainingOrchestrator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let settings = Settings::from_env()?;

    let store: Arc<dyn VectorBackend> = Arc::new(
        SqliteStore::open(&settings.database_path, settings.embedding_dimension).await?,
    );
    let client = ModelClient::new(&settings.provider_base_url, &settings.provider_api_key)
        .with_models(&settings.embedding_model, &settings.chat_model);

    let trainer = Arc::new(
        TrainingOrchestrator::new(store.clone(), client.clone())
            .with_concurrency(settings.embed_concurrency),
    );
    let chat = Arc::new(ChatService::new(
        store.clone(),
        client,
        settings.chat_options(),
    )?);

    let router = server::router(AppState { chat, trainer });
    let listener = TcpListener::bind(settings.bind_address).await?;
    tracing::info!(address = %settings.bind_address, "serving chat and training endpoints");
    axum::serve(listener, router).await?;

    Ok(())
}
