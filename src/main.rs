// src/main.rs
// Process entry: config, storage bootstrap, background loops, HTTP server

use anyhow::{Context, Result};
use ba_agent::agent::Agent;
use ba_agent::api::{self, AppState};
use ba_agent::auth::AuthService;
use ba_agent::config::{resolve_base_dir, ApiKeys, AppConfig};
use ba_agent::db::DatabasePool;
use ba_agent::filestore::{spawn_janitor, FileStore, LifecycleManager};
use ba_agent::llm::OpenAiCompatClient;
use ba_agent::memory::{
    spawn_watcher, IndexRotation, MemoryIndexer, OpenAiEmbeddings, SearchOptions,
};
use ba_agent::sandbox::DockerSandbox;
use ba_agent::tools::ToolRunner;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ba-agent", about = "Conversational business-analysis agent")]
struct Args {
    /// Storage base directory (overrides config and platform default)
    #[arg(long, env = "BA_STORAGE_DIR")]
    base_dir: Option<PathBuf>,

    /// Bind address, e.g. 127.0.0.1:8300
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ba_agent=debug".into()),
        )
        .init();

    let args = Args::parse();
    let probe_base = resolve_base_dir(args.base_dir.as_deref());
    let config = AppConfig::load(&probe_base);
    let base_dir = resolve_base_dir(
        args.base_dir
            .as_deref()
            .or(config.filestore.base_dir.as_deref()),
    );
    config
        .write_if_missing(&base_dir)
        .context("writing storage_config.json")?;
    info!("Storage base: {:?}", base_dir);

    let keys = ApiKeys::from_env();

    // File store (C1)
    let store = Arc::new(FileStore::open(base_dir.clone(), config.filestore.clone()).await?);

    // Memory index (C2)
    let search = &config.memory.search;
    let rotation = IndexRotation::new(
        base_dir.join(&config.memory.index_rotation.index_dir),
        config.memory.index_rotation.index_prefix.clone(),
        config.memory.index_rotation.max_size_mb,
    );
    let embeddings = keys.embedding.as_ref().map(|key| {
        Arc::new(OpenAiEmbeddings::new(
            config.llm.base_url.clone(),
            search.model.clone(),
            key.clone(),
        )) as Arc<dyn ba_agent::memory::EmbeddingProvider>
    });
    if embeddings.is_none() {
        warn!("No embedding key: hybrid search degrades to full-text only");
    }
    let indexer = Arc::new(MemoryIndexer::new(
        rotation,
        search.chunk_lines,
        search.chunk_overlap,
        true,
        embeddings,
    ));

    // Sandbox executor (C5)
    let sandbox = Arc::new(DockerSandbox::new(config.docker.clone()));
    if !sandbox.health_check().await {
        warn!("Docker is unavailable: sandbox tools will fail at call time");
    }

    // Tool dispatch
    let search_defaults = SearchOptions {
        max_results: search.max_results,
        min_score: search.min_score,
        source_filter: Some("memory".to_string()),
        use_hybrid: search.hybrid_enabled,
        vector_weight: search.vector_weight,
        text_weight: search.text_weight,
        context_lines: search.context_lines,
    };
    let runner = Arc::new(ToolRunner::new(
        store.clone(),
        indexer.clone(),
        sandbox,
        config.security.command_whitelist.clone(),
        search_defaults,
    ));

    // LLM bindings (chat + extractor)
    let api_key = keys.llm.clone().unwrap_or_default();
    let chat_client = Arc::new(OpenAiCompatClient::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        api_key.clone(),
        config.llm.temperature,
        config.llm.max_tokens,
        config.llm.context_window_tokens,
        Duration::from_secs(config.llm.timeout_secs),
    ));
    let extractor_client = keys.llm.as_ref().map(|_| {
        Arc::new(OpenAiCompatClient::new(
            config.llm.base_url.clone(),
            config.memory.flush.llm_model.clone(),
            api_key.clone(),
            0.3,
            2000,
            0,
            Duration::from_secs(config.memory.flush.llm_timeout_secs),
        )) as Arc<dyn ba_agent::llm::LlmClient>
    });

    // Agent loop (C6)
    let agent = Arc::new(Agent::new(
        chat_client,
        runner,
        store.clone(),
        config.memory.flush.clone(),
        config.llm.clone(),
        extractor_client,
    ));

    // Background loops: janitor (C1) and memory watcher (C4)
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let lifecycle = Arc::new(LifecycleManager::new(
        store.clone(),
        config.filestore.max_total_size_gb,
        config.filestore.cleanup_threshold_percent,
    ));
    let janitor = spawn_janitor(
        lifecycle,
        Duration::from_secs_f64(config.filestore.cleanup_interval_hours * 3600.0),
        shutdown_rx.clone(),
    );

    let watcher_handle = if config.memory.watcher.enabled {
        let watch_paths = config
            .memory
            .watcher
            .watch_paths
            .iter()
            .map(|p| base_dir.join(p))
            .collect();
        Some(spawn_watcher(
            indexer.clone(),
            watch_paths,
            Duration::from_secs_f64(config.memory.watcher.debounce_seconds),
            Duration::from_secs_f64(config.memory.watcher.check_interval_seconds),
            shutdown_rx.clone(),
        ))
    } else {
        None
    };

    // Auth collaborator
    let auth_pool = Arc::new(DatabasePool::open(&base_dir.join("users.db")).await?);
    let auth = Arc::new(AuthService::open(auth_pool).await?);

    // HTTP server
    let app = api::router(AppState {
        agent,
        store,
        auth,
        indexer,
        security: config.security.clone(),
    });
    let listen = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("Listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    // Stop background loops and let them drain.
    let _ = shutdown_tx.send(true);
    let _ = janitor.await;
    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(())
}
