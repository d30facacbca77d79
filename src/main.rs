use std::sync::Arc;

use task_relay::adapters::{AdapterRegistry, SinkThrottle};
use task_relay::classifier::{AnalysisCache, CachedClassifier, Classifier, LlmClassifier};
use task_relay::config::RelayConfig;
use task_relay::ingress::{ingress_routes, IngressState};
use task_relay::mentions::MentionResolver;
use task_relay::pipeline::{Processor, ProcessorDeps};
use task_relay::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env();

    // Read the classifier API key from the environment
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let db_path =
        std::env::var("TASK_RELAY_DB_PATH").unwrap_or_else(|_| "./data/task-relay.db".to_string());

    eprintln!("task-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhooks: http://{}/webhook/{{platform}}", config.bind_addr);
    eprintln!("   Reprocess: http://{}/api/discussions/{{id}}/reprocess", config.bind_addr);
    eprintln!("   Database: {db_path}\n");

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: failed to open store at {db_path}: {e}");
                std::process::exit(1);
            }),
    );

    // ── Adapters + classifier ───────────────────────────────────────────
    let registry = Arc::new(AdapterRegistry::with_defaults());

    let cache = AnalysisCache::new(config.classifier_cache_ttl, config.classifier_cache_entries);
    let classifier: Arc<dyn Classifier> = Arc::new(CachedClassifier::new(
        Arc::new(LlmClassifier::new(secrecy::SecretString::from(api_key))),
        cache,
    ));

    let resolver = Arc::new(MentionResolver::new(Arc::clone(&store)));
    let throttle = SinkThrottle::new(config.sink_min_interval);

    // ── Pipeline ────────────────────────────────────────────────────────
    let processor = Processor::new(
        &config,
        ProcessorDeps {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            classifier,
            resolver,
            throttle,
        },
    );

    // ── Ingress ─────────────────────────────────────────────────────────
    let state = Arc::new(IngressState {
        store,
        registry,
        processor,
    });
    let app = ingress_routes(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Ingress listening");
    axum::serve(listener, app).await?;

    Ok(())
}
