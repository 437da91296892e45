#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use book_batch::{FileJobStore, JobRegistry, JobStore};
use book_cache::{EdgeCache, InMemoryKvBackend, UnifiedCache, UnifiedCacheConfig};
use book_config::{load_config, BookConfig};
use book_core::ProviderName;
use book_daemon::{build_app, AppState, ProviderSet};
use book_orchestrator::Orchestrator;
use book_providers::{EnvSecretResolver, HttpProviderClient, SecretResolver, SecretSource};
use book_ratelimit::RateLimiter;
use book_stream::StreamRegistry;
use book_telemetry::MetricsCollector;

#[derive(Parser, Debug)]
#[command(name = "book-daemon", version, about = "Book metadata HTTP control plane: search, batch enrichment, progress streaming")]
struct Args {
    /// Overrides `bindAddr` from the loaded configuration.
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Root directory for persisted batch job state.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    #[arg(long)]
    debug: bool,
}

fn provider_client(
    name: ProviderName,
    env_var: &str,
    default_url: &str,
    secret_store: &str,
    timeout: Duration,
    resolver: Arc<dyn SecretResolver>,
) -> Arc<dyn book_providers::ProviderClient> {
    let base_url = std::env::var(env_var).unwrap_or_else(|_| default_url.to_string());
    Arc::new(HttpProviderClient::new(
        name,
        base_url,
        timeout,
        SecretSource::Indirect {
            store: secret_store.to_string(),
            key: "api-key".to_string(),
        },
        resolver,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("book_daemon=debug,book_core=debug,book_cache=debug,book_batch=debug,book_orchestrator=debug,info")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let env: BTreeMap<String, String> = std::env::vars().collect();
    let (mut config, warnings): (BookConfig, _) =
        load_config(args.config.as_deref(), &env).with_context(|| "loading configuration")?;
    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let resolver: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver);
    let timeout = config.provider.timeout();
    let providers = ProviderSet {
        primary: provider_client(
            ProviderName::Primary,
            "BOOK_PRIMARY_PROVIDER_URL",
            "https://primary.example.invalid",
            "primary",
            timeout,
            resolver.clone(),
        ),
        secondary: provider_client(
            ProviderName::Secondary,
            "BOOK_SECONDARY_PROVIDER_URL",
            "https://secondary.example.invalid",
            "secondary",
            timeout,
            resolver.clone(),
        ),
        cover: provider_client(
            ProviderName::Cover,
            "BOOK_COVER_PROVIDER_URL",
            "https://cover.example.invalid",
            "cover",
            timeout,
            resolver.clone(),
        ),
        ai_vision: provider_client(
            ProviderName::AiVision,
            "BOOK_AI_VISION_PROVIDER_URL",
            "https://ai-vision.example.invalid",
            "ai_vision",
            timeout,
            resolver,
        ),
    };

    let cache = UnifiedCache::new(
        EdgeCache::new(),
        Arc::new(InMemoryKvBackend::new()),
        config.cache.clone(),
        UnifiedCacheConfig::default(),
        MetricsCollector::new(),
    );

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(args.data_dir.clone()));
    let batch = JobRegistry::new(store, StreamRegistry::new(), config.batch.clone());

    let rate_limiter = RateLimiter::new(config.rate_limit.default_per_minute, Duration::from_secs(60));

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState {
        cache,
        providers,
        orchestrator: Orchestrator::default(),
        batch,
        rate_limiter,
        config,
        metrics: MetricsCollector::new(),
    });

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {bind_addr}"))?;
    tracing::info!(bind = %bind_addr, data_dir = %args.data_dir.display(), "book-daemon listening");
    axum::serve(listener, app).await.context("serve")
}
