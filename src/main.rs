use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;

use llm_filter::api::{AppState, api_routes};
use llm_filter::channels::{
    AmqpSource, IngestSource, Ingestor, PushSource, StdinSource, SupervisorPolicy,
    spawn_ingest_supervisor,
};
use llm_filter::config::ServiceConfig;
use llm_filter::llm::{InferenceBackend, InferenceGateway, InferenceSlot, OllamaBackend};
use llm_filter::pipeline::processor::FilterProcessor;
use llm_filter::pipeline::prompts::PromptSource;
use llm_filter::pipeline::scheduler::{BatchScheduler, spawn_batch_scheduler};
use llm_filter::pipeline::store::{CorrelationStore, TaskBuffer};
use llm_filter::sink::HttpSink;

/// Readiness check attempts against the inference server at startup.
const READY_TRIES: u32 = 10;

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

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    eprintln!("🔎 LLM Filter v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} @ {}", config.ollama.model, config.ollama.base_url);
    eprintln!("   Core endpoint: {}", config.sink.endpoint);
    eprintln!(
        "   Prompts: {}, {}",
        config.prompts.filter.display(),
        config.prompts.summary.display()
    );
    eprintln!(
        "   Batch: every {}ms, chunk size {}, {} attempts per call",
        config.pipeline.batch_interval.as_millis(),
        config.pipeline.chunk_size,
        config.pipeline.max_retries
    );
    eprintln!("   API: http://{}/process", config.listen_addr);

    // ── Inference backend ───────────────────────────────────────────────
    let ollama = OllamaBackend::new(&config.ollama)?;
    ollama
        .wait_until_ready(READY_TRIES, Duration::from_secs(1))
        .await
        .context("inference server did not come up")?;
    ollama
        .ensure_model()
        .await
        .context("failed to provision model")?;
    let backend: Arc<dyn InferenceBackend> = Arc::new(ollama);

    let gateway = InferenceGateway::new(
        backend,
        config.pipeline.max_retries,
        config.pipeline.retry_backoff,
    );
    let processor = Arc::new(FilterProcessor::new(
        gateway,
        InferenceSlot::new(),
        config.pipeline.chunk_size,
    ));
    let prompts = PromptSource::Files(config.prompts.clone());

    // ── Batch pipeline ──────────────────────────────────────────────────
    let store = CorrelationStore::new();
    let buffer = TaskBuffer::new();
    let scheduler = Arc::new(BatchScheduler::new(
        Arc::clone(&store),
        Arc::clone(&buffer),
        Arc::clone(&processor),
        Arc::new(HttpSink::new(&config.sink)),
        prompts.clone(),
    ));
    let (mut scheduler_handle, scheduler_shutdown) =
        spawn_batch_scheduler(Arc::clone(&scheduler), config.pipeline.batch_interval);

    // ── Ingestion ───────────────────────────────────────────────────────
    let ingestor = Ingestor::new(Arc::clone(&store), Arc::clone(&buffer));
    let policy = SupervisorPolicy {
        reconnect_backoff: config.pipeline.reconnect_backoff,
        max_reconnects: None,
    };

    let push = Arc::new(PushSource::new());
    let push_router = push.router();
    let mut sources: Vec<Arc<dyn IngestSource>> = vec![push];
    if let Some(amqp) = &config.amqp {
        eprintln!("   Queue: {} @ {}", amqp.queue, amqp.url);
        sources.push(Arc::new(AmqpSource::new(amqp.clone())));
    }
    if config.ingest_stdin {
        sources.push(Arc::new(StdinSource::new()));
    }
    let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
    eprintln!("   Sources: {}\n", names.join(", "));
    for source in sources {
        spawn_ingest_supervisor(source, ingestor.clone(), policy.clone());
    }

    // ── HTTP API ────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        processor,
        prompts,
        store,
        buffer,
        scheduler: Some(scheduler),
    })
    .merge(push_router);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "HTTP API started");

    tokio::select! {
        result = axum::serve(listener, app) => result.context("HTTP server failed")?,
        _ = &mut scheduler_handle => {
            tracing::error!("Batch scheduler stopped unexpectedly");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    // Let an in-flight tick finish its dispatch before exiting.
    scheduler_shutdown.store(true, Ordering::Relaxed);
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Batch scheduler task failed");
    }

    Ok(())
}
