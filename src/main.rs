use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, TextEncoder};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

use kubechecks_core::appindex::AppIndex;
use kubechecks_core::cache::SnapshotCache;
use kubechecks_core::config::RuntimeConfig;
use kubechecks_core::metrics::{CoreMetrics, DiagnosticsHandle};
use kubechecks_core::providers::archive::ArchiveSnapshotProvider;
use kubechecks_core::providers::git::GitSnapshotProvider;
use kubechecks_core::scheduler::CheckScheduler;

/// Shared application state handed to every actix route. The webhook
/// receiver, VCS client, and deployment-platform client are collaborators
/// (spec.md §1 "Out of scope"); this binary wires up only the
/// constructable core — cache, index, scheduler — and exposes it for a
/// collaborator binary to drive.
#[derive(Clone)]
struct CoreState {
    cache: Arc<SnapshotCache>,
    app_index: Arc<AppIndex>,
    scheduler: Arc<CheckScheduler>,
    metrics: CoreMetrics,
    diagnostics: DiagnosticsHandle,
}

#[get("/metrics")]
async fn metrics(_req: HttpRequest) -> impl Responder {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed encoding prometheus metrics");
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(state: Data<CoreState>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(state.diagnostics.snapshot().await)
}

fn config_path() -> PathBuf {
    std::env::var("KUBECHECKS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("kubechecks.toml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logger = tracing_subscriber::fmt::layer();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();

    #[cfg(feature = "telemetry")]
    let telemetry_layer =
        tracing_opentelemetry::layer().with_tracer(kubechecks_core::telemetry::init_tracer());
    #[cfg(feature = "telemetry")]
    let collector = Registry::default().with(telemetry_layer).with(logger).with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(logger).with(env_filter);

    tracing::subscriber::set_global_default(collector).expect("setting global tracing subscriber");

    let path = config_path();
    let config = match RuntimeConfig::load(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "fatal: could not load config");
            std::process::exit(1);
        }
    };

    let cache = SnapshotCache::new(config.repo_cache.ttl);
    cache.spawn_background_tasks().await;
    let state_cache_shutdown = cache.clone();

    let app_index = Arc::new(AppIndex::new());
    let git_provider = Arc::new(GitSnapshotProvider::new(
        PathBuf::from(&config.repo_cache.dir),
        config.repo_cache.shallow,
    ));
    let archive_provider = Arc::new(ArchiveSnapshotProvider::new(PathBuf::from(&config.archive_cache.dir)));
    let scheduler = CheckScheduler::new(
        config.scheduler.clone(),
        app_index.clone(),
        cache.clone(),
        git_provider,
        archive_provider,
        config.archive_mode,
    );

    let state = CoreState {
        cache,
        app_index,
        scheduler,
        metrics: CoreMetrics::new(),
        diagnostics: DiagnosticsHandle::new(),
    };

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")
    .expect("cannot bind to 0.0.0.0:8080")
    .shutdown_timeout(5);

    info!("kubechecks-core listening on 0.0.0.0:8080");
    let result = server.run().await;
    state_cache_shutdown.shutdown().await;
    result?;
    Ok(())
}
