//! Assembles the registry, pipeline, and HTTP router into a running server,
//! and owns graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::info;

use crate::config::AppConfig;
use crate::db::{self, Connection};
use crate::reader::Reader;
use crate::registry::StreamRegistry;
use crate::writer::Writer;
use crate::{admission::AdmissionFilter, handlers, pipeline::Pipeline};

/// Shared across every HTTP handler invocation: the in-memory registry
/// cache, a stateless reader, and the pooled read-side database sessions
/// (§5: "HTTP read-side handlers are served from a thread pool; each
/// handler obtains a pooled reader client").
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub reader: Arc<Reader>,
    pub pool: db::Pool,
    pub record_size: usize,
    pub trace_merge_tolerance: std::time::Duration,
}

pub async fn run(config: AppConfig) -> eyre::Result<()> {
    info!(bind = %config.server.bind_address, port = config.server.port, "starting seismo-store");

    let credentials: db::Credentials = (&config.database).into();
    let registry = Arc::new(StreamRegistry::new(config.database.schema.clone()));

    {
        let mut conn = Connection::connect(credentials.clone())?;
        let loaded = registry.load_all(&mut conn)?;
        info!(loaded, "loaded stream registry from catalog");
    }

    let admission = Arc::new(AdmissionFilter::new(
        config.admission.max_future_time,
        config.admission.max_expired_time,
        config.admission.buffer_sizing(),
    ));
    let writer = Arc::new(Writer::new(
        seismo_common::codec::Compression::Best,
        config.retention.retention_duration,
    ));

    let pipeline = Pipeline::spawn(
        admission.clone(),
        registry.clone(),
        writer.clone(),
        credentials.clone(),
        config.feed.max_queue_size,
        config.server.thread_count.max(1),
    );
    // A concrete `FeedDriver` (out of CORE scope, §1) would call
    // `pipeline.producer().send(packet)` from its own callback thread.

    let log_interval = config.admission.log_interval;
    let rejection_log_admission = admission.clone();
    let log_running = Arc::new(AtomicBool::new(true));
    {
        let running = log_running.clone();
        std::thread::spawn(move || {
            while running.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(log_interval);
                rejection_log_admission.rejection_log().drain_and_log();
            }
        });
    }

    let pool = db::pool::build_pool(credentials, config.server.thread_count.max(1) as u32)?;
    let state = Arc::new(AppState {
        registry,
        reader: Arc::new(Reader::new()),
        pool,
        record_size: config.feed.record_size,
        trace_merge_tolerance: config.server.trace_merge_tolerance,
    });

    let app = handlers::router().with_state(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_request(DefaultOnRequest::new().level(tracing::Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
    );

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    info!(addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log_running.store(false, std::sync::atomic::Ordering::Relaxed);
    pipeline.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c");
    };

    #[cfg(unix)]
    let term = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        },
        _ = term => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
