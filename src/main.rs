use batch_watermark::config::ServiceConfig;
use batch_watermark::infrastructure::{asset, staging};
use batch_watermark::services::archive::BatchArchiver;
use batch_watermark::services::watermark::ImageWatermarker;
use batch_watermark::services::worker::StagingSweeper;
use batch_watermark::{AppState, create_app};
use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the HTTP server
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// How often the staging sweeper runs, in minutes
    #[arg(long, default_value_t = 60)]
    sweep_interval_minutes: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initial Environment & Logging Setup
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batch_watermark=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Batch Watermark service...");

    let config = ServiceConfig::from_env();
    info!(
        "⚙️  Config: Max Files={}, Max Upload={}MB, Idle Timeout={}s, JPEG Quality={}",
        config.max_files,
        config.max_upload_size / 1024 / 1024,
        config.processing_timeout_secs,
        config.jpeg_quality
    );

    // 2. Fatal-on-failure infrastructure: the watermark and the staging dir
    let watermark = asset::setup_watermark(&config.watermark_path).await?;
    let staging_dir = staging::setup_staging_dir(&config.staging_dir).await?;
    let config = ServiceConfig {
        staging_dir: staging_dir.clone(),
        ..config
    };

    // 3. Setup Graceful Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // 4. Staging sweeper
    let sweeper = StagingSweeper::new(
        staging_dir,
        config.staging_cleanup_age(),
        Duration::from_secs(args.sweep_interval_minutes.max(1) * 60),
        shutdown_rx,
    );
    let sweeper_handle = tokio::spawn(sweeper.run());
    info!("👷 Staging sweeper initialized.");

    // 5. HTTP service
    let processor = Arc::new(ImageWatermarker::new(watermark, config.jpeg_quality));
    let state = AppState {
        archiver: Arc::new(BatchArchiver::new(processor)),
        config,
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &axum::http::Request<_>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        })
        .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
            info!("📥 {} {}", request.method(), request.uri());
        })
        .on_response(
            |response: &axum::http::Response<_>,
             latency: std::time::Duration,
             _span: &tracing::Span| {
                info!(
                    "📤 Finished in {:?} with status {}",
                    latency,
                    response.status()
                );
            },
        );

    let app = create_app(state).layer(trace_layer);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("✅ Server listening on: http://0.0.0.0:{}", args.port);
    info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", args.port);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("❌ Server runtime error: {}", e);
    }

    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;

    info!("👋 Exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
