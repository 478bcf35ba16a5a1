use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use std::sync::Arc;

/// Stream-broker serves named, append-only streams of newline-delimited
/// records over HTTP, with long-poll reads of newly-appended records.
#[derive(clap::Parser, Debug)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,
    /// Maximum duration, in milliseconds, of a long-poll read which finds no new records.
    #[arg(long, env = "LONG_POLL_TIMEOUT_MS", default_value = "30000")]
    long_poll_timeout_ms: u64,
    /// Directory under which streams are stored.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: std::path::PathBuf,
    /// Upper bound on the body of a single read response.
    #[arg(long, env = "MAX_READ_BYTES", default_value = "1048576")]
    max_read_bytes: u64,

    #[command(flatten)]
    log: stream_broker::logging::LogArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    stream_broker::logging::init_logging(&args.log);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!(?args, "started!");

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(
    Args {
        host,
        port,
        long_poll_timeout_ms,
        data_dir,
        max_read_bytes,
        log: _,
    }: Args,
) -> anyhow::Result<()> {
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let store = stream_broker::Store::open(&data_dir)
        .with_context(|| format!("failed to open data directory {data_dir:?}"))?;

    let app = Arc::new(stream_broker::App {
        store,
        long_poll_timeout: std::time::Duration::from_millis(long_poll_timeout_ms),
        max_read_bytes: max_read_bytes.max(1),
        prometheus: Some(prometheus),
    });

    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT])
        .expose_headers([
            axum::http::HeaderName::from_static(proto_streams::STREAM_OFFSET),
            axum::http::HeaderName::from_static(proto_streams::STREAM_NEXT_OFFSET),
            axum::http::HeaderName::from_static(proto_streams::STREAM_UP_TO_DATE),
        ]);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;

    tracing::info!(addr = ?listener.local_addr()?, "listening");

    // Share-able future which completes when the broker should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let router = stream_broker::build_router(app)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
