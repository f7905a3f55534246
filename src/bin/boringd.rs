//! Daemon entrypoint: binds the control socket, serves `Open`/`Close`/`List`
//! requests against a shared `TunnelRegistry`, and exits cleanly on SIGTERM.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use boring_tunnel::daemon::{paths, server};
use boring_tunnel::forwarding::TunnelRegistry;

fn init_logging() {
    let log_path = paths::log_path();
    let dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("boringd.log"));
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked so the worker thread outlives this function; the daemon itself
    // only ever exits via process termination.
    Box::leak(Box::new(guard));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_logging();

    let socket_path = paths::socket_path();
    let listener = match server::bind(&socket_path).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to start daemon: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!("boringd listening on {}", socket_path.display());
    let registry = Arc::new(TunnelRegistry::new());

    let serve_registry = registry.clone();
    let serve_handle = tokio::spawn(async move {
        server::serve(listener, serve_registry).await;
    });

    wait_for_shutdown_signal().await;
    tracing::info!("boringd shutting down, closing all tunnels");

    serve_handle.abort();
    registry.close_all().await;
    let _ = std::fs::remove_file(&socket_path);

    std::process::ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
