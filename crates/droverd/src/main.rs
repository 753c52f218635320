mod http;

use anyhow::{bail, Context, Result};
use clap::Parser;
use drovercore::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// droverd - supervisor for a fleet of TCP console devices
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON config files, merged in order (later files win)
    #[arg(required = true)]
    config: Vec<PathBuf>,

    /// Validate configuration (including scripts and regexes) and exit
    #[arg(long)]
    check: bool,

    /// Log filter, e.g. "info" or "drovercore=debug" (overrides DROVER_LOG)
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(spec) => EnvFilter::try_new(spec).context("bad --log filter")?,
        None => EnvFilter::try_from_env("DROVER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tree = droverconf::load_files(&cli.config).context("failed to load configuration")?;
    let server = droverconf::ServerConfig::from_tree(&tree)?;
    let engine = Arc::new(Engine::from_tree(&tree).context("failed to configure devices")?);

    if cli.check {
        println!("config ok");
        return Ok(());
    }
    if server.listen.is_empty() {
        bail!("no listen addresses configured (config.listen)");
    }

    let reactor = {
        let engine = Arc::clone(&engine);
        std::thread::Builder::new()
            .name("reactor".into())
            .spawn(move || {
                if let Err(e) = engine.run_reactor() {
                    error!(error = %e, "reactor failed");
                }
            })
            .context("failed to spawn reactor thread")?
    };

    let threads = server
        .listen_threads
        .unwrap_or_else(|| (num_cpus::get() * 2).max(5));
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let result = rt.block_on(serve(Arc::clone(&engine), &server));

    engine.request_shutdown();
    if reactor.join().is_err() {
        error!("reactor thread panicked");
    }
    result
}

async fn serve(engine: Arc<Engine>, server: &droverconf::ServerConfig) -> Result<()> {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // signal handler flips the quit flag and tells every listener to drain
    {
        let engine = Arc::clone(&engine);
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutting down");
            engine.request_shutdown();
            let _ = shutdown_tx.send(());
        });
    }

    let app = http::router(engine);
    let mut servers = Vec::new();
    for addr in &server.listen {
        if addr.ssl {
            warn!(host = %addr.host, port = addr.port, "ssl listeners are not supported, skipping");
            continue;
        }
        let bind = format!("{}:{}", addr.host, addr.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to listen on {bind}"))?;
        info!(addr = %bind, "listening");

        let app = app.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
        }));
    }
    if servers.is_empty() {
        bail!("all configured listeners were skipped");
    }

    for s in servers {
        s.await??;
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigquit.recv() => info!("received SIGQUIT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
