use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dist_lock::{LockClient, RedisLeaseStore};
use file_ops::{FileOps, RootDir};
use fos::config::{Cli, Config};
use fos::http::{serve, AppState};
use fos::rpc::RpcHandler;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    fos::init_logging();

    let args = Cli::parse();
    let config = Config::load(args)?;
    tracing::info!(
        "version: {}, root: {}, coordinator: {}:{}, listening on {}",
        env!("CARGO_PKG_VERSION"),
        config.root_dir,
        config.redis_host,
        config.redis_port,
        config.listen,
    );

    let root = RootDir::new(&config.root_dir).context("validating root directory")?;
    let store = RedisLeaseStore::connect(
        &config.redis_host,
        config.redis_port,
        &config.redis_password,
    )
    .await
    .context("connecting to the lock coordinator")?;
    let locks = LockClient::new(Arc::new(store));

    let ops = FileOps::new(root.clone(), locks.clone());
    let state = Arc::new(AppState {
        rpc: RpcHandler::with_timeout(ops, config.request_timeout),
        locks,
        root,
        rpc_path: config.rpc_path,
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!("serving on {}", config.listen);

    let shutdown = CancellationToken::new();
    let server_task = tokio::task::spawn(serve(listener, state, shutdown.clone()));

    // Wait until we receive a signal
    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigquit = tokio::signal::unix::signal(SignalKind::quit())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    tracing::info!("terminating on signal");

    // Stop accepting, then give in-flight requests a bounded drain window.
    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), server_task).await {
        Ok(Ok(result)) => {
            result?;
            tracing::info!("joined HTTP server task");
        }
        Ok(Err(e)) => {
            tracing::error!("error joining HTTP server task: {e}");
        }
        Err(_) => {
            tracing::warn!("timed out joining HTTP server task");
            // Fall through; request handlers still in flight will see a torn
            // connection when the process exits.
        }
    }

    Ok(())
}
