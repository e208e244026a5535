use std::{env, future::Future, io, sync::Arc};

use anyhow::{Context, anyhow};
use config::Config;
use ledger::Ledger;
use reconciler::reconcile;
use tokio::net::TcpListener;
use tracing::{error, info};
use web::{AppState, is_reserved_context, router};
use workload::KubeWorkloadSource;

mod config;
mod error;
mod image;
mod ledger;
mod model;
mod reconciler;
mod web;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        database = %config.database.url,
        namespace = ?config.namespace,
        "Loaded configuration"
    );

    let args = env::args().skip(1).collect::<Vec<_>>();
    let args = args.iter().map(String::as_str).collect::<Vec<_>>();
    match args.as_slice() {
        [] => serve(config).await,
        ["migrate"] => {
            let ledger = open_ledger(&config).await?;
            ledger.close().await;
            info!("Version ledger migrated");
            Ok(())
        }
        ["reconcile", context] => reconcile_once(config, context).await,
        _ => {
            let message = format!(
                "invalid arguments: {}, expected no arguments, `migrate` or `reconcile <context>`",
                args.join(" ")
            );
            error!("{message}");
            Err(anyhow!(message))
        }
    }
}

async fn open_ledger(config: &Config) -> anyhow::Result<Ledger> {
    let options = config.database.connect_options()?;
    let ledger = Ledger::connect(options, config.database.max_connections)
        .await
        .context("Can't open the version ledger")?;
    ledger
        .migrate()
        .await
        .context("Can't migrate the version ledger")?;
    Ok(ledger)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let ledger = open_ledger(&config).await?;
    let source = Arc::new(KubeWorkloadSource::new(config.namespace.clone()));
    let state = AppState::new(ledger.clone(), source).context("Can't load page templates")?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Can't listen on {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    let shutdown = shutdown_signal().context("Can't listen for shutdown signals")?;

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    ledger.close().await;
    info!("Stopped");

    Ok(())
}

async fn reconcile_once(config: Config, context: &str) -> anyhow::Result<()> {
    if is_reserved_context(context) {
        let message = format!("{context} is a reserved name and can't be used as a context");
        error!("{message}");
        return Err(anyhow!(message));
    }

    let ledger = open_ledger(&config).await?;
    let source = KubeWorkloadSource::new(config.namespace.clone());

    let result = reconcile(&source, &ledger, context).await;
    ledger.close().await;

    let updated = result.with_context(|| format!("Reconciliation of {context} failed"))?;
    println!("{}", serde_json::to_string_pretty(&updated)?);

    Ok(())
}

/// Resolves on SIGINT or SIGTERM. The SIGTERM handler is installed before this returns.
#[cfg(unix)]
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Can't listen for ctrl-c: {e}");
                    std::future::pending::<()>().await;
                }
            }
            _ = terminate.recv() => {}
        }
        info!("Shutting down...");
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Can't listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutting down...");
    })
}
