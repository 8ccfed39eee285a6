use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use keywell_crypto::Ed25519Verifier;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use keywell_server::api::{self, AppState};
use keywell_server::{ChannelNotifier, KeyStore, ReplenishmentEvent, ServerArgs, SqliteKeyStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("keywell-server starting");

    let args = ServerArgs::parse();
    let config = args.directory_config();

    if args.db.as_os_str() != ":memory:" {
        if let Some(parent) = args.db.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db dir {}", parent.display()))?;
        }
    }

    let store = SqliteKeyStore::open(&args.db, args.pool_size)
        .context("failed to open key database")?;
    let store: Arc<dyn KeyStore> = Arc::new(store);

    // Replenishment events go to the push collaborator; until one is wired in
    // they are drained and logged here.
    let (notify_tx, notify_rx) = mpsc::channel::<ReplenishmentEvent>(args.notify_queue);
    tokio::spawn(replenishment_delivery_loop(notify_rx));

    let state = Arc::new(AppState::new(
        store,
        Arc::new(Ed25519Verifier),
        Arc::new(ChannelNotifier::new(notify_tx)),
        config,
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = api::router(Arc::clone(&state)).layer(cors);
    let internal_app = api::internal_router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let internal_listener = tokio::net::TcpListener::bind(args.internal_listen)
        .await
        .with_context(|| format!("failed to bind {}", args.internal_listen))?;

    tracing::info!(
        listen = %args.listen,
        internal_listen = %args.internal_listen,
        db = %args.db.display(),
        "keywell-server ready"
    );

    // One ctrl-c stops both listeners.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let public = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(shutdown_rx.clone()))
            .await
    };
    let internal = async {
        axum::serve(internal_listener, internal_app)
            .with_graceful_shutdown(stopped(shutdown_rx.clone()))
            .await
    };
    tokio::try_join!(public, internal).context("server error")?;

    tracing::info!("keywell-server stopped");
    Ok(())
}

async fn replenishment_delivery_loop(mut rx: mpsc::Receiver<ReplenishmentEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(
            user = %event.user_id,
            remaining = event.remaining_count,
            "replenishment requested"
        );
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("keywell-server shutting down");
}
