//! Keywarden vault server binary: configuration, TLS, signal handling.

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use keywarden_server::auth::TokenAuthority;
use keywarden_server::storage::Storage;
use keywarden_server::{config, server, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// Grace period for in-flight requests during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::ServerConfig::from_flags_and_env()?;
    cfg.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(cfg.log_level.parse()?))
        .init();

    let storage = Storage::open(&cfg.db_dsn, cfg.max_secret_size)
        .map_err(|e| anyhow::anyhow!("failed to open store: {e}"))?;

    let key: [u8; 32] = cfg.server_key.as_bytes().try_into().expect("validated");
    let tokens = Arc::new(TokenAuthority::new(
        key,
        Duration::from_secs(cfg.token_ttl_secs),
    ));

    let state = AppState {
        storage: storage.clone(),
        tokens,
    };
    let app = server::build_router(state);

    let addr: SocketAddr = cfg.address.parse()?;
    let handle = Handle::new();

    // Signal handling: cancel the server, then wait for it to drain.
    tokio::spawn(wait_for_shutdown_signal(handle.clone()));

    tracing::info!(%addr, tls = !cfg.disable_tls, "starting keywarden server");

    if cfg.disable_tls {
        tracing::warn!("TLS is disabled; serving cleartext connections");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let tls = RustlsConfig::from_pem_file(
            cfg.tls_cert.as_ref().expect("validated"),
            cfg.tls_key.as_ref().expect("validated"),
        )
        .await?;
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    // The RPC side has stopped; release the store before reporting done.
    drop(storage);
    tracing::info!("database and RPC stopped");

    Ok(())
}

/// Block until SIGINT, SIGTERM or SIGQUIT, then trigger graceful shutdown.
async fn wait_for_shutdown_signal(handle: Handle) {
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigquit.recv() => tracing::info!("received SIGQUIT"),
    }

    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
