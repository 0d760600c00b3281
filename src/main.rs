//! CRUxDrive API server binary.
//!
//! File bytes live in an S3 bucket and move through pre-signed URLs; this
//! process handles Google sign-in, bearer tokens, per-user and per-group key
//! spaces, file locks and shares. Metadata is kept in SQLite.

mod api;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod groups;
mod http;
mod identity;
mod keys;
mod limiter;
mod locks;
mod logging;
mod objects;
mod router;
mod shares;
mod store;
mod tls;
mod token;
mod tree;
mod version;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::auth::AuthConfig;
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::identity::GoogleVerifier;
use crate::limiter::AttemptLimiter;
use crate::objects::{S3ObjectStore, SharedObjectStore, create_s3_client};
use crate::store::MetadataStore;
use crate::token::TokenSigner;

shadow!(build);

/// Starts the CRUxDrive server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let store = Arc::new(
        MetadataStore::open(&args.database).map_err(|err| std::io::Error::other(err.to_string()))?,
    );
    let client = create_s3_client(args.s3_endpoint.as_deref(), &args.region).await;
    let objects: SharedObjectStore = Arc::new(S3ObjectStore::new(
        client,
        args.bucket.clone(),
        Duration::from_secs(args.presign_ttl_secs),
    ));
    let auth_config = Arc::new(AuthConfig {
        signer: TokenSigner::new(&args.jwt_secret),
        verifier: Arc::new(GoogleVerifier::new(args.google_client_id.clone())),
        allowed_domain: args.allowed_email_domain.clone(),
        token_ttl: Duration::from_secs(args.token_ttl_secs),
        trust_forwarded: args.trust_forwarded,
        login_limiter: AttemptLimiter::new(
            Duration::from_secs(args.login_window_secs),
            args.login_max_attempts,
            Duration::from_secs(args.login_lockout_secs),
        ),
        password_limiter: AttemptLimiter::new(
            Duration::from_secs(args.login_window_secs),
            args.login_max_attempts,
            Duration::from_secs(args.login_lockout_secs),
        ),
    });

    let app = router::build_router(
        store,
        objects,
        auth_config.clone(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    spawn_background_tasks(auth_config);
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let server = async {
        match tls_config {
            Some(tls_config) => {
                info!("🔒 Starting HTTPS server at {}", addr);
                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle.clone())
                    .serve(service)
                    .await
            }
            None => {
                info!("🚀 Starting HTTP server at {}", addr);
                axum_server::bind(addr)
                    .handle(handle.clone())
                    .serve(service)
                    .await
            }
        }
    };

    tokio::spawn(shutdown_signal(handle.clone()));
    server.await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
